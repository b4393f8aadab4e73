//! Periodic, threshold and final background-snapshot triggers.
//!
//! Owns a tick clock and ports to the model and the store; runs on its own
//! OS thread. Stop delivery performs one final flush before the thread
//! returns. Absent collaborators are logged, never fatal.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, select, tick};
use tracing::{debug, info, warn};

use sweep_types::SnapshotReason;

use crate::background_model::BackgroundModel;
use crate::store::PersistencePort;
use crate::Result;

pub struct BackgroundFlusher {
    stop_tx: Option<Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Synchronous snapshot, callable from any component at any time.
pub fn flush_now(
    model: &BackgroundModel,
    store: &dyn PersistencePort,
    reason: SnapshotReason,
) -> Result<i64> {
    model.snapshot(reason, store)
}

impl BackgroundFlusher {
    /// Start the flush loop. `change_threshold` of 0 disables the
    /// threshold trigger.
    pub fn spawn(
        model: Option<Arc<BackgroundModel>>,
        store: Option<Arc<dyn PersistencePort>>,
        interval: Duration,
        change_threshold: u64,
    ) -> Self {
        let (Some(model), Some(store)) = (model, store) else {
            warn!("background flusher not started: missing model or store");
            return Self {
                stop_tx: None,
                handle: None,
            };
        };

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("bg-flusher".to_string())
            .spawn(move || {
                let periodic = tick(interval);
                let threshold_check = tick((interval / 10).max(Duration::from_millis(100)));
                loop {
                    select! {
                        recv(periodic) -> _ => {
                            if let Err(e) = flush_now(&model, store.as_ref(), SnapshotReason::PeriodicUpdate) {
                                warn!("periodic background flush failed: {e}");
                            }
                        }
                        recv(threshold_check) -> _ => {
                            if change_threshold > 0
                                && model.changes_since_snapshot() >= change_threshold
                            {
                                debug!("change threshold reached; flushing");
                                if let Err(e) = flush_now(&model, store.as_ref(), SnapshotReason::ThresholdUpdate) {
                                    warn!("threshold background flush failed: {e}");
                                }
                            }
                        }
                        recv(stop_rx) -> _ => {
                            if let Err(e) = flush_now(&model, store.as_ref(), SnapshotReason::FinalFlush) {
                                warn!("final background flush failed: {e}");
                            }
                            info!("background flusher stopped");
                            break;
                        }
                    }
                }
            })
            .expect("spawn flusher thread");

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Signal stop and wait for the final flush.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // The thread may already be gone; that is fine.
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
