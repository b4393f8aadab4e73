//! The narrow persistence port consumed by the core, plus an in-memory
//! adapter used by tests and as a buffering default.
//!
//! All writes are idempotent where a natural key exists; duplicate
//! observation inserts are silently ignored.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tracing::debug;

use sweep_types::{
    AnalysisRun, BgSnapshot, RunCounters, RunId, RunStatus, RunTrack, TrackId, TrackObservation,
    TrackRow, Transit, TransitFilter, TransitSummary, WorldCluster,
};

use crate::Result;

pub trait PersistencePort: Send + Sync {
    fn insert_bg_snapshot(&self, snapshot: &BgSnapshot) -> Result<i64>;
    /// Upsert by track id.
    fn insert_track(&self, track: &TrackRow) -> Result<()>;
    fn update_track(&self, track: &TrackRow) -> Result<()>;
    /// Idempotent on `(track_id, timestamp_ns)`.
    fn insert_track_observation(&self, observation: &TrackObservation) -> Result<()>;
    fn insert_cluster(&self, cluster: &WorldCluster) -> Result<i64>;
    fn insert_run(&self, run: &AnalysisRun) -> Result<()>;
    fn complete_run(&self, run_id: &RunId, stats: &RunCounters) -> Result<()>;
    fn update_run_status(&self, run_id: &RunId, status: RunStatus, msg: Option<&str>)
    -> Result<()>;
    /// Upsert by `(run_id, track_id)`.
    fn insert_run_track(&self, run_track: &RunTrack) -> Result<()>;
    fn insert_transit(&self, transit: &Transit) -> Result<i64>;
    fn list_transits(&self, filter: &TransitFilter) -> Result<Vec<Transit>>;
    fn transit_summary(&self, filter: &TransitFilter) -> Result<TransitSummary>;
}

#[derive(Default)]
struct MemoryStoreInner {
    bg_snapshots: Vec<BgSnapshot>,
    tracks: BTreeMap<TrackId, TrackRow>,
    observation_keys: BTreeSet<(TrackId, i64)>,
    observations: Vec<TrackObservation>,
    clusters: Vec<WorldCluster>,
    runs: BTreeMap<RunId, AnalysisRun>,
    run_tracks: BTreeMap<(RunId, TrackId), RunTrack>,
    transits: Vec<Transit>,
}

/// Keeps everything in process memory. The reference implementation of the
/// port semantics; also what the tests assert against.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bg_snapshots(&self) -> Vec<BgSnapshot> {
        self.inner.lock().bg_snapshots.clone()
    }

    pub fn tracks(&self) -> Vec<TrackRow> {
        self.inner.lock().tracks.values().cloned().collect()
    }

    pub fn observations(&self) -> Vec<TrackObservation> {
        self.inner.lock().observations.clone()
    }

    pub fn runs(&self) -> Vec<AnalysisRun> {
        self.inner.lock().runs.values().cloned().collect()
    }

    pub fn run_tracks(&self) -> Vec<RunTrack> {
        self.inner.lock().run_tracks.values().cloned().collect()
    }

    pub fn transits(&self) -> Vec<Transit> {
        self.inner.lock().transits.clone()
    }
}

impl PersistencePort for MemoryStore {
    fn insert_bg_snapshot(&self, snapshot: &BgSnapshot) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.bg_snapshots.push(snapshot.clone());
        Ok(inner.bg_snapshots.len() as i64 - 1)
    }

    fn insert_track(&self, track: &TrackRow) -> Result<()> {
        self.inner.lock().tracks.insert(track.track_id, track.clone());
        Ok(())
    }

    fn update_track(&self, track: &TrackRow) -> Result<()> {
        // Same upsert semantics as insert.
        self.insert_track(track)
    }

    fn insert_track_observation(&self, observation: &TrackObservation) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (observation.track_id, observation.timestamp_ns);
        if inner.observation_keys.insert(key) {
            inner.observations.push(observation.clone());
        } else {
            debug!(
                "duplicate observation for track {} at {} ignored",
                observation.track_id, observation.timestamp_ns
            );
        }
        Ok(())
    }

    fn insert_cluster(&self, cluster: &WorldCluster) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.clusters.push(cluster.clone());
        Ok(inner.clusters.len() as i64 - 1)
    }

    fn insert_run(&self, run: &AnalysisRun) -> Result<()> {
        self.inner.lock().runs.insert(run.run_id, run.clone());
        Ok(())
    }

    fn complete_run(&self, run_id: &RunId, stats: &RunCounters) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.status = RunStatus::Completed;
            run.counters = *stats;
        }
        Ok(())
    }

    fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        msg: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.status = status;
            run.error_message = msg.map(|m| m.to_string());
        }
        Ok(())
    }

    fn insert_run_track(&self, run_track: &RunTrack) -> Result<()> {
        self.inner
            .lock()
            .run_tracks
            .insert((run_track.run_id, run_track.track_id), run_track.clone());
        Ok(())
    }

    fn insert_transit(&self, transit: &Transit) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.transits.push(transit.clone());
        Ok(inner.transits.len() as i64 - 1)
    }

    fn list_transits(&self, filter: &TransitFilter) -> Result<Vec<Transit>> {
        Ok(self
            .inner
            .lock()
            .transits
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    fn transit_summary(&self, filter: &TransitFilter) -> Result<TransitSummary> {
        let inner = self.inner.lock();
        Ok(TransitSummary::from_transits(
            inner.transits.iter().filter(|t| filter.matches(t)),
        ))
    }
}
