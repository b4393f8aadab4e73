//! Per-sensor analysis-run lifecycle: run rows, counters, first-seen track
//! recording and transit promotion at track retirement.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use sweep_types::{
    AnalysisRun, RunCounters, RunId, RunStatus, RunTrack, SensorId, SourceType, TrackId, TrackRow,
    Transit,
};

use crate::store::PersistencePort;
use crate::tracking_core::RetiredTrack;
use crate::{Error, Result};

/// Unlabelled tracks must live at least this long to become a transit.
const PROMOTION_MIN_DURATION_S: f64 = 2.0;
const PROMOTION_MIN_OBSERVATIONS: u32 = 20;
const DEFAULT_QUALITY_SCORE: f64 = 0.7;

struct ActiveRun {
    run: AnalysisRun,
    seen_tracks: BTreeSet<TrackId>,
    started: Instant,
}

/// Concurrency-safe holder of the active run for one sensor.
pub struct RunCoordinator {
    sensor_id: SensorId,
    store: Arc<dyn PersistencePort>,
    inner: Mutex<Option<ActiveRun>>,
}

impl RunCoordinator {
    pub fn new(sensor_id: SensorId, store: Arc<dyn PersistencePort>) -> Self {
        Self {
            sensor_id,
            store,
            inner: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.inner.lock().as_ref().map(|a| a.run.run_id)
    }

    pub fn counters(&self) -> Option<RunCounters> {
        self.inner.lock().as_ref().map(|a| a.run.counters)
    }

    /// Open a new run; fails if one is already active.
    pub fn start_run(
        &self,
        source_type: SourceType,
        source_path: &str,
        params_json: String,
    ) -> Result<RunId> {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.as_ref() {
            return Err(Error::RunAlreadyActive {
                run_id: active.run.run_id,
            });
        }
        let run = AnalysisRun {
            run_id: RunId::random(),
            created_at: chrono::Utc::now(),
            source_type,
            source_path: source_path.to_string(),
            sensor_id: self.sensor_id.clone(),
            params_json,
            status: RunStatus::Running,
            counters: RunCounters::default(),
            error_message: None,
        };
        self.store.insert_run(&run)?;
        let run_id = run.run_id;
        info!("sensor {}: run {} started", self.sensor_id, run_id);
        *inner = Some(ActiveRun {
            run,
            seen_tracks: BTreeSet::new(),
            started: Instant::now(),
        });
        Ok(run_id)
    }

    pub fn record_frame(&self) {
        if let Some(active) = self.inner.lock().as_mut() {
            active.run.counters.total_frames += 1;
        }
    }

    pub fn record_clusters(&self, n: usize) {
        if let Some(active) = self.inner.lock().as_mut() {
            active.run.counters.total_clusters += n as u64;
        }
    }

    /// Record a track against the run; returns `true` on first sighting.
    pub fn record_track(&self, track: &TrackRow) -> Result<bool> {
        let run_track = {
            let mut inner = self.inner.lock();
            let Some(active) = inner.as_mut() else {
                return Ok(false);
            };
            if !active.seen_tracks.insert(track.track_id) {
                return Ok(false);
            }
            active.run.counters.total_tracks += 1;
            let quality = track.quality();
            RunTrack {
                run_id: active.run.run_id,
                track_id: track.track_id,
                class: track.class,
                class_confidence: track.class_confidence,
                observation_count: track.observation_count,
                occlusion_count: quality.occlusion_count,
                track_length_m: quality.track_length_m,
                duration_s: quality.duration_s,
                noise_ratio: quality.noise_ratio,
                spatial_coverage_m2: quality.spatial_coverage_m2,
            }
        };
        self.store.insert_run_track(&run_track)?;
        Ok(true)
    }

    /// Evaluate the promotion rubric for a retired track; persists and
    /// returns the transit id when promoted.
    pub fn retire_track(&self, retired: &RetiredTrack) -> Result<Option<i64>> {
        let track = &retired.track;

        let promoted = match track.user_label.as_deref() {
            Some(label) => {
                let label_good =
                    matches!(label, "good_vehicle" | "good_pedestrian" | "good_other");
                let quality_good = match track.quality_label.as_deref() {
                    None => true,
                    Some(q) => matches!(q, "perfect" | "good"),
                };
                label_good && quality_good
            }
            None => {
                track.duration_s() >= PROMOTION_MIN_DURATION_S
                    && track.observation_count >= PROMOTION_MIN_OBSERVATIONS
            }
        };
        if !promoted {
            debug!("track {} retired without promotion", track.id);
            return Ok(None);
        }

        let run_id = {
            let inner = self.inner.lock();
            match inner.as_ref() {
                Some(active) => active.run.run_id,
                None => {
                    warn!("track {} retired outside any run; transit dropped", track.id);
                    return Ok(None);
                }
            }
        };

        let quality_score = match track.quality_label.as_deref() {
            Some("perfect") => 1.0,
            Some("good") => 0.85,
            _ => DEFAULT_QUALITY_SCORE,
        };
        let row = track.to_row(&self.sensor_id);
        let transit = Transit {
            run_id,
            track_id: track.id,
            sensor_id: self.sensor_id.clone(),
            started_ns: track.first_ns,
            ended_ns: track.last_ns,
            class: track.class,
            class_confidence: track.class_confidence,
            speed_p50: track.speed_percentile(50.0),
            speed_p85: track.speed_percentile(85.0),
            speed_p95: track.speed_percentile(95.0),
            peak_speed: track.peak_speed,
            quality_score,
            avg_length: row.avg_length,
            avg_width: row.avg_width,
            avg_height: row.avg_height,
            observation_count: track.observation_count,
        };
        let transit_id = self.store.insert_transit(&transit)?;
        if let Some(active) = self.inner.lock().as_mut() {
            active.run.counters.total_transits += 1;
        }
        info!(
            "track {} promoted to transit {} ({})",
            track.id, transit_id, transit.class
        );
        Ok(Some(transit_id))
    }

    /// Close the run normally, writing aggregated statistics.
    pub fn complete_run(&self) -> Result<RunCounters> {
        let (run_id, counters) = {
            let mut inner = self.inner.lock();
            let Some(mut active) = inner.take() else {
                return Err(Error::NoActiveRun);
            };
            active.run.counters.processing_time_s = active.started.elapsed().as_secs_f64();
            (active.run.run_id, active.run.counters)
        };
        self.store.complete_run(&run_id, &counters)?;
        info!(
            "sensor {}: run {} completed ({} frames, {} tracks, {} transits)",
            self.sensor_id,
            run_id,
            counters.total_frames,
            counters.total_tracks,
            counters.total_transits
        );
        Ok(counters)
    }

    /// Close the run as failed.
    pub fn fail_run(&self, reason: &str) -> Result<()> {
        let run_id = {
            let mut inner = self.inner.lock();
            let Some(active) = inner.take() else {
                return Err(Error::NoActiveRun);
            };
            active.run.run_id
        };
        warn!("sensor {}: run {} failed: {}", self.sensor_id, run_id, reason);
        self.store
            .update_run_status(&run_id, RunStatus::Failed, Some(reason))
    }
}
