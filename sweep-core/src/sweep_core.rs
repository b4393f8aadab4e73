//! Roadside-LiDAR perception core.
//!
//! Five stages per frame: assembled sweeps are classified against the
//! adaptive background model, surviving foreground points are transformed to
//! the world frame and clustered, clusters feed the multi-target tracker,
//! confirmed tracks are classified, and the run coordinator persists tracks,
//! observations and transit records through the persistence port.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use sweep_types::{
    FrameNum, PolarPoint, RunCounters, RunId, SensorId, SnapshotReason, SourceType, SweepParams,
    TrackState, polar_to_sensor,
};

pub use sweep_types as types;

mod error;
pub use error::Error;

pub type Result<M> = std::result::Result<M, Error>;
pub type MyFloat = sweep_types::MyFloat;

mod frame_assembler;
pub use frame_assembler::{Frame, FrameAssembler};

mod background_model;
pub use background_model::{BackgroundModel, BackgroundStats, Heatmap, IngestReport};

mod regions;
pub use regions::{Region, RegionAccumulator, RegionMap, RegionTuning, VarianceCategory};

pub mod snapshot;

mod clusterer;
pub use clusterer::{Clusterer, WorldPoint, denoise};

mod tracking_core;
pub use tracking_core::{FrameUpdate, RetiredTrack, Track, Tracker};

mod classifier;
pub use classifier::{Classification, Classifier, RuleClassifier, TrackFeatures};

mod run_coordinator;
pub use run_coordinator::RunCoordinator;

mod flusher;
pub use flusher::{BackgroundFlusher, flush_now};

mod store;
pub use store::{MemoryStore, PersistencePort};

mod csv_store;
pub use csv_store::CsvStore;

mod publisher;
pub use publisher::{
    DebugOverlays, FrameBundle, NoopPublisher, TrackSnapshot, VisualiserPublisher,
    downsample_foreground,
};

/// Per-frame foreground extraction seam.
///
/// Background subtraction is the shipped implementation; alternative
/// extractors compose behind the same trait for evaluation harnesses.
pub trait ForegroundExtractor: Send + Sync {
    fn extract(&self, frame: &Frame) -> IngestReport;
}

impl ForegroundExtractor for BackgroundModel {
    fn extract(&self, frame: &Frame) -> IngestReport {
        self.ingest(frame)
    }
}

/// What one processed frame produced, for callers that poll progress.
#[derive(Debug, Clone, Copy)]
pub struct FrameSummary {
    pub frame: FrameNum,
    pub foreground_points: usize,
    pub clusters: usize,
    pub live_tracks: usize,
    pub settled: bool,
}

/// The wired L2..L6 pipeline for one sensor.
pub struct Pipeline {
    params: SweepParams,
    assembler: FrameAssembler,
    background: Arc<BackgroundModel>,
    clusterer: Clusterer,
    tracker: Tracker,
    classifier: RuleClassifier,
    runs: RunCoordinator,
    store: Arc<dyn PersistencePort>,
    publisher: Arc<dyn VisualiserPublisher>,
    flusher: Option<BackgroundFlusher>,
}

impl Pipeline {
    /// Validate `params` and wire the stages. `publisher` may be `None`.
    pub fn new(
        params: SweepParams,
        store: Arc<dyn PersistencePort>,
        publisher: Option<Arc<dyn VisualiserPublisher>>,
    ) -> Result<Self> {
        params.validate()?;
        info!(
            "pipeline for sensor {} ({} rings x {} bins)",
            params.sensor.sensor_id, params.sensor.rings, params.sensor.azimuth_bins
        );
        let background = Arc::new(BackgroundModel::new(
            &params.sensor,
            params.background.clone(),
            params.regions,
        ));
        Ok(Self {
            assembler: FrameAssembler::new(params.assembler.clone()),
            background,
            clusterer: Clusterer::new(params.clustering),
            tracker: Tracker::new(params.tracker),
            classifier: RuleClassifier::new(params.classifier),
            runs: RunCoordinator::new(params.sensor.sensor_id.clone(), store.clone()),
            store,
            publisher: publisher.unwrap_or_else(|| Arc::new(NoopPublisher)),
            flusher: None,
            params,
        })
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.params.sensor.sensor_id
    }

    pub fn background(&self) -> &Arc<BackgroundModel> {
        &self.background
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.runs.run_id()
    }

    /// Open a run and start the flusher.
    pub fn start(&mut self, source_type: SourceType, source_path: &str) -> Result<RunId> {
        let run_id = self
            .runs
            .start_run(source_type, source_path, self.params.params_json())?;
        let interval = Duration::from_nanos(self.params.background.snapshot_interval_ns.max(1) as u64);
        self.flusher = Some(BackgroundFlusher::spawn(
            Some(self.background.clone()),
            Some(self.store.clone()),
            interval,
            self.params.background.change_threshold_for_snapshot,
        ));
        Ok(run_id)
    }

    /// Feed one decoded polar point; runs the full frame path when the
    /// assembler closes a sweep.
    pub fn push_point(&mut self, point: PolarPoint) -> Result<Option<FrameSummary>> {
        match self.assembler.push(point)? {
            Some(frame) => Ok(Some(self.handle_frame(frame)?)),
            None => Ok(None),
        }
    }

    /// The per-frame callback: L3 background, L4 clustering, L5 tracking,
    /// L6 classification, persistence and publication.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<FrameSummary> {
        self.runs.record_frame();

        let report = self.background.ingest(&frame);
        if report.settled_now {
            if let Err(e) = self
                .background
                .snapshot(SnapshotReason::SettlingComplete, self.store.as_ref())
            {
                warn!("settling snapshot failed: {e}");
            }
        }

        // Foreground points to world frame.
        let pose = &self.params.sensor.world_pose;
        let mut world: Vec<WorldPoint> = Vec::with_capacity(report.foreground_points);
        for (i, pt) in frame.points.iter().enumerate() {
            if !report.mask[i] {
                continue;
            }
            // Malformed points are flagged foreground but have no geometry.
            if pt.channel < 1
                || pt.channel > self.params.sensor.rings
                || !pt.azimuth_deg.is_finite()
                || !pt.range_m.is_finite()
                || pt.range_m <= 0.0
            {
                continue;
            }
            let sensor_pt = polar_to_sensor(
                pt.range_m as f64,
                pt.azimuth_deg as f64,
                pt.elevation_deg as f64,
            );
            let world_pt = pose * sensor_pt;
            world.push(WorldPoint {
                x: world_pt.x,
                y: world_pt.y,
                z: world_pt.z,
                intensity: pt.intensity,
            });
        }
        let world = denoise(
            world,
            self.params.background.foreground_dbscan_eps,
            self.params.background.foreground_min_cluster_points,
        );

        let clusters = self.clusterer.cluster(&world, frame.end_ns);
        self.runs.record_clusters(clusters.len());

        let update = self.tracker.update(&clusters, frame.end_ns);
        if update.culled > 0 {
            debug!("culled {} tentative tracks for capacity", update.culled);
        }

        // Observation inserts are the only synchronous persistence on the
        // hot path; failures are logged and skipped.
        let mut touched: BTreeSet<sweep_types::TrackId> = BTreeSet::new();
        for observation in &update.observations {
            touched.insert(observation.track_id);
            if let Err(e) = self.store.insert_track_observation(observation) {
                warn!("observation insert failed: {e}");
            }
        }
        touched.extend(update.spawned.iter().copied());

        // (Re)classify confirmed tracks.
        for track in self.tracker.live_tracks() {
            if track.state == TrackState::Confirmed {
                let classification = self.classifier.classify(&track.features());
                self.tracker.set_classification(
                    track.id,
                    classification.class,
                    classification.confidence,
                );
            }
        }

        // Persist new and updated tracks.
        let sensor_id = self.params.sensor.sensor_id.clone();
        for track in self.tracker.live_tracks() {
            if !touched.contains(&track.id) {
                continue;
            }
            let row = track.to_row(&sensor_id);
            let result = match self.runs.record_track(&row) {
                Ok(true) => self.store.insert_track(&row),
                Ok(false) => self.store.update_track(&row),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                if e.is_fatal_persistence() {
                    return Err(e);
                }
                warn!("track upsert failed: {e}");
            }
        }

        // Retire deleted tracks; promote qualifying ones to transits.
        for retired in &update.deleted {
            let row = retired.track.to_row(&sensor_id);
            if let Err(e) = self.store.update_track(&row) {
                warn!("final track update failed: {e}");
            }
            match self.runs.retire_track(retired) {
                Ok(_) => {}
                Err(e) if e.is_fatal_persistence() => return Err(e),
                Err(e) => warn!("transit insert failed: {e}"),
            }
        }

        let summary = FrameSummary {
            frame: frame.frame,
            foreground_points: world.len(),
            clusters: clusters.len(),
            live_tracks: self.tracker.live_count(),
            settled: self.background.settled(),
        };
        self.publish(&frame, &world);
        Ok(summary)
    }

    fn publish(&self, frame: &Frame, world: &[WorldPoint]) {
        let samples: Vec<[f64; 3]> = world.iter().map(|p| [p.x, p.y, p.z]).collect();
        let tracks: Vec<TrackSnapshot> = self
            .tracker
            .live_tracks()
            .into_iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| TrackSnapshot {
                track_id: t.id,
                state: t.state,
                x: t.x(),
                y: t.y(),
                vx: t.vx(),
                vy: t.vy(),
                speed: t.speed(),
                heading_rad: t.heading_rad,
                class: t.class,
                class_confidence: t.class_confidence,
            })
            .collect();
        let overlays = if self.params.publisher.debug_overlays {
            let gate = self.params.tracker.gating_distance_squared.sqrt();
            Some(DebugOverlays {
                gating: tracks.iter().map(|t| (t.track_id, gate)).collect(),
                predictions: tracks.iter().map(|t| (t.track_id, t.x, t.y)).collect(),
            })
        } else {
            None
        };
        let bundle = FrameBundle {
            frame: frame.frame,
            start_ns: frame.start_ns,
            end_ns: frame.end_ns,
            foreground: downsample_foreground(&samples, &self.params.publisher),
            tracks,
            overlays,
        };
        self.publisher.publish(&bundle);
    }

    /// Drain the run: flush the assembler, retire every live track through
    /// the promotion rubric, stop the flusher (final snapshot) and close
    /// the run.
    pub fn stop(&mut self) -> Result<RunCounters> {
        let mut end_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        if let Some(frame) = self.assembler.finish() {
            end_ns = frame.end_ns;
            self.handle_frame(frame)?;
        }
        let sensor_id = self.params.sensor.sensor_id.clone();
        for retired in self.tracker.retire_all(end_ns) {
            let row = retired.track.to_row(&sensor_id);
            if let Err(e) = self.store.update_track(&row) {
                warn!("final track update failed: {e}");
            }
            if let Err(e) = self.runs.retire_track(&retired) {
                warn!("transit insert failed: {e}");
            }
        }
        if let Some(flusher) = self.flusher.take() {
            flusher.stop();
        }
        self.runs.complete_run()
    }

    /// Abort the run, marking it failed.
    pub fn fail(&mut self, reason: &str) -> Result<()> {
        if let Some(flusher) = self.flusher.take() {
            flusher.stop();
        }
        self.runs.fail_run(reason)
    }
}

/// Typed lookup of per-sensor pipelines, built at startup and handed through
/// the orchestration wiring instead of hiding behind process globals.
#[derive(Default)]
pub struct SensorRegistry {
    pipelines: std::collections::BTreeMap<SensorId, Pipeline>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        let sensor_id = pipeline.sensor_id().clone();
        if self.pipelines.insert(sensor_id.clone(), pipeline).is_some() {
            warn!("sensor {} re-registered; previous pipeline dropped", sensor_id);
        }
    }

    pub fn get_mut(&mut self, sensor_id: &SensorId) -> Option<&mut Pipeline> {
        self.pipelines.get_mut(sensor_id)
    }

    pub fn sensor_ids(&self) -> Vec<SensorId> {
        self.pipelines.keys().cloned().collect()
    }

    /// Tear down every pipeline, draining active runs.
    pub fn shutdown(&mut self) {
        let pipelines = std::mem::take(&mut self.pipelines);
        for (sensor_id, mut pipeline) in pipelines {
            match pipeline.stop() {
                Ok(_) => {}
                Err(Error::NoActiveRun) => {}
                Err(e) => warn!("sensor {sensor_id}: shutdown error: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invalid_params_refuse_start() {
        let mut params = SweepParams::default();
        params.clustering.eps_m = -1.0;
        let store = Arc::new(MemoryStore::new());
        assert!(Pipeline::new(params, store, None).is_err());
    }

    #[test]
    fn extractor_trait_object() {
        let params = SweepParams::default();
        let model = BackgroundModel::new(&params.sensor, params.background, params.regions);
        let extractor: &dyn ForegroundExtractor = &model;
        let frame = Frame {
            frame: FrameNum(0),
            points: vec![],
            start_ns: 0,
            end_ns: 0,
            min_azimuth_deg: 0.0,
            max_azimuth_deg: 0.0,
        };
        let report = extractor.extract(&frame);
        assert!(report.mask.is_empty());
    }
}
