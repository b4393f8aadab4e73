//! Durable record adapter: a directory of gzipped CSV tables plus snapshot
//! blob files.
//!
//! Tables are append-only; for upsert-keyed tables (tracks, runs) the last
//! row per key wins at read time. `runs.csv` and `transits.csv` are written
//! uncompressed and flushed eagerly to maximise the chance they survive a
//! crash; high-volume tables stream through gzip.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use libflate::finish::AutoFinishUnchecked;
use libflate::gzip::Encoder;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use sweep_types::{
    AnalysisRun, BgSnapshot, RunCounters, RunId, RunStatus, RunTrack, SensorId, SnapshotReason,
    SourceType, TrackId, TrackObservation, TrackRow, Transit, TransitFilter, TransitSummary,
    WorldCluster,
};

use crate::store::PersistencePort;
use crate::{Error, Result};

pub const RUNS_CSV_FNAME: &str = "runs.csv";
pub const TRACKS_CSV_FNAME: &str = "tracks.csv.gz";
pub const TRACK_OBSERVATIONS_CSV_FNAME: &str = "track_observations.csv.gz";
pub const RUN_TRACKS_CSV_FNAME: &str = "run_tracks.csv.gz";
pub const TRANSITS_CSV_FNAME: &str = "transits.csv";
pub const CLUSTERS_CSV_FNAME: &str = "clusters.csv.gz";
pub const BG_SNAPSHOTS_CSV_FNAME: &str = "bg_snapshots.csv";
pub const BG_SNAPSHOTS_DIRNAME: &str = "bg_snapshots";
pub const STORE_METADATA_FNAME: &str = "store_metadata.json";

type CsvWriter = csv::Writer<Box<dyn Write + Send>>;

#[derive(Serialize)]
struct StoreMetadata {
    program: &'static str,
    version: &'static str,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct RunCsvRow<'a> {
    run_id: RunId,
    created_at: chrono::DateTime<chrono::Utc>,
    source_type: SourceType,
    source_path: &'a str,
    sensor_id: &'a SensorId,
    status: RunStatus,
    error_message: Option<&'a str>,
    total_frames: u64,
    total_clusters: u64,
    total_tracks: u64,
    total_transits: u64,
    processing_time_s: f64,
    params_json: &'a str,
}

fn run_csv_row(run: &AnalysisRun) -> RunCsvRow<'_> {
    RunCsvRow {
        run_id: run.run_id,
        created_at: run.created_at,
        source_type: run.source_type,
        source_path: &run.source_path,
        sensor_id: &run.sensor_id,
        status: run.status,
        error_message: run.error_message.as_deref(),
        total_frames: run.counters.total_frames,
        total_clusters: run.counters.total_clusters,
        total_tracks: run.counters.total_tracks,
        total_transits: run.counters.total_transits,
        processing_time_s: run.counters.processing_time_s,
        params_json: &run.params_json,
    }
}

#[derive(Serialize)]
struct ClusterCsvRow {
    cluster_id: i64,
    timestamp_ns: i64,
    x: f64,
    y: f64,
    z: f64,
    length: f64,
    width: f64,
    height: f64,
    height_p95: f64,
    intensity_mean: f64,
    point_count: usize,
    obb_cx: Option<f64>,
    obb_cy: Option<f64>,
    obb_cz: Option<f64>,
    obb_length: Option<f64>,
    obb_width: Option<f64>,
    obb_height: Option<f64>,
    obb_heading_rad: Option<f64>,
}

#[derive(Serialize)]
struct SnapshotIndexRow<'a> {
    snapshot_id: i64,
    sensor_id: &'a SensorId,
    taken_ns: i64,
    rings: u16,
    az_bins: u16,
    changed_cells: u64,
    reason: SnapshotReason,
    blob_file: String,
    params_json: &'a str,
    ring_elevations_json: Option<&'a str>,
}

struct WritingState {
    output_dirname: PathBuf,
    runs_wtr: CsvWriter,
    tracks_wtr: CsvWriter,
    observations_wtr: CsvWriter,
    run_tracks_wtr: CsvWriter,
    transits_wtr: CsvWriter,
    clusters_wtr: CsvWriter,
    snapshots_wtr: CsvWriter,
    observation_keys: BTreeSet<(TrackId, i64)>,
    run_track_keys: BTreeSet<(RunId, TrackId)>,
    /// Current state of every run, so status updates re-serialize the full
    /// run metadata rather than a blank row.
    runs_mirror: BTreeMap<RunId, AnalysisRun>,
    /// In-memory mirror serving the read side.
    transits_mirror: Vec<Transit>,
    next_snapshot_id: i64,
    next_cluster_id: i64,
}

/// `PersistencePort` adapter writing one directory per deployment.
pub struct CsvStore {
    state: Mutex<WritingState>,
}

fn plain_writer(path: &Path) -> Result<CsvWriter> {
    let fd = std::fs::File::create(path)?;
    Ok(csv::Writer::from_writer(
        Box::new(fd) as Box<dyn Write + Send>
    ))
}

fn gz_writer(path: &Path) -> Result<CsvWriter> {
    let fd = std::fs::File::create(path)?;
    let fd: Box<dyn Write + Send> = Box::new(AutoFinishUnchecked::new(Encoder::new(fd)?));
    Ok(csv::Writer::from_writer(fd))
}

impl CsvStore {
    pub fn create<P: AsRef<Path>>(output_dirname: P) -> Result<Self> {
        let output_dirname = output_dirname.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dirname)?;
        std::fs::create_dir_all(output_dirname.join(BG_SNAPSHOTS_DIRNAME))?;

        {
            let metadata = StoreMetadata {
                program: "sweep",
                version: env!("CARGO_PKG_VERSION"),
                created_at: chrono::Utc::now(),
            };
            let mut fd = std::fs::File::create(output_dirname.join(STORE_METADATA_FNAME))?;
            fd.write_all(serde_json::to_string_pretty(&metadata)?.as_bytes())?;
        }

        let state = WritingState {
            runs_wtr: plain_writer(&output_dirname.join(RUNS_CSV_FNAME))?,
            tracks_wtr: gz_writer(&output_dirname.join(TRACKS_CSV_FNAME))?,
            observations_wtr: gz_writer(&output_dirname.join(TRACK_OBSERVATIONS_CSV_FNAME))?,
            run_tracks_wtr: gz_writer(&output_dirname.join(RUN_TRACKS_CSV_FNAME))?,
            transits_wtr: plain_writer(&output_dirname.join(TRANSITS_CSV_FNAME))?,
            clusters_wtr: gz_writer(&output_dirname.join(CLUSTERS_CSV_FNAME))?,
            snapshots_wtr: plain_writer(&output_dirname.join(BG_SNAPSHOTS_CSV_FNAME))?,
            observation_keys: BTreeSet::new(),
            run_track_keys: BTreeSet::new(),
            runs_mirror: BTreeMap::new(),
            transits_mirror: Vec::new(),
            next_snapshot_id: 0,
            next_cluster_id: 0,
            output_dirname,
        };
        info!("recording to {}", state.output_dirname.display());
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Flush all table writers to disk.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.runs_wtr.flush()?;
        state.tracks_wtr.flush()?;
        state.observations_wtr.flush()?;
        state.run_tracks_wtr.flush()?;
        state.transits_wtr.flush()?;
        state.clusters_wtr.flush()?;
        state.snapshots_wtr.flush()?;
        Ok(())
    }
}

impl PersistencePort for CsvStore {
    fn insert_bg_snapshot(&self, snapshot: &BgSnapshot) -> Result<i64> {
        let mut state = self.state.lock();
        let snapshot_id = state.next_snapshot_id;
        state.next_snapshot_id += 1;

        let blob_file = format!(
            "{}/snapshot_{:06}.cells.gz",
            BG_SNAPSHOTS_DIRNAME, snapshot_id
        );
        let blob_path = state.output_dirname.join(&blob_file);
        std::fs::write(&blob_path, &snapshot.cells_gz).map_err(|e| Error::PersistenceFatal {
            msg: format!("writing {}: {e}", blob_path.display()),
        })?;

        state.snapshots_wtr.serialize(SnapshotIndexRow {
            snapshot_id,
            sensor_id: &snapshot.sensor_id,
            taken_ns: snapshot.taken_ns,
            rings: snapshot.rings,
            az_bins: snapshot.az_bins,
            changed_cells: snapshot.changed_cells,
            reason: snapshot.reason,
            blob_file,
            params_json: &snapshot.params_json,
            ring_elevations_json: snapshot.ring_elevations_json.as_deref(),
        })?;
        state.snapshots_wtr.flush()?;
        Ok(snapshot_id)
    }

    fn insert_track(&self, track: &TrackRow) -> Result<()> {
        let mut state = self.state.lock();
        state.tracks_wtr.serialize(track)?;
        Ok(())
    }

    fn update_track(&self, track: &TrackRow) -> Result<()> {
        // Append-only table: the update is one more state row.
        self.insert_track(track)
    }

    fn insert_track_observation(&self, observation: &TrackObservation) -> Result<()> {
        let mut state = self.state.lock();
        let key = (observation.track_id, observation.timestamp_ns);
        if state.observation_keys.insert(key) {
            state.observations_wtr.serialize(observation)?;
        }
        Ok(())
    }

    fn insert_cluster(&self, cluster: &WorldCluster) -> Result<i64> {
        let mut state = self.state.lock();
        let cluster_id = state.next_cluster_id;
        state.next_cluster_id += 1;
        state.clusters_wtr.serialize(ClusterCsvRow {
            cluster_id,
            timestamp_ns: cluster.timestamp_ns,
            x: cluster.x,
            y: cluster.y,
            z: cluster.z,
            length: cluster.length,
            width: cluster.width,
            height: cluster.height,
            height_p95: cluster.height_p95,
            intensity_mean: cluster.intensity_mean,
            point_count: cluster.point_count,
            obb_cx: cluster.obb.map(|o| o.cx),
            obb_cy: cluster.obb.map(|o| o.cy),
            obb_cz: cluster.obb.map(|o| o.cz),
            obb_length: cluster.obb.map(|o| o.length),
            obb_width: cluster.obb.map(|o| o.width),
            obb_height: cluster.obb.map(|o| o.height),
            obb_heading_rad: cluster.obb.map(|o| o.heading_rad),
        })?;
        Ok(cluster_id)
    }

    fn insert_run(&self, run: &AnalysisRun) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.runs_mirror.insert(run.run_id, run.clone());
        state.runs_wtr.serialize(run_csv_row(run))?;
        // Run rows should survive a crash.
        state.runs_wtr.flush()?;
        Ok(())
    }

    fn complete_run(&self, run_id: &RunId, stats: &RunCounters) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(run) = state.runs_mirror.get_mut(run_id) {
            run.status = RunStatus::Completed;
            run.counters = *stats;
            state.runs_wtr.serialize(run_csv_row(run))?;
            state.runs_wtr.flush()?;
        }
        Ok(())
    }

    fn update_run_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        msg: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(run) = state.runs_mirror.get_mut(run_id) {
            run.status = status;
            run.error_message = msg.map(|m| m.to_string());
            state.runs_wtr.serialize(run_csv_row(run))?;
            state.runs_wtr.flush()?;
        }
        Ok(())
    }

    fn insert_run_track(&self, run_track: &RunTrack) -> Result<()> {
        let mut state = self.state.lock();
        let key = (run_track.run_id, run_track.track_id);
        if state.run_track_keys.insert(key) {
            state.run_tracks_wtr.serialize(run_track)?;
        }
        Ok(())
    }

    fn insert_transit(&self, transit: &Transit) -> Result<i64> {
        let mut state = self.state.lock();
        state.transits_wtr.serialize(transit)?;
        state.transits_wtr.flush()?;
        state.transits_mirror.push(transit.clone());
        Ok(state.transits_mirror.len() as i64 - 1)
    }

    fn list_transits(&self, filter: &TransitFilter) -> Result<Vec<Transit>> {
        Ok(self
            .state
            .lock()
            .transits_mirror
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    fn transit_summary(&self, filter: &TransitFilter) -> Result<TransitSummary> {
        let state = self.state.lock();
        Ok(TransitSummary::from_transits(
            state.transits_mirror.iter().filter(|t| filter.matches(t)),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sweep_types::{CellState, ObjectClass, TrackState};

    fn transit(track_id: u64) -> Transit {
        Transit {
            run_id: RunId::random(),
            track_id: TrackId(track_id),
            sensor_id: SensorId::new("s1".into()),
            started_ns: 0,
            ended_ns: 2_000_000_000,
            class: ObjectClass::Car,
            class_confidence: 0.8,
            speed_p50: 9.0,
            speed_p85: 11.0,
            speed_p95: 12.0,
            peak_speed: 13.0,
            quality_score: 0.7,
            avg_length: 4.4,
            avg_width: 1.8,
            avg_height: 1.5,
            observation_count: 42,
        }
    }

    #[test]
    fn creates_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::create(dir.path()).unwrap();

        store.insert_transit(&transit(1)).unwrap();
        let snap = BgSnapshot {
            sensor_id: SensorId::new("s1".into()),
            taken_ns: 123,
            rings: 1,
            az_bins: 2,
            params_json: "{}".into(),
            cells_gz: crate::snapshot::encode_cells(1, 2, &[CellState::default(); 2]).unwrap(),
            changed_cells: 2,
            reason: SnapshotReason::Manual,
            ring_elevations_json: None,
        };
        let id = store.insert_bg_snapshot(&snap).unwrap();
        assert_eq!(id, 0);
        store.flush().unwrap();

        assert!(dir.path().join(STORE_METADATA_FNAME).exists());
        assert!(dir.path().join(TRANSITS_CSV_FNAME).exists());
        assert!(dir.path().join(BG_SNAPSHOTS_CSV_FNAME).exists());
        assert!(
            dir.path()
                .join(BG_SNAPSHOTS_DIRNAME)
                .join("snapshot_000000.cells.gz")
                .exists()
        );
        let transits_text = std::fs::read_to_string(dir.path().join(TRANSITS_CSV_FNAME)).unwrap();
        assert!(transits_text.contains("car"));
    }

    #[test]
    fn read_side_served_from_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::create(dir.path()).unwrap();
        store.insert_transit(&transit(1)).unwrap();
        store.insert_transit(&transit(2)).unwrap();
        let all = store.list_transits(&TransitFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        let summary = store.transit_summary(&TransitFilter::default()).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_class[&ObjectClass::Car], 2);
    }

    #[test]
    fn run_rows_keep_metadata_on_status_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::create(dir.path()).unwrap();
        let run = AnalysisRun {
            run_id: RunId::random(),
            created_at: chrono::Utc::now(),
            source_type: SourceType::Pcap,
            source_path: "capture.pcap".into(),
            sensor_id: SensorId::new("s1".into()),
            params_json: "{}".into(),
            status: RunStatus::Running,
            counters: RunCounters::default(),
            error_message: None,
        };
        store.insert_run(&run).unwrap();
        let stats = RunCounters {
            total_frames: 7,
            total_clusters: 3,
            total_tracks: 2,
            total_transits: 1,
            processing_time_s: 0.5,
        };
        store.complete_run(&run.run_id, &stats).unwrap();
        store
            .update_run_status(&run.run_id, RunStatus::Failed, Some("sensor unplugged"))
            .unwrap();
        store.flush().unwrap();

        let text = std::fs::read_to_string(dir.path().join(RUNS_CSV_FNAME)).unwrap();
        assert!(text.contains("completed"));
        // The last row per run id wins at read time; it must still carry the
        // run's real metadata and the completed counters.
        let last = text.lines().last().unwrap();
        assert!(last.contains("capture.pcap"));
        assert!(last.contains("s1"));
        assert!(last.contains("pcap"));
        assert!(last.contains("failed"));
        assert!(last.contains("sensor unplugged"));
        assert!(last.contains("7,3,2,1"));

        // Updates for a run never inserted are ignored.
        store
            .update_run_status(&RunId::random(), RunStatus::Failed, None)
            .unwrap();
    }

    #[test]
    fn track_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::create(dir.path()).unwrap();
        let row = TrackRow {
            track_id: TrackId(5),
            sensor_id: SensorId::new("s1".into()),
            state: TrackState::Tentative,
            class: ObjectClass::Other,
            class_confidence: 0.0,
            first_ns: 0,
            last_ns: 0,
            hits: 1,
            misses: 0,
            observation_count: 1,
            x: 0.0,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
            heading_rad: 0.0,
            avg_length: 1.0,
            avg_width: 1.0,
            avg_height: 1.0,
            intensity_mean: 1.0,
            peak_speed: 0.0,
            mean_speed: 0.0,
            occlusion_count: 0,
            track_length_m: 0.0,
            duration_s: 0.0,
            noise_ratio: 0.0,
            spatial_coverage_m2: 0.0,
            user_label: None,
            quality_label: None,
        };
        store.insert_track(&row).unwrap();
        let updated = TrackRow {
            state: TrackState::Confirmed,
            hits: 3,
            ..row
        };
        store.update_track(&updated).unwrap();
        store.flush().unwrap();
        assert!(dir.path().join(TRACKS_CSV_FNAME).exists());
    }
}
