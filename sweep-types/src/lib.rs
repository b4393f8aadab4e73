use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod params;
pub use params::{
    AssemblerParams, BackgroundParams, CellWindow, ClassifierParams, ClusterParams, ParamsError,
    PublisherParams, RegionParams, SensorParams, SweepParams, TrackerParams,
};

pub type MyFloat = f64;

/// Identifies one physical sensor head.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
pub struct SensorId(String);

impl SensorId {
    pub fn new(s: String) -> Self {
        SensorId(s)
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque per-tracker object id, allocated monotonically.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default, Serialize, Deserialize,
)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Frame sequence number within one sensor stream.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default, Serialize, Deserialize,
)]
pub struct FrameNum(pub u64);

impl fmt::Display for FrameNum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one analysis run.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn random() -> Self {
        RunId(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One raw polar return from the sensor.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct PolarPoint {
    /// Laser channel, 1-based.
    pub channel: u16,
    pub azimuth_deg: f32,
    pub elevation_deg: f32,
    pub range_m: f32,
    pub intensity: u8,
    pub timestamp_ns: i64,
    pub block_id: u32,
}

/// Discretise an azimuth (degrees, any finite value) into `[0, az_bins)`.
pub fn azimuth_bin(azimuth_deg: f32, az_bins: u16) -> u16 {
    let mut az = azimuth_deg % 360.0;
    if az < 0.0 {
        az += 360.0;
    }
    let bin = (az as f64 / 360.0 * az_bins as f64).floor() as i64;
    bin.clamp(0, az_bins as i64 - 1) as u16
}

/// Flat row-major cell index for a `(ring, azimuth_bin)` pair.
///
/// `ring0` is the zero-based ring (channel minus one).
#[inline]
pub fn cell_index(ring0: u16, az_bin: u16, az_bins: u16) -> usize {
    ring0 as usize * az_bins as usize + az_bin as usize
}

/// Convert a polar return to sensor-frame Cartesian coordinates.
///
/// Sensor frame: X forward, Y right, Z up. Azimuth is measured from +X
/// towards +Y, elevation upwards from the horizontal plane.
pub fn polar_to_sensor(range_m: f64, azimuth_deg: f64, elevation_deg: f64) -> nalgebra::Point3<f64> {
    let az = azimuth_deg.to_radians();
    let el = elevation_deg.to_radians();
    let horiz = range_m * el.cos();
    nalgebra::Point3::new(horiz * az.cos(), horiz * az.sin(), range_m * el.sin())
}

/// State of one background grid cell.
///
/// The layout of this struct defines the fixed-layout snapshot record; any
/// change here must bump the snapshot codec version.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CellState {
    pub avg_range_m: f32,
    pub spread_m: f32,
    pub times_seen: u32,
    pub last_update_ns: i64,
    pub frozen_until_ns: i64,
    pub recent_fg_count: u16,
    pub locked_baseline_m: f32,
    pub locked_spread_m: f32,
    pub locked_at_count: u32,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    SettlingComplete,
    PeriodicUpdate,
    ThresholdUpdate,
    Manual,
    FinalFlush,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotReason::SettlingComplete => "settling_complete",
            SnapshotReason::PeriodicUpdate => "periodic_update",
            SnapshotReason::ThresholdUpdate => "threshold_update",
            SnapshotReason::Manual => "manual",
            SnapshotReason::FinalFlush => "final_flush",
        }
    }
}

/// An immutable, compressed copy of a background grid.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BgSnapshot {
    pub sensor_id: SensorId,
    pub taken_ns: i64,
    pub rings: u16,
    pub az_bins: u16,
    pub params_json: String,
    /// Gzip-compressed fixed-layout cell array. See the snapshot codec.
    pub cells_gz: Vec<u8>,
    pub changed_cells: u64,
    pub reason: SnapshotReason,
    pub ring_elevations_json: Option<String>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TrackState::Tentative => "tentative",
            TrackState::Confirmed => "confirmed",
            TrackState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Car,
    Pedestrian,
    Bird,
    Other,
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ObjectClass::Car => "car",
            ObjectClass::Pedestrian => "pedestrian",
            ObjectClass::Bird => "bird",
            ObjectClass::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Pcap,
    Live,
}

/// A 2-D oriented bounding box fit on the road plane, with vertical extent.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct OrientedBox {
    pub cx: f64,
    pub cy: f64,
    /// Bottom of the box (minimum z of the member points).
    pub cz: f64,
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub heading_rad: f64,
}

/// One spatial cluster of world-frame foreground points.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct WorldCluster {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Axis-aligned extents.
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub obb: Option<OrientedBox>,
    pub height_p95: f64,
    pub intensity_mean: f64,
    pub point_count: usize,
    pub timestamp_ns: i64,
}

/// Derived per-track quality metrics, computed when a track is recorded.
#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrackQuality {
    /// Number of reacquisitions after one or more missed frames.
    pub occlusion_count: u32,
    pub track_length_m: f64,
    pub duration_s: f64,
    /// Missed frames as a fraction of all frames the track was live.
    pub noise_ratio: f64,
    /// Area of the axis-aligned bounding box of the travelled path.
    pub spatial_coverage_m2: f64,
}

/// Persisted view of one track. Flat so it can be serialised row-wise.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TrackRow {
    pub track_id: TrackId,
    pub sensor_id: SensorId,
    pub state: TrackState,
    pub class: ObjectClass,
    pub class_confidence: f64,
    pub first_ns: i64,
    pub last_ns: i64,
    pub hits: u32,
    pub misses: u32,
    pub observation_count: u32,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub heading_rad: f64,
    pub avg_length: f64,
    pub avg_width: f64,
    pub avg_height: f64,
    pub intensity_mean: f64,
    pub peak_speed: f64,
    pub mean_speed: f64,
    pub occlusion_count: u32,
    pub track_length_m: f64,
    pub duration_s: f64,
    pub noise_ratio: f64,
    pub spatial_coverage_m2: f64,
    pub user_label: Option<String>,
    pub quality_label: Option<String>,
}

impl TrackRow {
    pub fn quality(&self) -> TrackQuality {
        TrackQuality {
            occlusion_count: self.occlusion_count,
            track_length_m: self.track_length_m,
            duration_s: self.duration_s,
            noise_ratio: self.noise_ratio,
            spatial_coverage_m2: self.spatial_coverage_m2,
        }
    }
}

/// One per-frame sample of a track. Append-only.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TrackObservation {
    pub track_id: TrackId,
    pub timestamp_ns: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub speed: f64,
    pub heading_rad: f64,
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub height_p95: f64,
    pub intensity_mean: f64,
}

#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_frames: u64,
    pub total_clusters: u64,
    pub total_tracks: u64,
    pub total_transits: u64,
    pub processing_time_s: f64,
}

/// One analysis run over a live or recorded source.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub source_type: SourceType,
    pub source_path: String,
    pub sensor_id: SensorId,
    /// Full parameter echo for reproducibility.
    pub params_json: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub error_message: Option<String>,
}

/// Per-run record of one track seen during that run.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RunTrack {
    pub run_id: RunId,
    pub track_id: TrackId,
    pub class: ObjectClass,
    pub class_confidence: f64,
    pub observation_count: u32,
    pub occlusion_count: u32,
    pub track_length_m: f64,
    pub duration_s: f64,
    pub noise_ratio: f64,
    pub spatial_coverage_m2: f64,
}

/// Distilled summary of one retired, promoted track.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Transit {
    pub run_id: RunId,
    pub track_id: TrackId,
    pub sensor_id: SensorId,
    pub started_ns: i64,
    pub ended_ns: i64,
    pub class: ObjectClass,
    pub class_confidence: f64,
    pub speed_p50: f64,
    pub speed_p85: f64,
    pub speed_p95: f64,
    pub peak_speed: f64,
    pub quality_score: f64,
    pub avg_length: f64,
    pub avg_width: f64,
    pub avg_height: f64,
    pub observation_count: u32,
}

/// Read-side filter for transit queries. Absent fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitFilter {
    pub sensor_id: Option<SensorId>,
    pub class: Option<ObjectClass>,
    pub min_quality: Option<f64>,
    pub since_ns: Option<i64>,
    pub until_ns: Option<i64>,
}

impl TransitFilter {
    pub fn matches(&self, t: &Transit) -> bool {
        if let Some(sensor_id) = &self.sensor_id {
            if sensor_id != &t.sensor_id {
                return false;
            }
        }
        if let Some(class) = &self.class {
            if *class != t.class {
                return false;
            }
        }
        if let Some(min_quality) = self.min_quality {
            if t.quality_score < min_quality {
                return false;
            }
        }
        if let Some(since_ns) = self.since_ns {
            if t.ended_ns < since_ns {
                return false;
            }
        }
        if let Some(until_ns) = self.until_ns {
            if t.started_ns > until_ns {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitSummary {
    pub total: u64,
    pub by_class: BTreeMap<ObjectClass, u64>,
    pub mean_speed_p85: f64,
    pub mean_quality: f64,
}

impl TransitSummary {
    pub fn from_transits<'a, I: IntoIterator<Item = &'a Transit>>(transits: I) -> Self {
        let mut summary = TransitSummary::default();
        let mut speed_sum = 0.0;
        let mut quality_sum = 0.0;
        for t in transits {
            summary.total += 1;
            *summary.by_class.entry(t.class).or_insert(0) += 1;
            speed_sum += t.speed_p85;
            quality_sum += t.quality_score;
        }
        if summary.total > 0 {
            summary.mean_speed_p85 = speed_sum / summary.total as f64;
            summary.mean_quality = quality_sum / summary.total as f64;
        }
        summary
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_azimuth_bin() {
        assert_eq!(azimuth_bin(0.0, 1800), 0);
        assert_eq!(azimuth_bin(0.19, 1800), 0);
        assert_eq!(azimuth_bin(0.2, 1800), 1);
        assert_eq!(azimuth_bin(359.99, 1800), 1799);
        // normalisation
        assert_eq!(azimuth_bin(360.0, 1800), 0);
        assert_eq!(azimuth_bin(-0.1, 1800), 1799);
        // never out of range even near the wrap
        assert_eq!(azimuth_bin(359.99, 8), 7);
    }

    #[test]
    fn test_polar_to_sensor() {
        use approx::assert_relative_eq;
        let p = polar_to_sensor(10.0, 0.0, 0.0);
        assert_relative_eq!(p.x, 10.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-9);
        let p = polar_to_sensor(10.0, 90.0, 0.0);
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 10.0, epsilon = 1e-9);
        let p = polar_to_sensor(10.0, 0.0, 90.0);
        assert_relative_eq!(p.z, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_transit_filter() {
        let t = Transit {
            run_id: RunId::random(),
            track_id: TrackId(7),
            sensor_id: SensorId::new("s1".into()),
            started_ns: 1_000,
            ended_ns: 5_000,
            class: ObjectClass::Car,
            class_confidence: 0.8,
            speed_p50: 10.0,
            speed_p85: 12.0,
            speed_p95: 13.0,
            peak_speed: 14.0,
            quality_score: 0.7,
            avg_length: 4.5,
            avg_width: 1.8,
            avg_height: 1.5,
            observation_count: 30,
        };
        assert!(TransitFilter::default().matches(&t));
        let f = TransitFilter {
            class: Some(ObjectClass::Pedestrian),
            ..Default::default()
        };
        assert!(!f.matches(&t));
        let f = TransitFilter {
            min_quality: Some(0.9),
            ..Default::default()
        };
        assert!(!f.matches(&t));
        let f = TransitFilter {
            since_ns: Some(6_000),
            ..Default::default()
        };
        assert!(!f.matches(&t));
    }
}
