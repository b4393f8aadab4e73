//! Recognised configuration for the pipeline, with serde defaults mirroring
//! sensible roadside deployment values. Every struct refuses unknown fields so
//! a typo in a config file fails at load time rather than silently.

use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

use crate::SensorId;

/// A parameter failed validation; the pipeline refuses to start.
#[derive(thiserror::Error, Debug)]
#[error("invalid parameter `{name}`: {reason}")]
pub struct ParamsError {
    pub name: &'static str,
    pub reason: String,
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ParamsError {
    ParamsError {
        name,
        reason: reason.into(),
    }
}

fn default_world_pose() -> Isometry3<f64> {
    Isometry3::identity()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorParams {
    pub sensor_id: SensorId,
    /// Number of laser rings (channels) on the sensor.
    pub rings: u16,
    /// Number of azimuth bins covering the full rotation.
    pub azimuth_bins: u16,
    /// Per-ring elevation angles in degrees, index 0 = channel 1.
    pub ring_elevations_deg: Option<Vec<f32>>,
    /// Rigid sensor-to-world pose, supplied per installation.
    pub world_pose: Isometry3<f64>,
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            sensor_id: SensorId::new("sensor0".to_string()),
            rings: 40,
            azimuth_bins: 1800,
            ring_elevations_deg: None,
            world_pose: default_world_pose(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssemblerParams {
    /// Azimuth may jitter backwards by up to this much without starting a
    /// new frame.
    pub azimuth_wrap_tolerance_deg: f32,
    /// A wrap is only honoured after at least this much of a rotation.
    pub min_rotation_period_ns: i64,
    /// Force-emit a frame after this long even without a wrap.
    pub max_frame_duration_ns: i64,
    pub max_points_per_frame: usize,
}

impl Default for AssemblerParams {
    fn default() -> Self {
        Self {
            azimuth_wrap_tolerance_deg: 5.0,
            min_rotation_period_ns: 40_000_000,
            max_frame_duration_ns: 200_000_000,
            max_points_per_frame: 400_000,
        }
    }
}

/// A debug window of cells whose per-frame decisions are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CellWindow {
    pub ring_min: u16,
    pub ring_max: u16,
    pub az_bin_min: u16,
    pub az_bin_max: u16,
}

impl CellWindow {
    pub fn contains(&self, ring0: u16, az_bin: u16) -> bool {
        ring0 >= self.ring_min
            && ring0 <= self.ring_max
            && az_bin >= self.az_bin_min
            && az_bin <= self.az_bin_max
    }
}

fn default_histogram_edges() -> Vec<f64> {
    vec![
        1.0, 2.0, 4.0, 8.0, 10.0, 12.0, 16.0, 20.0, 50.0, 100.0, 200.0,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundParams {
    /// EMA alpha applied to cell mean and spread. In (0, 1].
    pub update_fraction: f64,
    /// Multiplier on the per-cell closeness threshold.
    pub closeness_sensitivity_multiplier: f64,
    /// Additive slack on the closeness threshold, metres.
    pub safety_margin_m: f64,
    pub freeze_duration_ns: i64,
    /// A deviation beyond this multiple of the closeness threshold freezes a
    /// low-confidence cell.
    pub freeze_threshold_multiplier: f64,
    /// Neighbours (same ring, +-1 azimuth bin) required to confirm an
    /// observation as background. 0 disables neighbour confirmation.
    pub neighbor_confirmation_count: u16,
    /// Range-proportional noise term. In [0, 1].
    pub noise_relative_fraction: f64,
    /// Settling duration threshold.
    #[serde(alias = "settling_period_ns")]
    pub warmup_duration_ns: i64,
    /// Settling frame-count threshold.
    pub warmup_min_frames: u64,
    /// Alpha applied once settling completes; `None` keeps `update_fraction`.
    pub post_settle_update_fraction: Option<f64>,
    /// Alpha boost while re-acquiring a cell that recently went foreground.
    pub reacquisition_boost_multiplier: f64,
    /// `times_seen` never drops below this once reached, except by reset.
    pub min_confidence_floor: u32,
    pub locked_baseline_threshold: u32,
    pub locked_baseline_multiplier: f64,
    /// Minimum same-eps neighbours for a foreground point to survive the
    /// pre-cluster denoise pass.
    pub foreground_min_cluster_points: usize,
    pub foreground_dbscan_eps: f64,
    pub seed_from_first_observation: bool,
    pub snapshot_interval_ns: i64,
    pub change_threshold_for_snapshot: u64,
    pub histogram_bucket_edges_m: Vec<f64>,
    pub debug_cell_window: Option<CellWindow>,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            update_fraction: 0.02,
            closeness_sensitivity_multiplier: 3.0,
            safety_margin_m: 0.1,
            freeze_duration_ns: 10_000_000_000,
            freeze_threshold_multiplier: 3.0,
            neighbor_confirmation_count: 2,
            noise_relative_fraction: 0.01,
            warmup_duration_ns: 30_000_000_000,
            warmup_min_frames: 300,
            post_settle_update_fraction: Some(0.005),
            reacquisition_boost_multiplier: 4.0,
            min_confidence_floor: 10,
            locked_baseline_threshold: 500,
            locked_baseline_multiplier: 4.0,
            foreground_min_cluster_points: 3,
            foreground_dbscan_eps: 0.5,
            seed_from_first_observation: true,
            snapshot_interval_ns: 300_000_000_000,
            change_threshold_for_snapshot: 50_000,
            histogram_bucket_edges_m: default_histogram_edges(),
            debug_cell_window: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionParams {
    pub max_regions: usize,
}

impl Default for RegionParams {
    fn default() -> Self {
        Self { max_regions: 16 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterParams {
    pub eps_m: f64,
    pub min_pts: usize,
    /// Clusters smaller than this are discarded entirely.
    pub min_cluster_points: usize,
    /// Minimum membership for an oriented-box fit.
    pub obb_min_points: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps_m: 0.5,
            min_pts: 4,
            min_cluster_points: 5,
            obb_min_points: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerParams {
    pub max_tracks: usize,
    pub hits_to_confirm: u32,
    pub max_misses_tentative: u32,
    pub max_misses_confirmed: u32,
    /// Squared-Mahalanobis association gate.
    pub gating_distance_squared: f64,
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    pub measurement_noise: f64,
    pub initial_position_std_meters: f64,
    pub initial_vel_std_meters_per_sec: f64,
    pub deleted_track_grace_period_ns: i64,
    pub speed_history_len: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            max_tracks: 100,
            hits_to_confirm: 3,
            max_misses_tentative: 3,
            max_misses_confirmed: 5,
            gating_distance_squared: 9.21,
            process_noise_pos: 0.5,
            process_noise_vel: 2.0,
            measurement_noise: 0.25,
            initial_position_std_meters: 0.5,
            initial_vel_std_meters_per_sec: 5.0,
            deleted_track_grace_period_ns: 5_000_000_000,
            speed_history_len: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierParams {
    pub min_observations_for_classification: u32,
    pub bird_max_height: f64,
    pub bird_max_speed: f64,
    pub bird_max_length: f64,
    pub bird_max_width: f64,
    pub vehicle_min_length: f64,
    pub vehicle_min_width: f64,
    pub vehicle_fast_avg_speed: f64,
    pub vehicle_fast_peak_speed: f64,
    pub vehicle_min_height: f64,
    pub pedestrian_min_height: f64,
    pub pedestrian_max_height: f64,
    pub pedestrian_max_speed: f64,
    pub pedestrian_max_length: f64,
    pub pedestrian_max_width: f64,
    pub base_confidence: f64,
    pub confidence_low: f64,
    pub confidence_high: f64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            min_observations_for_classification: 5,
            bird_max_height: 0.5,
            bird_max_speed: 1.0,
            bird_max_length: 1.0,
            bird_max_width: 1.0,
            vehicle_min_length: 3.0,
            vehicle_min_width: 1.5,
            vehicle_fast_avg_speed: 5.0,
            vehicle_fast_peak_speed: 7.5,
            vehicle_min_height: 1.2,
            pedestrian_min_height: 1.0,
            pedestrian_max_height: 2.2,
            pedestrian_max_speed: 3.0,
            pedestrian_max_length: 3.0,
            pedestrian_max_width: 1.5,
            base_confidence: 0.70,
            confidence_low: 0.50,
            confidence_high: 0.85,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherParams {
    /// Foreground samples per bundle are downsampled beyond this count.
    pub max_background_chart_points: usize,
    pub debug_overlays: bool,
}

impl Default for PublisherParams {
    fn default() -> Self {
        Self {
            max_background_chart_points: 2000,
            debug_overlays: false,
        }
    }
}

/// Complete pipeline configuration for one sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepParams {
    pub sensor: SensorParams,
    pub assembler: AssemblerParams,
    pub background: BackgroundParams,
    pub regions: RegionParams,
    pub clustering: ClusterParams,
    pub tracker: TrackerParams,
    pub classifier: ClassifierParams,
    pub publisher: PublisherParams,
}

impl SweepParams {
    /// JSON echo stored with runs and snapshots for reproducibility.
    pub fn params_json(&self) -> String {
        serde_json::to_string(self).expect("params are always serialisable")
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.sensor.rings == 0 {
            return Err(invalid("sensor.rings", "must be at least 1"));
        }
        if self.sensor.azimuth_bins == 0 {
            return Err(invalid("sensor.azimuth_bins", "must be at least 1"));
        }
        if let Some(elevations) = &self.sensor.ring_elevations_deg {
            if elevations.len() != self.sensor.rings as usize {
                return Err(invalid(
                    "sensor.ring_elevations_deg",
                    format!(
                        "expected {} entries, got {}",
                        self.sensor.rings,
                        elevations.len()
                    ),
                ));
            }
        }
        let bg = &self.background;
        if !(bg.update_fraction > 0.0 && bg.update_fraction <= 1.0) {
            return Err(invalid("background.update_fraction", "must be in (0, 1]"));
        }
        if let Some(alpha) = bg.post_settle_update_fraction {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(invalid(
                    "background.post_settle_update_fraction",
                    "must be in (0, 1]",
                ));
            }
        }
        if bg.closeness_sensitivity_multiplier <= 0.0 {
            return Err(invalid(
                "background.closeness_sensitivity_multiplier",
                "must be positive",
            ));
        }
        if bg.safety_margin_m < 0.0 {
            return Err(invalid("background.safety_margin_m", "must be >= 0"));
        }
        if bg.neighbor_confirmation_count > 8 {
            return Err(invalid(
                "background.neighbor_confirmation_count",
                "must be in [0, 8]",
            ));
        }
        if !(0.0..=1.0).contains(&bg.noise_relative_fraction) {
            return Err(invalid(
                "background.noise_relative_fraction",
                "must be in [0, 1]",
            ));
        }
        if bg.reacquisition_boost_multiplier < 1.0 {
            return Err(invalid(
                "background.reacquisition_boost_multiplier",
                "must be >= 1",
            ));
        }
        if bg.histogram_bucket_edges_m.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(
                "background.histogram_bucket_edges_m",
                "edges must be strictly increasing",
            ));
        }
        if self.regions.max_regions == 0 {
            return Err(invalid("regions.max_regions", "must be at least 1"));
        }
        if self.clustering.eps_m <= 0.0 {
            return Err(invalid("clustering.eps_m", "must be positive"));
        }
        if self.clustering.min_pts == 0 {
            return Err(invalid("clustering.min_pts", "must be at least 1"));
        }
        let tr = &self.tracker;
        if tr.max_tracks == 0 {
            return Err(invalid("tracker.max_tracks", "must be at least 1"));
        }
        if tr.hits_to_confirm == 0 {
            return Err(invalid("tracker.hits_to_confirm", "must be at least 1"));
        }
        if tr.gating_distance_squared <= 0.0 {
            return Err(invalid(
                "tracker.gating_distance_squared",
                "must be positive",
            ));
        }
        if tr.measurement_noise <= 0.0 {
            return Err(invalid("tracker.measurement_noise", "must be positive"));
        }
        if tr.process_noise_pos <= 0.0 || tr.process_noise_vel <= 0.0 {
            return Err(invalid(
                "tracker.process_noise_pos",
                "process noise must be positive",
            ));
        }
        if tr.speed_history_len == 0 {
            return Err(invalid("tracker.speed_history_len", "must be at least 1"));
        }
        let cl = &self.classifier;
        if !(cl.confidence_low <= cl.base_confidence && cl.base_confidence <= cl.confidence_high) {
            return Err(invalid(
                "classifier.base_confidence",
                "confidence bounds must satisfy low <= base <= high",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        SweepParams::default().validate().unwrap();
    }

    #[test]
    fn bad_alpha_rejected() {
        let mut params = SweepParams::default();
        params.background.update_fraction = 0.0;
        assert!(params.validate().is_err());
        params.background.update_fraction = 1.5;
        assert!(params.validate().is_err());
    }

    #[test]
    fn settling_period_alias() {
        let toml_src = r#"
[background]
settling_period_ns = 123
"#;
        let params: SweepParams = toml::from_str(toml_src).unwrap();
        assert_eq!(params.background.warmup_duration_ns, 123);
    }

    #[test]
    fn params_json_round_trips() {
        let params = SweepParams::default();
        let echoed: SweepParams = serde_json::from_str(&params.params_json()).unwrap();
        echoed.validate().unwrap();
        assert_eq!(
            echoed.background.warmup_min_frames,
            params.background.warmup_min_frames
        );
    }
}
