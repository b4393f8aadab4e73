//! Outbound port towards the visualiser.
//!
//! The core only assembles a per-frame bundle and hands it to whatever
//! adapter is attached; the wire protocol lives outside. A missing adapter
//! is a no-op.

use serde::{Deserialize, Serialize};

use sweep_types::{FrameNum, ObjectClass, PublisherParams, TrackState};

/// Kinematic summary of one confirmed track for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub track_id: sweep_types::TrackId,
    pub state: TrackState,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed: f64,
    pub heading_rad: f64,
    pub class: ObjectClass,
    pub class_confidence: f64,
}

/// Optional debug geometry for display overlays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugOverlays {
    /// Per-track gating ellipse radius (sqrt of the gate, metres-ish).
    pub gating: Vec<(sweep_types::TrackId, f64)>,
    /// Per-track predicted position ahead of the update.
    pub predictions: Vec<(sweep_types::TrackId, f64, f64)>,
}

/// Everything the visualiser needs about one processed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBundle {
    pub frame: FrameNum,
    pub start_ns: i64,
    pub end_ns: i64,
    /// World-frame foreground samples, downsampled for display.
    pub foreground: Vec<[f64; 3]>,
    pub tracks: Vec<TrackSnapshot>,
    pub overlays: Option<DebugOverlays>,
}

pub trait VisualiserPublisher: Send + Sync {
    fn publish(&self, bundle: &FrameBundle);
}

/// Swallows every bundle.
pub struct NoopPublisher;

impl VisualiserPublisher for NoopPublisher {
    fn publish(&self, _bundle: &FrameBundle) {}
}

/// Deterministic stride downsampling to at most `max_points` samples.
pub fn downsample_foreground(points: &[[f64; 3]], params: &PublisherParams) -> Vec<[f64; 3]> {
    let max_points = params.max_background_chart_points;
    if max_points == 0 || points.len() <= max_points {
        return points.to_vec();
    }
    let stride = points.len().div_ceil(max_points);
    points.iter().step_by(stride).copied().collect()
}
