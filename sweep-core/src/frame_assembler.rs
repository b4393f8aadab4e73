use tracing::warn;

use sweep_types::{FrameNum, PolarPoint};

use crate::{Error, Result};

/// One full azimuth sweep of polar returns.
///
/// Frames move through the pipeline by value and do not outlive one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame: FrameNum,
    pub points: Vec<PolarPoint>,
    pub start_ns: i64,
    pub end_ns: i64,
    pub min_azimuth_deg: f32,
    pub max_azimuth_deg: f32,
}

/// Groups a decoded polar point stream into frames on azimuth wrap.
///
/// A new frame begins when the azimuth drops below the previous value by
/// more than the jitter tolerance and at least `min_rotation_period_ns` has
/// elapsed since the frame started. A frame is also force-emitted when it
/// exceeds `max_frame_duration_ns`, so a sensor with a dead azimuth encoder
/// still produces output.
pub struct FrameAssembler {
    params: sweep_types::AssemblerParams,
    pending: Vec<PolarPoint>,
    next_frame: u64,
    last_azimuth_deg: f32,
    start_ns: i64,
    end_ns: i64,
    min_azimuth_deg: f32,
    max_azimuth_deg: f32,
    malformed_frames: u64,
}

impl FrameAssembler {
    pub fn new(params: sweep_types::AssemblerParams) -> Self {
        Self {
            params,
            pending: Vec::new(),
            next_frame: 0,
            last_azimuth_deg: 0.0,
            start_ns: 0,
            end_ns: 0,
            min_azimuth_deg: 0.0,
            max_azimuth_deg: 0.0,
            malformed_frames: 0,
        }
    }

    /// Number of partial frames dropped for exceeding the point limit.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    /// Feed one point; returns a completed frame when a boundary was crossed.
    pub fn push(&mut self, pt: PolarPoint) -> Result<Option<Frame>> {
        if self.pending.is_empty() {
            self.begin(pt);
            return Ok(None);
        }

        let wrapped =
            pt.azimuth_deg + self.params.azimuth_wrap_tolerance_deg < self.last_azimuth_deg;
        let elapsed_ns = pt.timestamp_ns - self.start_ns;
        let boundary = (wrapped && elapsed_ns >= self.params.min_rotation_period_ns)
            || elapsed_ns >= self.params.max_frame_duration_ns;

        if boundary {
            let done = self.take_frame();
            self.begin(pt);
            return Ok(Some(done));
        }

        if self.pending.len() >= self.params.max_points_per_frame {
            let n = self.pending.len();
            self.pending.clear();
            self.malformed_frames += 1;
            warn!("dropping partial frame with {} points (limit exceeded)", n);
            return Err(Error::malformed_frame(format!(
                "more than {} points without an azimuth wrap",
                self.params.max_points_per_frame
            )));
        }

        self.last_azimuth_deg = pt.azimuth_deg;
        self.end_ns = pt.timestamp_ns;
        self.min_azimuth_deg = self.min_azimuth_deg.min(pt.azimuth_deg);
        self.max_azimuth_deg = self.max_azimuth_deg.max(pt.azimuth_deg);
        self.pending.push(pt);
        Ok(None)
    }

    /// Emit whatever is pending, e.g. at end of a recorded stream.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_frame())
        }
    }

    fn begin(&mut self, pt: PolarPoint) {
        self.last_azimuth_deg = pt.azimuth_deg;
        self.start_ns = pt.timestamp_ns;
        self.end_ns = pt.timestamp_ns;
        self.min_azimuth_deg = pt.azimuth_deg;
        self.max_azimuth_deg = pt.azimuth_deg;
        self.pending.push(pt);
    }

    fn take_frame(&mut self) -> Frame {
        let frame = Frame {
            frame: FrameNum(self.next_frame),
            points: std::mem::take(&mut self.pending),
            start_ns: self.start_ns,
            end_ns: self.end_ns,
            min_azimuth_deg: self.min_azimuth_deg,
            max_azimuth_deg: self.max_azimuth_deg,
        };
        self.next_frame += 1;
        frame
    }
}
