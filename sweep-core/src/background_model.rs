//! Per-cell adaptive background model over the polar grid.
//!
//! Each `(ring, azimuth_bin)` cell keeps an EMA estimate of the range that is
//! "normally there" plus a spread estimate, confidence counters, a freeze
//! timeout and a locked baseline. `ingest` classifies every point of a frame
//! as foreground or background and updates the grid in place.
//!
//! Locking discipline: `ingest`, `reset` and parameter updates take the write
//! lock; snapshot copies, heatmap aggregation and ASC export take the read
//! lock. Snapshots copy under the read lock, compress outside any lock, and
//! reconcile `changes_since_snapshot` under a short write lock so concurrent
//! ingest increments are never lost.

use std::collections::BTreeMap;
use std::io::Write;

use nalgebra::Isometry3;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use sweep_types::{
    BackgroundParams, BgSnapshot, CellState, SensorId, SensorParams, SnapshotReason, azimuth_bin,
    cell_index, polar_to_sensor,
};

use crate::frame_assembler::Frame;
use crate::regions::{RegionAccumulator, RegionMap};
use crate::snapshot;
use crate::store::PersistencePort;
use crate::{Error, Result};

/// Confidence level below which the closeness threshold is widened and a
/// large deviation may freeze the cell.
const LOW_CONFIDENCE_SEEN: u32 = 100;

/// Result of ingesting one frame.
#[derive(Debug)]
pub struct IngestReport {
    /// One bit per frame point; `true` means foreground. All bits are forced
    /// `false` until settling completes.
    pub mask: Vec<bool>,
    pub foreground_points: usize,
    pub invalid_points: usize,
    /// Set on exactly the frame that completed settling.
    pub settled_now: bool,
}

/// Counters exposed to the status side-channel.
#[derive(Debug, Clone)]
pub struct BackgroundStats {
    pub frames_ingested: u64,
    pub settled: bool,
    pub invalid_channel_points: u64,
    pub invalid_azimuth_points: u64,
    pub invalid_range_points: u64,
    pub bucket_edges_m: Vec<f64>,
    /// `bucket_edges_m.len() + 1` entries; last bucket is overflow.
    pub accepted_by_range: Vec<u64>,
    pub rejected_by_range: Vec<u64>,
    pub changes_since_snapshot: u64,
    pub region_count: usize,
}

/// Downsampled aggregation of the grid for status displays.
#[derive(Debug, Clone)]
pub struct Heatmap {
    pub rows: usize,
    pub cols: usize,
    pub mean_times_seen: Vec<f64>,
    pub mean_spread_m: Vec<f64>,
}

/// Per-cell observation accumulated from one frame.
struct CellObs {
    sum_range: f64,
    min_range: f32,
    max_range: f32,
    count: u32,
    point_idxs: Vec<u32>,
}

struct GridInner {
    params: BackgroundParams,
    cells: Vec<CellState>,
    changes_since_snapshot: u64,
    frames_ingested: u64,
    first_frame_ns: Option<i64>,
    settled: bool,
    regions: Option<RegionMap>,
    region_acc: Option<RegionAccumulator>,
    last_snapshot_id: Option<i64>,
    accepted_by_range: Vec<u64>,
    rejected_by_range: Vec<u64>,
    invalid_channel_points: u64,
    invalid_azimuth_points: u64,
    invalid_range_points: u64,
}

pub struct BackgroundModel {
    sensor_id: SensorId,
    rings: u16,
    az_bins: u16,
    ring_elevations_deg: Option<Vec<f32>>,
    world_pose: Isometry3<f64>,
    max_regions: usize,
    inner: RwLock<GridInner>,
}

impl BackgroundModel {
    pub fn new(
        sensor: &SensorParams,
        params: BackgroundParams,
        region_params: sweep_types::RegionParams,
    ) -> Self {
        let n = sensor.rings as usize * sensor.azimuth_bins as usize;
        let buckets = params.histogram_bucket_edges_m.len() + 1;
        let inner = GridInner {
            cells: vec![CellState::default(); n],
            changes_since_snapshot: 0,
            frames_ingested: 0,
            first_frame_ns: None,
            settled: false,
            regions: None,
            region_acc: Some(RegionAccumulator::new(sensor.rings, sensor.azimuth_bins)),
            last_snapshot_id: None,
            accepted_by_range: vec![0; buckets],
            rejected_by_range: vec![0; buckets],
            invalid_channel_points: 0,
            invalid_azimuth_points: 0,
            invalid_range_points: 0,
            params,
        };
        Self {
            sensor_id: sensor.sensor_id.clone(),
            rings: sensor.rings,
            az_bins: sensor.azimuth_bins,
            ring_elevations_deg: sensor.ring_elevations_deg.clone(),
            world_pose: sensor.world_pose,
            max_regions: region_params.max_regions,
            inner: RwLock::new(inner),
        }
    }

    pub fn sensor_id(&self) -> &SensorId {
        &self.sensor_id
    }

    pub fn settled(&self) -> bool {
        self.inner.read().settled
    }

    pub fn changes_since_snapshot(&self) -> u64 {
        self.inner.read().changes_since_snapshot
    }

    pub fn last_snapshot_id(&self) -> Option<i64> {
        self.inner.read().last_snapshot_id
    }

    /// Classify every point of `frame` and update the grid.
    ///
    /// Never fails: malformed points are counted and skipped.
    pub fn ingest(&self, frame: &Frame) -> IngestReport {
        let mut mask = vec![false; frame.points.len()];
        let mut invalid_channel = 0u64;
        let mut invalid_azimuth = 0u64;
        let mut invalid_range = 0u64;
        let mut invalid_points = 0usize;

        // Bin points to cells outside the lock. Malformed points never touch
        // the model; like invalid channels they are reported as foreground.
        let mut by_cell: BTreeMap<usize, CellObs> = BTreeMap::new();
        for (i, pt) in frame.points.iter().enumerate() {
            if !pt.range_m.is_finite() || pt.range_m <= 0.0 {
                mask[i] = true;
                invalid_range += 1;
                invalid_points += 1;
                continue;
            }
            if pt.channel < 1 || pt.channel > self.rings {
                mask[i] = true;
                invalid_channel += 1;
                invalid_points += 1;
                continue;
            }
            if !pt.azimuth_deg.is_finite() {
                mask[i] = true;
                invalid_azimuth += 1;
                invalid_points += 1;
                continue;
            }
            let az_bin = azimuth_bin(pt.azimuth_deg, self.az_bins);
            let idx = cell_index(pt.channel - 1, az_bin, self.az_bins);
            let obs = by_cell.entry(idx).or_insert_with(|| CellObs {
                sum_range: 0.0,
                min_range: f32::INFINITY,
                max_range: f32::NEG_INFINITY,
                count: 0,
                point_idxs: Vec::new(),
            });
            obs.sum_range += pt.range_m as f64;
            obs.min_range = obs.min_range.min(pt.range_m);
            obs.max_range = obs.max_range.max(pt.range_m);
            obs.count += 1;
            obs.point_idxs.push(i as u32);
        }

        let now = frame.end_ns;
        let mut guard = self.inner.write();
        let w = &mut *guard;
        if w.first_frame_ns.is_none() {
            w.first_frame_ns = Some(frame.start_ns);
        }
        let elapsed_ns = now - w.first_frame_ns.unwrap_or(now);
        let was_settled = w.settled;

        for (&idx, obs) in by_cell.iter() {
            let neighbors = self.neighbor_states(w, idx);
            let foreground = w.process_cell(self.az_bins, idx, obs, &neighbors, elapsed_ns, now);
            w.changes_since_snapshot += 1;
            if let Some(acc) = w.region_acc.as_mut() {
                acc.observe(idx, w.cells[idx].spread_m as f64);
            }
            if foreground {
                for &i in &obs.point_idxs {
                    mask[i as usize] = true;
                }
            }
        }

        w.invalid_channel_points += invalid_channel;
        w.invalid_azimuth_points += invalid_azimuth;
        w.invalid_range_points += invalid_range;
        w.frames_ingested += 1;

        let settled_now = !w.settled
            && w.frames_ingested >= w.params.warmup_min_frames
            && elapsed_ns >= w.params.warmup_duration_ns;
        if settled_now {
            w.settled = true;
            if let Some(acc) = w.region_acc.take() {
                w.regions = Some(acc.identify(self.max_regions));
            }
            info!(
                "sensor {}: background settled after {} frames",
                self.sensor_id, w.frames_ingested
            );
        }
        drop(guard);

        // Warmup suppression: downstream stages see no foreground until the
        // model has settled.
        if !was_settled {
            mask.iter_mut().for_each(|b| *b = false);
        }
        let foreground_points = mask.iter().filter(|b| **b).count();

        IngestReport {
            mask,
            foreground_points,
            invalid_points,
            settled_now,
        }
    }

    /// Produce a durable snapshot and hand it to the store.
    ///
    /// On store failure `changes_since_snapshot` is left unchanged so the
    /// next flush carries the pending changes.
    pub fn snapshot(&self, reason: SnapshotReason, store: &dyn PersistencePort) -> Result<i64> {
        let (cells, changed, params_json) = {
            let r = self.inner.read();
            let params_json = serde_json::to_string(&r.params)?;
            (r.cells.clone(), r.changes_since_snapshot, params_json)
        };

        // Compress outside any lock.
        let cells_gz = snapshot::encode_cells(self.rings, self.az_bins, &cells)?;
        let ring_elevations_json = match &self.ring_elevations_deg {
            Some(elevations) => Some(serde_json::to_string(elevations)?),
            None => None,
        };
        let snap = BgSnapshot {
            sensor_id: self.sensor_id.clone(),
            taken_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            rings: self.rings,
            az_bins: self.az_bins,
            params_json,
            cells_gz,
            changed_cells: changed,
            reason,
            ring_elevations_json,
        };

        let snapshot_id = store.insert_bg_snapshot(&snap)?;

        // Subtract only what this snapshot observed; concurrent ingest
        // increments survive.
        let mut w = self.inner.write();
        w.changes_since_snapshot = w.changes_since_snapshot.saturating_sub(changed);
        w.last_snapshot_id = Some(snapshot_id);
        drop(w);

        debug!(
            "sensor {}: snapshot {} ({}, {} changed cells)",
            self.sensor_id,
            snapshot_id,
            reason.as_str(),
            changed
        );
        Ok(snapshot_id)
    }

    /// Replace the grid with cells restored from a decoded snapshot.
    pub fn load_cells(&self, cells: Vec<CellState>) -> Result<()> {
        let expected = self.rings as usize * self.az_bins as usize;
        if cells.len() != expected {
            return Err(Error::snapshot_corrupt(format!(
                "restored {} cells into a {} cell grid",
                cells.len(),
                expected
            )));
        }
        let mut w = self.inner.write();
        w.cells = cells;
        Ok(())
    }

    /// Copy of the live cells, for readers outside the model.
    pub fn cells(&self) -> Vec<CellState> {
        self.inner.read().cells.clone()
    }

    pub fn stats(&self) -> BackgroundStats {
        let r = self.inner.read();
        BackgroundStats {
            frames_ingested: r.frames_ingested,
            settled: r.settled,
            invalid_channel_points: r.invalid_channel_points,
            invalid_azimuth_points: r.invalid_azimuth_points,
            invalid_range_points: r.invalid_range_points,
            bucket_edges_m: r.params.histogram_bucket_edges_m.clone(),
            accepted_by_range: r.accepted_by_range.clone(),
            rejected_by_range: r.rejected_by_range.clone(),
            changes_since_snapshot: r.changes_since_snapshot,
            region_count: r.regions.as_ref().map(|m| m.regions().len()).unwrap_or(0),
        }
    }

    /// Aggregate the grid into a `(rows, cols)` heatmap of mean confidence
    /// and spread.
    pub fn heatmap(&self, ring_step: usize, az_step: usize) -> Heatmap {
        let ring_step = ring_step.max(1);
        let az_step = az_step.max(1);
        let rows = (self.rings as usize).div_ceil(ring_step);
        let cols = (self.az_bins as usize).div_ceil(az_step);
        let mut mean_times_seen = vec![0.0; rows * cols];
        let mut mean_spread_m = vec![0.0; rows * cols];
        let mut counts = vec![0u32; rows * cols];

        let r = self.inner.read();
        for ring in 0..self.rings as usize {
            for az in 0..self.az_bins as usize {
                let cell = &r.cells[ring * self.az_bins as usize + az];
                let out = (ring / ring_step) * cols + az / az_step;
                mean_times_seen[out] += cell.times_seen as f64;
                mean_spread_m[out] += cell.spread_m as f64;
                counts[out] += 1;
            }
        }
        drop(r);

        for i in 0..rows * cols {
            if counts[i] > 0 {
                mean_times_seen[i] /= counts[i] as f64;
                mean_spread_m[i] /= counts[i] as f64;
            }
        }
        Heatmap {
            rows,
            cols,
            mean_times_seen,
            mean_spread_m,
        }
    }

    /// Render learned background cells as world-frame `x y z` text rows.
    pub fn export_asc<W: Write>(&self, out: &mut W) -> Result<()> {
        let cells = self.cells();
        for ring in 0..self.rings {
            let elevation_deg = self
                .ring_elevations_deg
                .as_ref()
                .map(|e| e[ring as usize] as f64)
                .unwrap_or(0.0);
            for az in 0..self.az_bins {
                let cell = &cells[cell_index(ring, az, self.az_bins)];
                if cell.times_seen == 0 {
                    continue;
                }
                let az_deg = (az as f64 + 0.5) / self.az_bins as f64 * 360.0;
                let sensor_pt = polar_to_sensor(cell.avg_range_m as f64, az_deg, elevation_deg);
                let world = self.world_pose * sensor_pt;
                writeln!(out, "{:.3} {:.3} {:.3}", world.x, world.y, world.z)?;
            }
        }
        Ok(())
    }

    /// Clear all cells and counters back to the unsettled state.
    pub fn reset(&self) {
        let mut w = self.inner.write();
        w.cells.fill(CellState::default());
        w.changes_since_snapshot = 0;
        w.frames_ingested = 0;
        w.first_frame_ns = None;
        w.settled = false;
        w.regions = None;
        w.region_acc = Some(RegionAccumulator::new(self.rings, self.az_bins));
        w.last_snapshot_id = None;
        for b in w.accepted_by_range.iter_mut() {
            *b = 0;
        }
        for b in w.rejected_by_range.iter_mut() {
            *b = 0;
        }
        warn!("sensor {}: background model reset", self.sensor_id);
    }

    pub fn set_params(&self, params: BackgroundParams) {
        let mut w = self.inner.write();
        let buckets = params.histogram_bucket_edges_m.len() + 1;
        if buckets != w.accepted_by_range.len() {
            w.accepted_by_range = vec![0; buckets];
            w.rejected_by_range = vec![0; buckets];
        }
        w.params = params;
    }

    /// Same-ring neighbours at azimuth bin ±1, copied for the classifier.
    fn neighbor_states(&self, w: &GridInner, idx: usize) -> [Option<CellState>; 2] {
        if self.az_bins < 2 {
            return [None, None];
        }
        let az_bins = self.az_bins as usize;
        let ring = idx / az_bins;
        let az = idx % az_bins;
        let prev = ring * az_bins + if az == 0 { az_bins - 1 } else { az - 1 };
        let next = ring * az_bins + if az + 1 == az_bins { 0 } else { az + 1 };
        [Some(w.cells[prev]), Some(w.cells[next])]
    }
}

impl GridInner {
    /// Classify one observed cell and update it. Returns `true` for
    /// foreground.
    fn process_cell(
        &mut self,
        az_bins: u16,
        idx: usize,
        obs: &CellObs,
        neighbors: &[Option<CellState>; 2],
        elapsed_ns: i64,
        now: i64,
    ) -> bool {
        let obs_mean = obs.sum_range / obs.count as f64;
        let obs_spread_seed = ((obs.max_range - obs.min_range) as f64 / 2.0).max(0.05);

        // Region tuning overrides, when regions have been identified.
        let (noise_scale, extra_neighbors, alpha_scale) = match self
            .regions
            .as_ref()
            .and_then(|m| m.tuning_for_cell(idx))
        {
            Some(t) => (t.noise_scale, t.extra_neighbor_confirmation, t.alpha_scale),
            None => (1.0, 0, 1.0),
        };
        let noise_fraction = self.params.noise_relative_fraction * noise_scale;
        let neighbor_confirmation = if self.params.neighbor_confirmation_count == 0 {
            0
        } else {
            self.params.neighbor_confirmation_count + extra_neighbors
        };

        let debug_cell = self
            .params
            .debug_cell_window
            .as_ref()
            .is_some_and(|win| win.contains((idx / az_bins as usize) as u16, (idx % az_bins as usize) as u16));

        let params = &self.params;
        let cell = &mut self.cells[idx];

        // Frozen cells are foreground by fiat; nothing else is touched.
        if cell.frozen_until_ns != 0 && now < cell.frozen_until_ns {
            if debug_cell {
                debug!("cell {idx}: frozen until {}, obs {obs_mean:.2}", cell.frozen_until_ns);
            }
            return true;
        }
        // Thaw on the first observation past the freeze.
        if cell.frozen_until_ns != 0 {
            cell.frozen_until_ns = 0;
            cell.recent_fg_count = 0;
        }

        // Empty cell: seed or bootstrap the EMA from this observation.
        if cell.times_seen == 0 {
            cell.avg_range_m = obs_mean as f32;
            cell.spread_m = obs_spread_seed as f32;
            cell.last_update_ns = now;
            if params.seed_from_first_observation {
                cell.times_seen = 1;
                return false;
            }
            cell.recent_fg_count = cell.recent_fg_count.saturating_add(1);
            return true;
        }

        // Effective alpha.
        let cell_warmup = (cell.times_seen as u64) < params.warmup_min_frames
            || elapsed_ns < params.warmup_duration_ns;
        let base_alpha = if !cell_warmup && self.settled {
            params
                .post_settle_update_fraction
                .unwrap_or(params.update_fraction)
        } else {
            params.update_fraction
        };
        let alpha = base_alpha * alpha_scale;

        // Closeness threshold, widened for low-confidence cells.
        let spread = cell.spread_m as f64;
        let mut threshold = params.closeness_sensitivity_multiplier
            * (spread + noise_fraction * obs_mean + 0.01)
            + params.safety_margin_m;
        if cell.times_seen < LOW_CONFIDENCE_SEEN {
            threshold *= 1.0 + 3.0 * (LOW_CONFIDENCE_SEEN - cell.times_seen) as f64 / 100.0;
        }

        let deviation = (cell.avg_range_m as f64 - obs_mean).abs();
        let mut is_background = deviation <= threshold;
        let own_match = is_background;

        // Neighbour confirmation: same ring, azimuth bin +-1.
        if !is_background && neighbor_confirmation > 0 {
            let mut confirmations = 0u16;
            for nb in neighbors.iter().flatten() {
                if nb.times_seen == 0 {
                    continue;
                }
                let nb_threshold = params.closeness_sensitivity_multiplier
                    * (nb.spread_m as f64 + noise_fraction * obs_mean + 0.01)
                    + params.safety_margin_m;
                if (nb.avg_range_m as f64 - obs_mean).abs() <= nb_threshold {
                    confirmations += 1;
                }
            }
            if confirmations >= neighbor_confirmation {
                is_background = true;
            }
        }

        // Locked baseline overrides EMA drift for high-confidence cells.
        if !is_background
            && cell.times_seen >= params.locked_baseline_threshold
            && cell.locked_at_count >= params.locked_baseline_threshold
        {
            let window = (params.locked_baseline_multiplier * cell.locked_spread_m as f64
                + noise_fraction * obs_mean
                + params.safety_margin_m)
                .max(0.1);
            if (cell.locked_baseline_m as f64 - obs_mean).abs() <= window {
                is_background = true;
            }
        }

        // Deadlock breaker: a cell pinned at the confidence floor with a
        // persistent foreground streak may re-acquire if the observation is
        // not wildly off.
        if !is_background
            && cell.times_seen == params.min_confidence_floor
            && cell.recent_fg_count > 4
            && deviation <= params.freeze_threshold_multiplier * threshold
        {
            is_background = true;
        }

        if debug_cell {
            debug!(
                "cell {idx}: obs {obs_mean:.2} avg {:.2} spread {:.3} thr {threshold:.3} seen {} fg_streak {} -> {}",
                cell.avg_range_m,
                cell.spread_m,
                cell.times_seen,
                cell.recent_fg_count,
                if is_background { "bg" } else { "fg" },
            );
        }

        let bucket = range_bucket(&params.histogram_bucket_edges_m, obs_mean);

        if is_background {
            let mut eff_alpha = alpha;
            if cell.recent_fg_count > 0 && own_match {
                // Re-acquisition: converge faster, capped for stability.
                eff_alpha = (alpha * params.reacquisition_boost_multiplier).min(0.5);
            }
            let prev_mean = cell.avg_range_m as f64;
            let deviation_prev = (obs_mean - prev_mean).abs();
            cell.avg_range_m = (prev_mean + eff_alpha * (obs_mean - prev_mean)) as f32;
            cell.spread_m = ((1.0 - eff_alpha) * spread + eff_alpha * deviation_prev) as f32;
            cell.times_seen = cell.times_seen.saturating_add(1);
            cell.recent_fg_count = cell.recent_fg_count.saturating_sub(1);
            cell.last_update_ns = now;

            // Refresh the locked baseline only once confidence has grown
            // substantially past the previous lock.
            if cell.times_seen >= params.locked_baseline_threshold
                && (cell.locked_at_count == 0
                    || cell.times_seen >= cell.locked_at_count.saturating_mul(2))
            {
                cell.locked_baseline_m = cell.avg_range_m;
                cell.locked_spread_m = cell.spread_m;
                cell.locked_at_count = cell.times_seen;
            }
            self.accepted_by_range[bucket] += 1;
            false
        } else {
            if cell.times_seen > params.min_confidence_floor {
                cell.times_seen -= 1;
            }
            cell.recent_fg_count = cell.recent_fg_count.saturating_add(1);
            if deviation > params.freeze_threshold_multiplier * threshold
                && cell.times_seen < LOW_CONFIDENCE_SEEN
            {
                cell.frozen_until_ns = now + params.freeze_duration_ns;
            }
            cell.last_update_ns = now;
            self.rejected_by_range[bucket] += 1;
            true
        }
    }
}

fn range_bucket(edges: &[f64], range_m: f64) -> usize {
    edges
        .iter()
        .position(|&edge| range_m < edge)
        .unwrap_or(edges.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use sweep_types::{FrameNum, PolarPoint, RegionParams};

    const MS: i64 = 1_000_000;

    fn sensor(rings: u16, az_bins: u16) -> SensorParams {
        SensorParams {
            rings,
            azimuth_bins: az_bins,
            ..SensorParams::default()
        }
    }

    fn quick_params() -> BackgroundParams {
        BackgroundParams {
            warmup_min_frames: 3,
            warmup_duration_ns: 0,
            neighbor_confirmation_count: 0,
            seed_from_first_observation: true,
            ..BackgroundParams::default()
        }
    }

    fn frame_with(points: Vec<PolarPoint>, frame: u64) -> Frame {
        let start_ns = points.first().map(|p| p.timestamp_ns).unwrap_or(0);
        let end_ns = points.last().map(|p| p.timestamp_ns).unwrap_or(0);
        Frame {
            frame: FrameNum(frame),
            points,
            start_ns,
            end_ns,
            min_azimuth_deg: 0.0,
            max_azimuth_deg: 360.0,
        }
    }

    fn pt(channel: u16, azimuth_deg: f32, range_m: f32, timestamp_ns: i64) -> PolarPoint {
        PolarPoint {
            channel,
            azimuth_deg,
            elevation_deg: 0.0,
            range_m,
            intensity: 100,
            timestamp_ns,
            block_id: 0,
        }
    }

    fn settle(model: &BackgroundModel, range_m: f32, frames: u64) -> i64 {
        let mut t = 0;
        for f in 0..frames {
            t = (f as i64 + 1) * 100 * MS;
            let report = model.ingest(&frame_with(vec![pt(1, 0.0, range_m, t)], f));
            assert_eq!(report.foreground_points, 0);
        }
        t
    }

    #[test]
    fn warmup_suppresses_foreground() {
        let model = BackgroundModel::new(
            &sensor(4, 8),
            BackgroundParams {
                warmup_min_frames: 5,
                ..quick_params()
            },
            RegionParams::default(),
        );
        settle(&model, 10.0, 3);
        assert!(!model.settled());
        let cells = model.cells();
        assert!((cells[0].avg_range_m - 10.0).abs() < 0.01);
    }

    #[test]
    fn foreground_after_settle() {
        let model = BackgroundModel::new(&sensor(4, 8), quick_params(), RegionParams::default());
        let t = settle(&model, 10.0, 3);
        assert!(model.settled());
        let report = model.ingest(&frame_with(vec![pt(1, 0.0, 3.0, t + 100 * MS)], 3));
        assert_eq!(report.mask, vec![true]);
    }

    #[test]
    fn freeze_and_thaw() {
        let model = BackgroundModel::new(
            &sensor(4, 8),
            BackgroundParams {
                freeze_duration_ns: 50 * MS,
                ..quick_params()
            },
            RegionParams::default(),
        );
        let t0 = settle(&model, 10.0, 3);

        // Wild deviation on a low-confidence cell freezes it.
        let report = model.ingest(&frame_with(vec![pt(1, 0.0, 100.0, t0 + 10 * MS)], 3));
        assert_eq!(report.mask, vec![true]);
        let frozen_until = model.cells()[0].frozen_until_ns;
        assert!(frozen_until > t0);
        let avg_before = model.cells()[0].avg_range_m;

        // While frozen: foreground by fiat, EMA untouched.
        let report = model.ingest(&frame_with(vec![pt(1, 0.0, 100.0, t0 + 20 * MS)], 4));
        assert_eq!(report.mask, vec![true]);
        assert_eq!(model.cells()[0].avg_range_m, avg_before);
        assert_eq!(model.cells()[0].frozen_until_ns, frozen_until);

        // Past the freeze: thaw, re-acquire background.
        let report = model.ingest(&frame_with(vec![pt(1, 0.0, 10.0, t0 + 90 * MS)], 5));
        assert_eq!(report.mask, vec![false]);
        assert_eq!(model.cells()[0].frozen_until_ns, 0);
        assert_eq!(model.cells()[0].recent_fg_count, 0);
    }

    #[test]
    fn spread_never_negative_and_floor_holds() {
        let params = BackgroundParams {
            min_confidence_floor: 2,
            freeze_duration_ns: 0,
            ..quick_params()
        };
        let model = BackgroundModel::new(&sensor(2, 4), params, RegionParams::default());
        let mut t = 0;
        // Alternate matching and wildly-off ranges for a while.
        for f in 0..50u64 {
            t += 100 * MS;
            let range = if f % 2 == 0 { 10.0 } else { 80.0 };
            model.ingest(&frame_with(vec![pt(1, 0.0, range, t)], f));
            let cell = model.cells()[0];
            assert!(cell.spread_m >= 0.0);
        }
        // The cell has seen enough background to sit at/above the floor.
        assert!(model.cells()[0].times_seen >= 2);
    }

    #[test]
    fn invalid_channel_counted_and_foreground() {
        let model = BackgroundModel::new(&sensor(2, 4), quick_params(), RegionParams::default());
        let t = settle(&model, 10.0, 3);
        let report = model.ingest(&frame_with(
            vec![pt(9, 0.0, 10.0, t + 100 * MS), pt(1, 0.0, 10.0, t + 100 * MS)],
            3,
        ));
        assert_eq!(report.mask, vec![true, false]);
        assert_eq!(report.invalid_points, 1);
        assert_eq!(model.stats().invalid_channel_points, 1);
    }

    #[test]
    fn invalid_range_counted_and_foreground() {
        let model = BackgroundModel::new(&sensor(2, 4), quick_params(), RegionParams::default());
        let t = settle(&model, 10.0, 3);
        let report = model.ingest(&frame_with(
            vec![
                pt(1, 0.0, f32::NAN, t + 100 * MS),
                pt(1, 0.0, 0.0, t + 100 * MS),
                pt(1, 0.0, 10.0, t + 100 * MS),
            ],
            3,
        ));
        assert_eq!(report.mask, vec![true, true, false]);
        assert_eq!(report.invalid_points, 2);
        assert_eq!(model.stats().invalid_range_points, 2);
        // Malformed ranges never touch the model.
        assert!((model.cells()[0].avg_range_m - 10.0).abs() < 0.1);
    }

    #[test]
    fn snapshot_reconciles_change_counter() {
        let model = BackgroundModel::new(&sensor(2, 4), quick_params(), RegionParams::default());
        settle(&model, 10.0, 3);
        assert!(model.changes_since_snapshot() > 0);
        let store = crate::store::MemoryStore::new();
        let id = model
            .snapshot(SnapshotReason::Manual, &store)
            .expect("snapshot");
        assert!(id >= 0);
        assert_eq!(model.changes_since_snapshot(), 0);

        // Round trip through the codec.
        let snap = store.bg_snapshots()[0].clone();
        let (rings, az_bins, cells) = snapshot::decode_cells(&snap.cells_gz).unwrap();
        assert_eq!((rings, az_bins), (2, 4));
        assert_eq!(cells, model.cells());
    }

    #[test]
    fn settling_identifies_regions() {
        let params = BackgroundParams {
            warmup_min_frames: 10,
            ..quick_params()
        };
        let model = BackgroundModel::new(&sensor(1, 8), params, RegionParams::default());
        let mut t = 0;
        let mut report = None;
        for f in 0..10u64 {
            t += 100 * MS;
            let points = (0..8)
                .map(|az| {
                    // Cells differ in stability: jitter grows with azimuth.
                    let jitter = if f % 2 == 0 { 1.0 } else { -1.0 };
                    pt(
                        1,
                        az as f32 * 45.0 + 1.0,
                        10.0 + jitter * 0.02 * az as f32,
                        t,
                    )
                })
                .collect();
            report = Some(model.ingest(&frame_with(points, f)));
        }
        assert!(report.unwrap().settled_now);
        assert!(model.stats().region_count > 0);
    }
}
