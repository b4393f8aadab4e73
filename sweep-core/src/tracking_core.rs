//! Multi-target tracking over world-frame clusters.
//!
//! One constant-velocity Kalman filter per track. Each frame: predict all
//! live tracks to the frame timestamp, build a gated cost matrix of squared
//! Mahalanobis distances, resolve associations greedily in ascending cost
//! (ties by track id, then cluster index), then run the lifecycle machine:
//! Tentative tracks confirm on enough hits, tracks die on enough consecutive
//! misses and linger in a bounded grace buffer.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use adskalman::{CovarianceUpdateMethod, ObservationModel, TransitionModelLinearNoControl};
use adskalman::StateAndCovariance;
use nalgebra::{Matrix4, U4, Vector2, Vector4};
use parking_lot::Mutex;
use tracing::{debug, warn};

use sweep_tracking::{GroundPlaneCvModel, PlanarPositionModel, squared_mahalanobis};
use sweep_types::{
    ObjectClass, SensorId, TrackId, TrackObservation, TrackQuality, TrackRow, TrackState,
    TrackerParams, WorldCluster,
};

use crate::classifier::TrackFeatures;
use crate::regions::percentile_sorted;

/// A live model of one moving object.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub state: TrackState,
    pub first_ns: i64,
    pub last_ns: i64,
    estimate: StateAndCovariance<f64, U4>,
    pub hits: u32,
    /// Consecutive missed frames; reset on every association.
    pub misses: u32,
    total_misses: u32,
    pub observation_count: u32,
    avg_length: f64,
    avg_width: f64,
    avg_height: f64,
    avg_height_p95: f64,
    intensity_mean: f64,
    pub peak_speed: f64,
    speed_sum: f64,
    speed_history: VecDeque<f64>,
    pub heading_rad: f64,
    pub class: ObjectClass,
    pub class_confidence: f64,
    pub user_label: Option<String>,
    pub quality_label: Option<String>,
    occlusion_count: u32,
    path_length_m: f64,
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
    pub was_confirmed: bool,
}

impl Track {
    fn spawn(id: TrackId, cluster: &WorldCluster, now_ns: i64, params: &TrackerParams) -> Self {
        let state = Vector4::new(cluster.x, cluster.y, 0.0, 0.0);
        let position_var = params.initial_position_std_meters.powi(2);
        let vel_var = params.initial_vel_std_meters_per_sec.powi(2);
        let mut covariance = Matrix4::identity() * position_var;
        covariance[(2, 2)] = vel_var;
        covariance[(3, 3)] = vel_var;
        let (length, width) = effective_footprint(cluster);
        Self {
            id,
            state: TrackState::Tentative,
            first_ns: now_ns,
            last_ns: now_ns,
            estimate: StateAndCovariance::new(state, covariance),
            hits: 1,
            misses: 0,
            total_misses: 0,
            observation_count: 1,
            avg_length: length,
            avg_width: width,
            avg_height: cluster.height,
            avg_height_p95: cluster.height_p95,
            intensity_mean: cluster.intensity_mean,
            peak_speed: 0.0,
            speed_sum: 0.0,
            speed_history: VecDeque::new(),
            heading_rad: cluster.obb.map(|o| o.heading_rad).unwrap_or(0.0),
            class: ObjectClass::Other,
            class_confidence: 0.0,
            user_label: None,
            quality_label: None,
            occlusion_count: 0,
            path_length_m: 0.0,
            min_x: cluster.x,
            max_x: cluster.x,
            min_y: cluster.y,
            max_y: cluster.y,
            was_confirmed: false,
        }
    }

    pub fn x(&self) -> f64 {
        self.estimate.state()[0]
    }
    pub fn y(&self) -> f64 {
        self.estimate.state()[1]
    }
    pub fn vx(&self) -> f64 {
        self.estimate.state()[2]
    }
    pub fn vy(&self) -> f64 {
        self.estimate.state()[3]
    }
    pub fn speed(&self) -> f64 {
        self.vx().hypot(self.vy())
    }

    pub fn mean_speed(&self) -> f64 {
        if self.observation_count > 1 {
            self.speed_sum / (self.observation_count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn speed_percentile(&self, p: f64) -> f64 {
        if self.speed_history.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.speed_history.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        percentile_sorted(&sorted, p)
    }

    pub fn duration_s(&self) -> f64 {
        (self.last_ns - self.first_ns) as f64 / 1e9
    }

    pub fn quality(&self) -> TrackQuality {
        let frames = self.hits + self.total_misses;
        TrackQuality {
            occlusion_count: self.occlusion_count,
            track_length_m: self.path_length_m,
            duration_s: self.duration_s(),
            noise_ratio: if frames > 0 {
                self.total_misses as f64 / frames as f64
            } else {
                0.0
            },
            spatial_coverage_m2: (self.max_x - self.min_x) * (self.max_y - self.min_y),
        }
    }

    pub fn features(&self) -> TrackFeatures {
        TrackFeatures {
            avg_height: self.avg_height,
            avg_length: self.avg_length,
            avg_width: self.avg_width,
            height_p95: self.avg_height_p95,
            avg_speed: self.mean_speed(),
            peak_speed: self.peak_speed,
            speed_p50: self.speed_percentile(50.0),
            speed_p85: self.speed_percentile(85.0),
            speed_p95: self.speed_percentile(95.0),
            observation_count: self.observation_count,
            duration_s: self.duration_s(),
        }
    }

    pub fn to_row(&self, sensor_id: &SensorId) -> TrackRow {
        let quality = self.quality();
        TrackRow {
            track_id: self.id,
            sensor_id: sensor_id.clone(),
            state: self.state,
            class: self.class,
            class_confidence: self.class_confidence,
            first_ns: self.first_ns,
            last_ns: self.last_ns,
            hits: self.hits,
            misses: self.total_misses,
            observation_count: self.observation_count,
            x: self.x(),
            y: self.y(),
            vx: self.vx(),
            vy: self.vy(),
            heading_rad: self.heading_rad,
            avg_length: self.avg_length,
            avg_width: self.avg_width,
            avg_height: self.avg_height,
            intensity_mean: self.intensity_mean,
            peak_speed: self.peak_speed,
            mean_speed: self.mean_speed(),
            occlusion_count: quality.occlusion_count,
            track_length_m: quality.track_length_m,
            duration_s: quality.duration_s,
            noise_ratio: quality.noise_ratio,
            spatial_coverage_m2: quality.spatial_coverage_m2,
            user_label: self.user_label.clone(),
            quality_label: self.quality_label.clone(),
        }
    }

    /// Fold an associated cluster into the track. Returns `true` when the
    /// track transitioned to Confirmed on this observation.
    fn apply_observation(
        &mut self,
        posterior: StateAndCovariance<f64, U4>,
        cluster: &WorldCluster,
        now_ns: i64,
        params: &TrackerParams,
    ) -> (bool, TrackObservation) {
        if self.misses > 0 {
            self.occlusion_count += 1;
        }
        self.misses = 0;

        let prev = (self.x(), self.y());
        self.estimate = posterior;
        self.path_length_m += (self.x() - prev.0).hypot(self.y() - prev.1);

        self.hits += 1;
        self.observation_count += 1;
        self.last_ns = now_ns;

        let speed = self.speed();
        self.peak_speed = self.peak_speed.max(speed);
        self.speed_sum += speed;
        self.speed_history.push_back(speed);
        while self.speed_history.len() > params.speed_history_len {
            self.speed_history.pop_front();
        }
        if speed > 0.1 {
            self.heading_rad = self.vy().atan2(self.vx());
        }

        let n = self.observation_count as f64;
        let (length, width) = effective_footprint(cluster);
        self.avg_length += (length - self.avg_length) / n;
        self.avg_width += (width - self.avg_width) / n;
        self.avg_height += (cluster.height - self.avg_height) / n;
        self.avg_height_p95 += (cluster.height_p95 - self.avg_height_p95) / n;
        self.intensity_mean += (cluster.intensity_mean - self.intensity_mean) / n;

        self.min_x = self.min_x.min(self.x());
        self.max_x = self.max_x.max(self.x());
        self.min_y = self.min_y.min(self.y());
        self.max_y = self.max_y.max(self.y());

        let mut confirmed_now = false;
        if self.state == TrackState::Tentative && self.hits >= params.hits_to_confirm {
            self.state = TrackState::Confirmed;
            self.was_confirmed = true;
            confirmed_now = true;
        }

        let observation = TrackObservation {
            track_id: self.id,
            timestamp_ns: now_ns,
            x: self.x(),
            y: self.y(),
            z: cluster.z,
            vx: self.vx(),
            vy: self.vy(),
            vz: 0.0,
            speed,
            heading_rad: self.heading_rad,
            length,
            width,
            height: cluster.height,
            height_p95: cluster.height_p95,
            intensity_mean: cluster.intensity_mean,
        };
        (confirmed_now, observation)
    }
}

/// Prefer the oriented-box footprint when one was fit.
fn effective_footprint(cluster: &WorldCluster) -> (f64, f64) {
    match &cluster.obb {
        Some(obb) => (obb.length, obb.width),
        None => (cluster.length, cluster.width),
    }
}

/// A track that left the live set, retained in the grace buffer.
#[derive(Debug, Clone)]
pub struct RetiredTrack {
    pub track: Track,
    pub was_confirmed: bool,
    pub deleted_at_ns: i64,
}

/// What one frame update did.
#[derive(Debug, Default)]
pub struct FrameUpdate {
    pub observations: Vec<TrackObservation>,
    pub spawned: Vec<TrackId>,
    pub confirmed: Vec<TrackId>,
    pub deleted: Vec<RetiredTrack>,
    /// Tentative tracks culled for capacity this frame.
    pub culled: usize,
}

struct TrackerInner {
    tracks: BTreeMap<TrackId, Track>,
    grace: VecDeque<RetiredTrack>,
    next_id: u64,
    last_update_ns: Option<i64>,
}

pub struct Tracker {
    params: TrackerParams,
    motion: GroundPlaneCvModel<f64>,
    observation: PlanarPositionModel<f64>,
    inner: Mutex<TrackerInner>,
}

impl Tracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            motion: GroundPlaneCvModel::new(params.process_noise_pos, params.process_noise_vel),
            observation: PlanarPositionModel::new(params.measurement_noise),
            inner: Mutex::new(TrackerInner {
                tracks: BTreeMap::new(),
                grace: VecDeque::new(),
                next_id: 0,
                last_update_ns: None,
            }),
            params,
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().tracks.len()
    }

    /// Run one frame of predict / associate / lifecycle.
    pub fn update(&self, clusters: &[WorldCluster], now_ns: i64) -> FrameUpdate {
        let mut out = FrameUpdate::default();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        // Predict to the frame timestamp.
        let dt = match inner.last_update_ns {
            None => 0.0,
            Some(prev) => {
                let dt = (now_ns - prev) as f64 / 1e9;
                if dt < 0.0 {
                    warn!("frame timestamp went backwards by {:.3} s; clamping dt", -dt);
                    0.0
                } else {
                    dt
                }
            }
        };
        inner.last_update_ns = Some(now_ns);
        if dt > 0.0 {
            let motion = self.motion.calc_for_dt(dt);
            for track in inner.tracks.values_mut() {
                track.estimate = motion.predict(&track.estimate);
            }
        }

        // Gated cost matrix, flattened to admissible candidate pairs.
        let mut candidates: Vec<(f64, TrackId, usize)> = Vec::new();
        for (&track_id, track) in inner.tracks.iter() {
            for (cluster_idx, cluster) in clusters.iter().enumerate() {
                let observed = Vector2::new(cluster.x, cluster.y);
                if let Some(d2) = squared_mahalanobis(&self.observation, &track.estimate, &observed)
                {
                    if d2 <= self.params.gating_distance_squared {
                        candidates.push((d2, track_id, cluster_idx));
                    }
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        // Greedy resolution in ascending cost.
        let mut used_tracks: BTreeSet<TrackId> = BTreeSet::new();
        let mut used_clusters: BTreeSet<usize> = BTreeSet::new();
        for (d2, track_id, cluster_idx) in candidates {
            if used_tracks.contains(&track_id) || used_clusters.contains(&cluster_idx) {
                continue;
            }
            let cluster = &clusters[cluster_idx];
            let track = inner.tracks.get_mut(&track_id).unwrap();
            let observed = Vector2::new(cluster.x, cluster.y);
            let posterior = match self.observation.update(
                &track.estimate,
                &observed,
                CovarianceUpdateMethod::JosephForm,
            ) {
                Ok(posterior) => posterior,
                Err(e) => {
                    warn!("track {track_id}: measurement update failed: {e:?}");
                    continue;
                }
            };
            used_tracks.insert(track_id);
            used_clusters.insert(cluster_idx);
            debug!("track {track_id} <- cluster {cluster_idx} (d2 {d2:.2})");
            let (confirmed_now, observation) =
                track.apply_observation(posterior, cluster, now_ns, &self.params);
            out.observations.push(observation);
            if confirmed_now {
                out.confirmed.push(track_id);
            }
        }

        // Unassociated clusters spawn Tentative tracks.
        for (cluster_idx, cluster) in clusters.iter().enumerate() {
            if used_clusters.contains(&cluster_idx) {
                continue;
            }
            let id = TrackId(inner.next_id);
            inner.next_id += 1;
            let track = Track::spawn(id, cluster, now_ns, &self.params);
            inner.tracks.insert(id, track);
            out.spawned.push(id);
        }

        // Unassociated tracks miss; enough consecutive misses deletes.
        let mut dead: Vec<TrackId> = Vec::new();
        for (&track_id, track) in inner.tracks.iter_mut() {
            if used_tracks.contains(&track_id) || out.spawned.contains(&track_id) {
                continue;
            }
            track.misses += 1;
            track.total_misses += 1;
            let limit = match track.state {
                TrackState::Tentative => self.params.max_misses_tentative,
                TrackState::Confirmed => self.params.max_misses_confirmed,
                TrackState::Deleted => 0,
            };
            if track.misses >= limit {
                dead.push(track_id);
            }
        }
        for track_id in dead {
            let mut track = inner.tracks.remove(&track_id).unwrap();
            let was_confirmed = track.was_confirmed;
            track.state = TrackState::Deleted;
            debug!("track {track_id} deleted (confirmed: {was_confirmed})");
            let retired = RetiredTrack {
                track,
                was_confirmed,
                deleted_at_ns: now_ns,
            };
            inner.grace.push_back(retired.clone());
            out.deleted.push(retired);
        }

        // Capacity: cull oldest-by-last-update Tentative tracks first.
        while inner.tracks.len() > self.params.max_tracks {
            let oldest_tentative = inner
                .tracks
                .values()
                .filter(|t| t.state == TrackState::Tentative)
                .min_by_key(|t| (t.last_ns, t.id))
                .map(|t| t.id);
            match oldest_tentative {
                Some(id) => {
                    inner.tracks.remove(&id);
                    out.culled += 1;
                }
                None => {
                    warn!(
                        "tracker overloaded: {} confirmed tracks exceed max_tracks={}",
                        inner.tracks.len(),
                        self.params.max_tracks
                    );
                    break;
                }
            }
        }

        // Expire the grace buffer.
        while let Some(front) = inner.grace.front() {
            if front.deleted_at_ns + self.params.deleted_track_grace_period_ns < now_ns {
                inner.grace.pop_front();
            } else {
                break;
            }
        }

        out
    }

    /// Read-only copy of all live tracks, ascending by id.
    pub fn live_tracks(&self) -> Vec<Track> {
        self.inner.lock().tracks.values().cloned().collect()
    }

    /// Deleted tracks still within the grace window, both Confirmed- and
    /// Tentative-origin; callers filter on `was_confirmed`.
    pub fn recently_deleted(&self) -> Vec<RetiredTrack> {
        self.inner.lock().grace.iter().cloned().collect()
    }

    pub fn set_classification(&self, id: TrackId, class: ObjectClass, confidence: f64) {
        if let Some(track) = self.inner.lock().tracks.get_mut(&id) {
            track.class = class;
            track.class_confidence = confidence;
        }
    }

    pub fn set_labels(
        &self,
        id: TrackId,
        user_label: Option<String>,
        quality_label: Option<String>,
    ) {
        if let Some(track) = self.inner.lock().tracks.get_mut(&id) {
            track.user_label = user_label;
            track.quality_label = quality_label;
        }
    }

    /// Force-retire every live track, e.g. at end of run.
    pub fn retire_all(&self, now_ns: i64) -> Vec<RetiredTrack> {
        let mut inner = self.inner.lock();
        let tracks = std::mem::take(&mut inner.tracks);
        let mut retired = Vec::with_capacity(tracks.len());
        for (_, mut track) in tracks {
            let was_confirmed = track.was_confirmed;
            track.state = TrackState::Deleted;
            let entry = RetiredTrack {
                track,
                was_confirmed,
                deleted_at_ns: now_ns,
            };
            inner.grace.push_back(entry.clone());
            retired.push(entry);
        }
        retired
    }
}
