//! Spatial clustering of world-frame foreground points.
//!
//! DBSCAN on the road plane (x, y) over a uniform grid index with cell size
//! `eps`, so a neighbour query only inspects the 3x3 neighbourhood of the
//! query cell. Output order is deterministic: clusters are numbered in order
//! of their seed point.

use std::collections::{BTreeMap, VecDeque};

use itertools::Itertools;

use sweep_types::{ClusterParams, OrientedBox, WorldCluster};

use crate::regions::percentile_sorted;

/// One foreground point in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: u8,
}

pub struct Clusterer {
    params: ClusterParams,
}

const UNVISITED: i32 = -2;
const NOISE: i32 = -1;

impl Clusterer {
    pub fn new(params: ClusterParams) -> Self {
        Self { params }
    }

    /// Group points into clusters; returns them ordered by cluster id.
    pub fn cluster(&self, points: &[WorldPoint], timestamp_ns: i64) -> Vec<WorldCluster> {
        let eps = self.params.eps_m;
        let eps2 = eps * eps;
        let index = build_grid_index(points, eps);

        let mut labels = vec![UNVISITED; points.len()];
        let mut next_cluster: i32 = 0;

        for i in 0..points.len() {
            if labels[i] != UNVISITED {
                continue;
            }
            let seeds = neighbors_within(points, &index, eps, eps2, i);
            if seeds.len() < self.params.min_pts {
                labels[i] = NOISE;
                continue;
            }
            let cluster_id = next_cluster;
            next_cluster += 1;
            labels[i] = cluster_id;
            let mut queue: VecDeque<usize> = seeds.into();
            while let Some(j) = queue.pop_front() {
                if labels[j] == NOISE {
                    // Border point reached from a core point.
                    labels[j] = cluster_id;
                    continue;
                }
                if labels[j] != UNVISITED {
                    continue;
                }
                labels[j] = cluster_id;
                let j_neighbors = neighbors_within(points, &index, eps, eps2, j);
                if j_neighbors.len() >= self.params.min_pts {
                    queue.extend(j_neighbors);
                }
            }
        }

        let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            if label >= 0 {
                members.entry(label).or_default().push(i);
            }
        }

        members
            .into_values()
            .filter(|m| m.len() >= self.params.min_cluster_points)
            .map(|m| self.summarize(points, &m, timestamp_ns))
            .collect()
    }

    fn summarize(&self, points: &[WorldPoint], members: &[usize], timestamp_ns: i64) -> WorldCluster {
        let n = members.len() as f64;
        let (mut sx, mut sy, mut sz, mut si) = (0.0, 0.0, 0.0, 0.0);
        let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_z, mut max_z) = (f64::INFINITY, f64::NEG_INFINITY);
        let mut zs: Vec<f64> = Vec::with_capacity(members.len());
        for &i in members {
            let p = &points[i];
            sx += p.x;
            sy += p.y;
            sz += p.z;
            si += p.intensity as f64;
            min_x = min_x.min(p.x);
            max_x = max_x.max(p.x);
            min_y = min_y.min(p.y);
            max_y = max_y.max(p.y);
            min_z = min_z.min(p.z);
            max_z = max_z.max(p.z);
            zs.push(p.z);
        }
        let (cx, cy, cz) = (sx / n, sy / n, sz / n);
        zs.sort_by(f64::total_cmp);
        let height_p95 = percentile_sorted(&zs, 95.0) - min_z;

        let obb = if members.len() >= self.params.obb_min_points {
            fit_obb(points, members, cx, cy, min_z, max_z)
        } else {
            None
        };

        WorldCluster {
            x: cx,
            y: cy,
            z: cz,
            length: max_x - min_x,
            width: max_y - min_y,
            height: max_z - min_z,
            obb,
            height_p95,
            intensity_mean: si / n,
            point_count: members.len(),
            timestamp_ns,
        }
    }
}

/// Drop foreground points with fewer than `min_neighbors` points (self
/// included) within `eps`. Cheap denoise pass ahead of the main clustering.
pub fn denoise(points: Vec<WorldPoint>, eps: f64, min_neighbors: usize) -> Vec<WorldPoint> {
    if min_neighbors <= 1 || points.is_empty() {
        return points;
    }
    let eps2 = eps * eps;
    let index = build_grid_index(&points, eps);
    (0..points.len())
        .filter(|&i| neighbors_within(&points, &index, eps, eps2, i).len() >= min_neighbors)
        .map(|i| points[i])
        .collect()
}

fn grid_key(x: f64, y: f64, eps: f64) -> (i64, i64) {
    ((x / eps).floor() as i64, (y / eps).floor() as i64)
}

fn build_grid_index(points: &[WorldPoint], eps: f64) -> BTreeMap<(i64, i64), Vec<usize>> {
    let mut index: BTreeMap<(i64, i64), Vec<usize>> = BTreeMap::new();
    for (i, p) in points.iter().enumerate() {
        index.entry(grid_key(p.x, p.y, eps)).or_default().push(i);
    }
    index
}

/// All point indices within `eps` of point `i` on the (x, y) plane,
/// including `i` itself.
fn neighbors_within(
    points: &[WorldPoint],
    index: &BTreeMap<(i64, i64), Vec<usize>>,
    eps: f64,
    eps2: f64,
    i: usize,
) -> Vec<usize> {
    let p = &points[i];
    let (kx, ky) = grid_key(p.x, p.y, eps);
    let mut out = Vec::new();
    for (dx, dy) in (-1..=1).cartesian_product(-1..=1) {
        let Some(bucket) = index.get(&(kx + dx, ky + dy)) else {
            continue;
        };
        for &j in bucket {
            let q = &points[j];
            let d2 = (p.x - q.x).powi(2) + (p.y - q.y).powi(2);
            if d2 <= eps2 {
                out.push(j);
            }
        }
    }
    out
}

/// Closed-form PCA box fit on (x, y).
///
/// The principal eigenvector of the 2x2 covariance gives the heading; points
/// projected on the principal and perpendicular axes give length and width.
fn fit_obb(
    points: &[WorldPoint],
    members: &[usize],
    cx: f64,
    cy: f64,
    min_z: f64,
    max_z: f64,
) -> Option<OrientedBox> {
    let n = members.len() as f64;
    let (mut cov_xx, mut cov_xy, mut cov_yy) = (0.0, 0.0, 0.0);
    for &i in members {
        let dx = points[i].x - cx;
        let dy = points[i].y - cy;
        cov_xx += dx * dx;
        cov_xy += dx * dy;
        cov_yy += dy * dy;
    }
    cov_xx /= n;
    cov_xy /= n;
    cov_yy /= n;

    // Analytic eigen-decomposition of [[a, b], [b, c]].
    let half_trace = (cov_xx + cov_yy) / 2.0;
    let disc = (((cov_xx - cov_yy) / 2.0).powi(2) + cov_xy * cov_xy).sqrt();
    let lambda_major = half_trace + disc;

    let (ev_x, ev_y) = if cov_xy.abs() > 1e-12 {
        (lambda_major - cov_yy, cov_xy)
    } else if cov_xx >= cov_yy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };
    let norm = (ev_x * ev_x + ev_y * ev_y).sqrt();
    if !norm.is_finite() || norm < 1e-12 {
        return None;
    }
    let (ux, uy) = (ev_x / norm, ev_y / norm);
    let heading_rad = uy.atan2(ux);

    let (mut min_u, mut max_u) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_v, mut max_v) = (f64::INFINITY, f64::NEG_INFINITY);
    for &i in members {
        let dx = points[i].x - cx;
        let dy = points[i].y - cy;
        let u = dx * ux + dy * uy;
        let v = -dx * uy + dy * ux;
        min_u = min_u.min(u);
        max_u = max_u.max(u);
        min_v = min_v.min(v);
        max_v = max_v.max(v);
    }

    Some(OrientedBox {
        cx,
        cy,
        cz: min_z,
        length: max_u - min_u,
        width: max_v - min_v,
        height: max_z - min_z,
        heading_rad,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    fn params(eps_m: f64, min_pts: usize) -> ClusterParams {
        ClusterParams {
            eps_m,
            min_pts,
            min_cluster_points: 3,
            obb_min_points: 10,
        }
    }

    fn square_points(cx: f64, cy: f64, side: f64, per_axis: usize) -> Vec<WorldPoint> {
        let mut out = Vec::new();
        for i in 0..per_axis {
            for j in 0..per_axis {
                out.push(WorldPoint {
                    x: cx - side / 2.0 + side * i as f64 / (per_axis - 1) as f64,
                    y: cy - side / 2.0 + side * j as f64 / (per_axis - 1) as f64,
                    z: 0.5,
                    intensity: 80,
                });
            }
        }
        out
    }

    #[test]
    fn one_cluster_and_noise() {
        // 10 points in a 0.4 x 0.4 square plus 3 isolated outliers.
        let mut points = square_points(5.0, 5.0, 0.4, 3);
        points.push(WorldPoint {
            x: 5.1,
            y: 5.05,
            z: 0.5,
            intensity: 80,
        });
        assert_eq!(points.len(), 10);
        for k in 0..3 {
            points.push(WorldPoint {
                x: 8.0 + 3.0 * k as f64,
                y: 5.0,
                z: 0.5,
                intensity: 80,
            });
        }
        let clusters = Clusterer::new(params(0.3, 3)).cluster(&points, 0);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].point_count, 10);
        assert!((clusters[0].x - 5.0).abs() < 0.1);
        assert!((clusters[0].y - 5.0).abs() < 0.1);
    }

    #[test]
    fn small_clusters_are_discarded() {
        // Two points alone cannot reach min_pts = 3.
        let points = vec![
            WorldPoint {
                x: 0.0,
                y: 0.0,
                z: 0.0,
                intensity: 10,
            },
            WorldPoint {
                x: 0.1,
                y: 0.0,
                z: 0.0,
                intensity: 10,
            },
        ];
        let clusters = Clusterer::new(params(0.3, 3)).cluster(&points, 0);
        assert!(clusters.is_empty());
    }

    #[test]
    fn obb_heading_follows_elongation() {
        // An elongated cloud rotated 30 degrees.
        let angle: f64 = 30f64.to_radians();
        let mut points = Vec::new();
        for i in 0..40 {
            let u = i as f64 * 0.1 - 2.0;
            let v = if i % 2 == 0 { 0.05 } else { -0.05 };
            points.push(WorldPoint {
                x: u * angle.cos() - v * angle.sin(),
                y: u * angle.sin() + v * angle.cos(),
                z: 0.2 + 0.01 * (i % 3) as f64,
                intensity: 50,
            });
        }
        let clusters = Clusterer::new(params(0.3, 3)).cluster(&points, 0);
        assert_eq!(clusters.len(), 1);
        let obb = clusters[0].obb.expect("enough points for a box fit");
        // Heading is defined up to 180 degrees.
        let mut heading = obb.heading_rad.rem_euclid(std::f64::consts::PI);
        if heading > std::f64::consts::PI / 2.0 {
            heading -= std::f64::consts::PI;
        }
        assert_relative_eq!(heading, angle, epsilon = 0.05);
        assert!(obb.length > 3.5 && obb.length < 4.5);
        assert!(obb.width < 0.5);
    }

    #[test]
    fn denoise_drops_isolated_points() {
        let mut points = square_points(0.0, 0.0, 0.2, 3);
        points.push(WorldPoint {
            x: 50.0,
            y: 50.0,
            z: 0.0,
            intensity: 5,
        });
        let kept = denoise(points, 0.3, 3);
        assert_eq!(kept.len(), 9);
    }

    #[test]
    fn deterministic_output_order() {
        let mut points = square_points(0.0, 0.0, 0.3, 3);
        points.extend(square_points(10.0, 0.0, 0.3, 3));
        let clusterer = Clusterer::new(params(0.3, 3));
        let a = clusterer.cluster(&points, 0);
        let b = clusterer.cluster(&points, 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        // First-seeded cluster first.
        assert!(a[0].x < a[1].x);
    }
}
