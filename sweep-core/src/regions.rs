//! Variance-based grid regions, identified once when settling completes.
//!
//! During settling a Welford accumulator observes each cell's spread. At
//! settle time the cells are split into stable / variable / volatile
//! categories by variance percentile, grouped into 4-connected regions
//! (azimuth wraps, rings do not), merged down to the configured maximum and
//! assigned per-category tuning. Thereafter the map is read-only.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::info;

use sweep_types::cell_index;

pub const NO_REGION: u16 = u16::MAX;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceCategory {
    Stable,
    Variable,
    Volatile,
}

/// Per-region overrides applied on top of the base background parameters.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct RegionTuning {
    /// Multiplier on `noise_relative_fraction`.
    pub noise_scale: f64,
    /// Added to `neighbor_confirmation_count`.
    pub extra_neighbor_confirmation: u16,
    /// Multiplier on the effective update fraction.
    pub alpha_scale: f64,
}

impl RegionTuning {
    pub fn for_category(category: VarianceCategory) -> Self {
        match category {
            VarianceCategory::Stable => RegionTuning {
                noise_scale: 0.5,
                extra_neighbor_confirmation: 0,
                alpha_scale: 1.5,
            },
            VarianceCategory::Variable => RegionTuning {
                noise_scale: 1.0,
                extra_neighbor_confirmation: 0,
                alpha_scale: 1.0,
            },
            VarianceCategory::Volatile => RegionTuning {
                noise_scale: 2.0,
                extra_neighbor_confirmation: 2,
                alpha_scale: 0.5,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: u16,
    pub category: VarianceCategory,
    pub cell_count: usize,
    pub tuning: RegionTuning,
}

/// Read-only assignment of cells to regions.
#[derive(Debug, Clone)]
pub struct RegionMap {
    region_of: Vec<u16>,
    regions: Vec<Region>,
}

impl RegionMap {
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn tuning_for_cell(&self, idx: usize) -> Option<&RegionTuning> {
        let region = *self.region_of.get(idx)?;
        if region == NO_REGION {
            None
        } else {
            Some(&self.regions[region as usize].tuning)
        }
    }
}

/// Welford running-variance accumulator over per-cell spread observations.
pub struct RegionAccumulator {
    rings: u16,
    az_bins: u16,
    count: Vec<u32>,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RegionAccumulator {
    pub fn new(rings: u16, az_bins: u16) -> Self {
        let n = rings as usize * az_bins as usize;
        Self {
            rings,
            az_bins,
            count: vec![0; n],
            mean: vec![0.0; n],
            m2: vec![0.0; n],
        }
    }

    pub fn observe(&mut self, idx: usize, spread_m: f64) {
        self.count[idx] += 1;
        let n = self.count[idx] as f64;
        let delta = spread_m - self.mean[idx];
        self.mean[idx] += delta / n;
        self.m2[idx] += delta * (spread_m - self.mean[idx]);
    }

    fn variance(&self, idx: usize) -> Option<f64> {
        if self.count[idx] < 2 {
            None
        } else {
            Some(self.m2[idx] / (self.count[idx] - 1) as f64)
        }
    }

    /// Consume the accumulated statistics and build the region map.
    pub fn identify(self, max_regions: usize) -> RegionMap {
        let n = self.count.len();

        let mut observed: Vec<f64> = (0..n).filter_map(|i| self.variance(i)).collect();
        observed.sort_by(f64::total_cmp);

        if observed.is_empty() {
            return RegionMap {
                region_of: vec![NO_REGION; n],
                regions: Vec::new(),
            };
        }

        let p33 = percentile_sorted(&observed, 33.0);
        let p66 = percentile_sorted(&observed, 66.0);

        let category_of: Vec<Option<VarianceCategory>> = (0..n)
            .map(|i| {
                self.variance(i).map(|v| {
                    if v <= p33 {
                        VarianceCategory::Stable
                    } else if v <= p66 {
                        VarianceCategory::Variable
                    } else {
                        VarianceCategory::Volatile
                    }
                })
            })
            .collect();

        // BFS over 4-connected cells of the same category.
        let mut region_of = vec![NO_REGION; n];
        let mut regions: Vec<Region> = Vec::new();
        for seed in 0..n {
            let Some(category) = category_of[seed] else {
                continue;
            };
            if region_of[seed] != NO_REGION {
                continue;
            }
            let id = regions.len() as u16;
            let mut cell_count = 0usize;
            let mut queue = VecDeque::new();
            region_of[seed] = id;
            queue.push_back(seed);
            while let Some(idx) = queue.pop_front() {
                cell_count += 1;
                for neighbor in self.neighbors4(idx) {
                    if region_of[neighbor] == NO_REGION
                        && category_of[neighbor] == Some(category)
                    {
                        region_of[neighbor] = id;
                        queue.push_back(neighbor);
                    }
                }
            }
            regions.push(Region {
                id,
                category,
                cell_count,
                tuning: RegionTuning::for_category(category),
            });
        }

        // Merge smallest regions into an adjacent region until within limit.
        while regions.len() > max_regions {
            let smallest = regions
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.cell_count)
                .map(|(i, _)| i)
                .unwrap();
            let smallest_id = regions[smallest].id;

            let target_id = self
                .adjacent_region(&region_of, smallest_id)
                .unwrap_or_else(|| {
                    // Isolated region: fold into the largest other region.
                    regions
                        .iter()
                        .filter(|r| r.id != smallest_id)
                        .max_by_key(|r| r.cell_count)
                        .map(|r| r.id)
                        .expect("more than one region exists when merging")
                });

            let moved = regions[smallest].cell_count;
            for r in region_of.iter_mut() {
                if *r == smallest_id {
                    *r = target_id;
                }
            }
            let target_pos = regions.iter().position(|r| r.id == target_id).unwrap();
            regions[target_pos].cell_count += moved;
            regions.remove(smallest);
        }

        // Renumber sequentially.
        let mut renumber = vec![NO_REGION; u16::MAX as usize + 1];
        for (new_id, region) in regions.iter_mut().enumerate() {
            renumber[region.id as usize] = new_id as u16;
            region.id = new_id as u16;
        }
        for r in region_of.iter_mut() {
            if *r != NO_REGION {
                *r = renumber[*r as usize];
            }
        }

        info!(
            "identified {} background regions ({} cells categorised)",
            regions.len(),
            observed.len()
        );

        RegionMap { region_of, regions }
    }

    fn neighbors4(&self, idx: usize) -> Vec<usize> {
        let az_bins = self.az_bins as usize;
        let ring = (idx / az_bins) as u16;
        let az = (idx % az_bins) as u16;
        let mut out = Vec::with_capacity(4);
        if ring > 0 {
            out.push(cell_index(ring - 1, az, self.az_bins));
        }
        if ring + 1 < self.rings {
            out.push(cell_index(ring + 1, az, self.az_bins));
        }
        // Azimuth is circular.
        let az_prev = if az == 0 { self.az_bins - 1 } else { az - 1 };
        let az_next = if az + 1 == self.az_bins { 0 } else { az + 1 };
        if self.az_bins > 1 {
            out.push(cell_index(ring, az_prev, self.az_bins));
            out.push(cell_index(ring, az_next, self.az_bins));
        }
        out
    }

    /// Any region sharing a 4-neighbour boundary with `id`.
    fn adjacent_region(&self, region_of: &[u16], id: u16) -> Option<u16> {
        for (idx, &r) in region_of.iter().enumerate() {
            if r != id {
                continue;
            }
            for neighbor in self.neighbors4(idx) {
                let other = region_of[neighbor];
                if other != id && other != NO_REGION {
                    return Some(other);
                }
            }
        }
        None
    }
}

/// Percentile of an ascending-sorted slice by nearest-rank interpolation.
pub(crate) fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    assert!(!sorted.is_empty());
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn percentile_endpoints() {
        let v = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_sorted(&v, 0.0), 1.0);
        assert_eq!(percentile_sorted(&v, 100.0), 4.0);
    }

    #[test]
    fn three_bands_three_regions() {
        // One ring of 9 bins with strictly increasing variance along the
        // azimuth, so the percentile split yields three contiguous bands.
        let mut acc = RegionAccumulator::new(1, 9);
        for az in 0..9usize {
            let sigma = 0.1 * (az + 1) as f64;
            for k in 0..10 {
                // alternate around the mean so the variance is non-zero
                let sample = if k % 2 == 0 { sigma } else { -sigma };
                acc.observe(az, 0.5 + sample);
            }
        }
        let map = acc.identify(16);
        // Azimuth wrap joins bin 8 and bin 0 only if their categories match;
        // they do not here.
        assert_eq!(map.regions().len(), 3);
        let categories: Vec<_> = map.regions().iter().map(|r| r.category).collect();
        assert!(categories.contains(&VarianceCategory::Stable));
        assert!(categories.contains(&VarianceCategory::Volatile));
    }

    #[test]
    fn merge_down_to_limit() {
        // Checkerboard of two categories along one ring: many small regions.
        let mut acc = RegionAccumulator::new(1, 10);
        for az in 0..10usize {
            let sigma = if az % 2 == 0 { 0.01 } else { 1.0 };
            for k in 0..10 {
                let sample = if k % 2 == 0 { sigma } else { -sigma };
                acc.observe(az, 0.5 + sample);
            }
        }
        let map = acc.identify(3);
        assert!(map.regions().len() <= 3);
        // Ids renumbered sequentially.
        for (i, r) in map.regions().iter().enumerate() {
            assert_eq!(r.id as usize, i);
        }
    }

    #[test]
    fn empty_cells_have_no_tuning() {
        let mut acc = RegionAccumulator::new(1, 4);
        for k in 0..10 {
            let sample = if k % 2 == 0 { 0.1 } else { -0.1 };
            acc.observe(0, 0.5 + sample);
        }
        let map = acc.identify(4);
        assert!(map.tuning_for_cell(0).is_some());
        assert!(map.tuning_for_cell(3).is_none());
    }
}
