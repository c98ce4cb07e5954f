//! Tiered small-polygon elimination.
//!
//! For each area threshold, in ascending order, every polygon at or below
//! the threshold is merged into the neighbor it shares the longest boundary
//! with. One iteration:
//!
//!   1. Collect `SMALL`, the live polygons with area ≤ threshold.
//!   2. Rebuild the R-tree over all live polygons.
//!   3. Find each small polygon's target (parallel under `threading`).
//!   4. Group pairs by target and union each group; a multi-part union
//!      keeps its largest part.
//!   5. Retire merged sources.
//!
//! A tier ends when `SMALL` is empty, when an iteration yields no pair, or
//! after `max_iterations`. Polygons live in an arena with stable ids for the
//! whole tier; retired slots are only compacted away when the tier ends.
pub mod neighbors;

use std::collections::BTreeMap;

use geo::Polygon;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::stats::RunStats;
use crate::vector::geometry::{is_valid, largest_part, repair, union_all};
use crate::vector::{PolygonLayer, PolygonRecord};
use neighbors::{find_merge_pairs, NeighborIndex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EliminateParams {
    /// Area thresholds, applied in ascending order.
    pub thresholds: Vec<f64>,
    pub max_iterations: usize,
}

impl Default for EliminateParams {
    fn default() -> Self {
        Self { thresholds: vec![100.0, 1_000.0, 10_000.0], max_iterations: 10 }
    }
}

/// Outcome of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierReport {
    pub threshold: f64,
    pub iterations: usize,
    pub merges: usize,
    /// Polygons still at or below the threshold when the tier ended.
    pub remaining_small: usize,
    pub converged: bool,
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub small: usize,
    pub pairs: usize,
    /// Sources retired into a target.
    pub merged: usize,
}

// ── Arena ────────────────────────────────────────────────────────────────────

/// Polygon records addressed by stable slot id. Merging retires source
/// slots instead of removing them.
pub struct PolygonArena {
    records: Vec<PolygonRecord>,
    retired: Vec<bool>,
}

struct Merged {
    polygon: Polygon<f64>,
    discarded_area: f64,
    repaired: bool,
}

fn merge_group(target: &PolygonRecord, sources: &[&PolygonRecord]) -> Option<Merged> {
    let mut parts = Vec::with_capacity(sources.len() + 1);
    parts.push(target.geometry.clone());
    parts.extend(sources.iter().map(|s| s.geometry.clone()));

    let (polygon, discarded_area) = largest_part(union_all(parts)?)?;
    if is_valid(&polygon) {
        return Some(Merged { polygon, discarded_area, repaired: false });
    }
    repair(&polygon).map(|polygon| Merged { polygon, discarded_area, repaired: true })
}

impl PolygonArena {
    pub fn new(records: Vec<PolygonRecord>) -> Self {
        let retired = vec![false; records.len()];
        Self { records, retired }
    }

    pub fn live_count(&self) -> usize {
        self.retired.iter().filter(|&&r| !r).count()
    }

    pub fn total_area(&self) -> f64 {
        self.live().map(|id| self.records[id].area).sum()
    }

    fn live(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.records.len()).filter(|&id| !self.retired[id])
    }

    pub fn count_small(&self, threshold: f64) -> usize {
        self.live().filter(|&id| self.records[id].area <= threshold).count()
    }

    /// Run one merge iteration at `threshold`.
    pub fn step(&mut self, threshold: f64, stats: &mut RunStats) -> StepOutcome {
        let live: Vec<usize> = self.live().collect();
        let mut is_small = vec![false; self.records.len()];
        let mut small = Vec::new();
        for &id in &live {
            if self.records[id].area <= threshold {
                is_small[id] = true;
                small.push(id);
            }
        }
        if small.is_empty() {
            return StepOutcome::default();
        }

        let index = NeighborIndex::build(&self.records, &live);
        let pairs = find_merge_pairs(&self.records, &small, &is_small, &index);

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &(source, target) in &pairs {
            groups.entry(target).or_default().push(source);
        }

        let mut merged = 0;
        for (target, sources) in groups {
            let source_refs: Vec<&PolygonRecord> = sources.iter().map(|&s| &self.records[s]).collect();
            let Some(result) = merge_group(&self.records[target], &source_refs) else {
                stats.merges_skipped += 1;
                warn!("union of polygon {target} with {} neighbors failed; merge skipped", sources.len());
                continue;
            };
            if result.repaired {
                stats.geometry_repaired += 1;
            }
            if result.discarded_area > 0.0 {
                stats.multipart_discards += 1;
                stats.discarded_area += result.discarded_area;
                warn!(
                    "merge into polygon {target} was multi-part; discarded {:.3} area units",
                    result.discarded_area
                );
            }
            self.records[target].set_geometry(result.polygon);
            for s in &sources {
                self.retired[*s] = true;
            }
            merged += sources.len();
        }
        stats.polygons_merged += merged;

        StepOutcome { small: small.len(), pairs: pairs.len(), merged }
    }

    /// Run iterations until `SMALL` is empty, nothing merges, or the cap.
    pub fn run_tier(&mut self, threshold: f64, max_iterations: usize, stats: &mut RunStats) -> TierReport {
        let mut iterations = 0;
        let mut merges = 0;
        while iterations < max_iterations {
            let outcome = self.step(threshold, stats);
            if outcome.small == 0 {
                break;
            }
            iterations += 1;
            merges += outcome.merged;
            debug!(
                "tier {threshold}: iteration {iterations}: {} small, {} pairs, {} merged",
                outcome.small, outcome.pairs, outcome.merged
            );
            if outcome.merged == 0 {
                break;
            }
        }
        let remaining_small = self.count_small(threshold);
        TierReport {
            threshold,
            iterations,
            merges,
            remaining_small,
            converged: remaining_small == 0,
        }
    }

    /// Live records in slot order.
    pub fn into_records(self) -> Vec<PolygonRecord> {
        self.records
            .into_iter()
            .zip(self.retired)
            .filter_map(|(r, retired)| (!retired).then_some(r))
            .collect()
    }
}

// ── Tiered driver ────────────────────────────────────────────────────────────

/// Apply every tier of `params` to `layer` in ascending threshold order.
pub fn tiered_eliminate(layer: &mut PolygonLayer, params: &EliminateParams, stats: &mut RunStats) -> Vec<TierReport> {
    let mut thresholds = params.thresholds.clone();
    thresholds.sort_by(f64::total_cmp);

    let mut arena = PolygonArena::new(std::mem::take(&mut layer.records));
    let mut reports = Vec::with_capacity(thresholds.len());
    for &threshold in &thresholds {
        let before = arena.live_count();
        let report = arena.run_tier(threshold, params.max_iterations, stats);
        info!(
            "tier {threshold}: {} → {} polygons in {} iterations",
            before,
            arena.live_count(),
            report.iterations
        );
        if !report.converged {
            stats.nonconverged_tiers += 1;
            warn!(
                "tier {threshold} left {} polygons at or below the threshold",
                report.remaining_small
            );
        }
        reports.push(report);
    }
    if let Some(&last) = thresholds.last() {
        stats.unresolved_small += arena.count_small(last);
    }
    layer.records = arena.into_records();
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::polygon;

    fn rect(code: u32, x0: f64, y0: f64, x1: f64, y1: f64) -> PolygonRecord {
        PolygonRecord::new(code, polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1)], None)
    }

    /// A 100×100 field with a strip of 10×10 slivers along its right edge
    /// and a second large field beyond them.
    fn fields() -> PolygonLayer {
        let mut layer = PolygonLayer::new(vec![2020], None);
        layer.records.push(rect(1, 0.0, 0.0, 100.0, 100.0));
        for i in 0..10 {
            let y = i as f64 * 10.0;
            layer.records.push(rect(10 + i, 100.0, y, 110.0, y + 10.0));
        }
        layer.records.push(rect(2, 110.0, 0.0, 300.0, 100.0));
        layer
    }

    #[test]
    fn threshold_below_smallest_area_is_identity() {
        let mut layer = fields();
        let before = layer.clone();
        let mut stats = RunStats::default();
        let params = EliminateParams { thresholds: vec![0.0, 50.0], max_iterations: 10 };
        let reports = tiered_eliminate(&mut layer, &params, &mut stats);
        assert_eq!(layer, before);
        assert!(reports.iter().all(|r| r.converged && r.merges == 0));
    }

    #[test]
    fn one_step_conserves_area_and_counts_merges() {
        let layer = fields();
        let mut arena = PolygonArena::new(layer.records);
        let area_before = arena.total_area();
        let count_before = arena.live_count();
        let mut stats = RunStats::default();

        let outcome = arena.step(100.0, &mut stats);
        assert_eq!(outcome.small, 10);
        assert_eq!(outcome.merged, 10);
        assert_eq!(arena.live_count(), count_before - outcome.merged);
        assert_relative_eq!(arena.total_area(), area_before, max_relative = 1e-6);
        assert_eq!(stats.polygons_merged, 10);
    }

    #[test]
    fn tier_leaves_nothing_at_or_below_threshold() {
        let mut layer = fields();
        let total = layer.total_area();
        let mut stats = RunStats::default();
        let params = EliminateParams { thresholds: vec![100.0], max_iterations: 10 };
        let reports = tiered_eliminate(&mut layer, &params, &mut stats);
        assert!(reports[0].converged);
        assert!(layer.records.iter().all(|r| r.area > 100.0));
        assert_eq!(layer.len(), 2);
        assert_relative_eq!(layer.total_area(), total, max_relative = 1e-6);
        assert_eq!(stats.nonconverged_tiers, 0);
    }

    #[test]
    fn isolated_small_polygon_is_reported() {
        let mut layer = fields();
        layer.records.push(rect(99, 1000.0, 1000.0, 1005.0, 1005.0));
        let mut stats = RunStats::default();
        let params = EliminateParams { thresholds: vec![100.0], max_iterations: 10 };
        let reports = tiered_eliminate(&mut layer, &params, &mut stats);
        assert!(!reports[0].converged);
        assert_eq!(reports[0].remaining_small, 1);
        assert_eq!(stats.nonconverged_tiers, 1);
        assert_eq!(stats.unresolved_small, 1);
        assert!(layer.records.iter().any(|r| r.code == 99));
    }

    #[test]
    fn repeated_runs_make_identical_decisions() {
        let params = EliminateParams::default();
        let run = || {
            let mut layer = fields();
            let mut stats = RunStats::default();
            let reports = tiered_eliminate(&mut layer, &params, &mut stats);
            (layer, reports)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn count_never_grows_across_tiers() {
        let mut layer = fields();
        let start = layer.len();
        let mut stats = RunStats::default();
        let reports = tiered_eliminate(&mut layer, &EliminateParams::default(), &mut stats);
        let merged: usize = reports.iter().map(|r| r.merges).sum();
        assert_eq!(layer.len(), start - merged);
    }
}
