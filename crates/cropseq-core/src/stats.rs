//! Aggregate counters for everything a run recovers from instead of failing.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub tiles_total: usize,
    pub tiles_processed: usize,
    pub tiles_empty: usize,
    pub tiles_failed: usize,
    pub polygons_vectorized: usize,
    pub polygons_filtered_out: usize,
    /// Source polygons absorbed into a neighbor.
    pub polygons_merged: usize,
    /// Merge groups left alone because their union failed.
    pub merges_skipped: usize,
    pub geometry_repaired: usize,
    pub geometry_dropped: usize,
    /// Merge results that were multi-part and lost their smaller parts.
    pub multipart_discards: usize,
    /// Area lost to multi-part discards, in CRS units squared.
    pub discarded_area: f64,
    pub nonconverged_tiers: usize,
    /// Small polygons left after all tiers.
    pub unresolved_small: usize,
    pub duplicates_dropped: usize,
    pub simplify_dropped: usize,
    pub polygons_out: usize,
}

impl RunStats {
    /// Add `other` into `self`, field by field.
    pub fn merge(&mut self, other: &RunStats) {
        self.tiles_total += other.tiles_total;
        self.tiles_processed += other.tiles_processed;
        self.tiles_empty += other.tiles_empty;
        self.tiles_failed += other.tiles_failed;
        self.polygons_vectorized += other.polygons_vectorized;
        self.polygons_filtered_out += other.polygons_filtered_out;
        self.polygons_merged += other.polygons_merged;
        self.merges_skipped += other.merges_skipped;
        self.geometry_repaired += other.geometry_repaired;
        self.geometry_dropped += other.geometry_dropped;
        self.multipart_discards += other.multipart_discards;
        self.discarded_area += other.discarded_area;
        self.nonconverged_tiers += other.nonconverged_tiers;
        self.unresolved_small += other.unresolved_small;
        self.duplicates_dropped += other.duplicates_dropped;
        self.simplify_dropped += other.simplify_dropped;
        self.polygons_out += other.polygons_out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_additive() {
        let mut a = RunStats { tiles_processed: 2, discarded_area: 1.5, ..Default::default() };
        let b = RunStats { tiles_processed: 1, tiles_failed: 1, discarded_area: 0.5, ..Default::default() };
        a.merge(&b);
        assert_eq!(a.tiles_processed, 3);
        assert_eq!(a.tiles_failed, 1);
        assert_eq!(a.discarded_area, 2.0);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["tiles_failed"], 1);
    }
}
