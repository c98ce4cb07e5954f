//! Spatial index over live polygons and the longest-shared-boundary search.
#[cfg(feature = "threading")]
use rayon::prelude::*;

use geo::{BoundingRect, Intersects, Polygon};
use rstar::{RTree, RTreeObject, AABB};

use crate::vector::geometry::{shared_boundary_length, EPS};
use crate::vector::PolygonRecord;

#[derive(Debug, Clone, Copy)]
struct PolygonEnvelope {
    aabb: AABB<[f64; 2]>,
    id: usize,
}

impl RTreeObject for PolygonEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Bounding box grown by [`EPS`] so that polygons sharing only an edge
/// still overlap.
fn envelope_of(poly: &Polygon<f64>) -> Option<AABB<[f64; 2]>> {
    let r = poly.bounding_rect()?;
    Some(AABB::from_corners(
        [r.min().x - EPS, r.min().y - EPS],
        [r.max().x + EPS, r.max().y + EPS],
    ))
}

/// Read-only R-tree snapshot of one elimination iteration.
pub struct NeighborIndex {
    tree: RTree<PolygonEnvelope>,
}

impl NeighborIndex {
    /// Index the records whose ids are listed in `live`.
    pub fn build(records: &[PolygonRecord], live: &[usize]) -> Self {
        let items = live
            .iter()
            .filter_map(|&id| envelope_of(&records[id].geometry).map(|aabb| PolygonEnvelope { aabb, id }))
            .collect();
        Self { tree: RTree::bulk_load(items) }
    }

    /// Ids whose boxes meet `poly`'s box, ascending.
    pub fn candidates(&self, poly: &Polygon<f64>) -> Vec<usize> {
        let Some(aabb) = envelope_of(poly) else {
            return Vec::new();
        };
        let mut ids: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&aabb)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Merge target for `id`: the non-small neighbor that touches it and shares
/// the strictly longest boundary. Equal lengths keep the lower id.
pub fn find_target(records: &[PolygonRecord], id: usize, is_small: &[bool], index: &NeighborIndex) -> Option<usize> {
    let poly = &records[id].geometry;
    let mut best: Option<(usize, f64)> = None;
    for cand in index.candidates(poly) {
        if cand == id || is_small[cand] {
            continue;
        }
        let other = &records[cand].geometry;
        if !poly.intersects(other) {
            continue;
        }
        let Some(len) = shared_boundary_length(poly, other) else {
            continue;
        };
        if len > best.map_or(0.0, |(_, l)| l) {
            best = Some((cand, len));
        }
    }
    best.map(|(cand, _)| cand)
}

/// (source, target) pairs for every small polygon that found a target,
/// in ascending source order.
pub fn find_merge_pairs(
    records: &[PolygonRecord],
    small: &[usize],
    is_small: &[bool],
    index: &NeighborIndex,
) -> Vec<(usize, usize)> {
    #[cfg(feature = "threading")]
    let iter = small.par_iter();
    #[cfg(not(feature = "threading"))]
    let iter = small.iter();

    iter.filter_map(|&id| find_target(records, id, is_small, index).map(|t| (id, t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> PolygonRecord {
        PolygonRecord::new(0, polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1)], None)
    }

    #[test]
    fn longest_shared_edge_wins() {
        // Small square at the origin; a tall neighbor shares its whole right
        // edge, a wide one only half its top edge.
        let records = vec![
            rect(0.0, 0.0, 10.0, 10.0),
            rect(10.0, -50.0, 20.0, 50.0),
            rect(5.0, 10.0, 60.0, 20.0),
            rect(100.0, 100.0, 110.0, 110.0),
        ];
        let live = [0, 1, 2, 3];
        let index = NeighborIndex::build(&records, &live);
        let is_small = [true, false, false, false];
        assert_eq!(index.candidates(&records[0].geometry), vec![0, 1, 2]);
        assert_eq!(find_target(&records, 0, &is_small, &index), Some(1));
        assert_eq!(find_merge_pairs(&records, &[0], &is_small, &index), vec![(0, 1)]);
    }

    #[test]
    fn small_neighbors_are_not_targets() {
        let records = vec![rect(0.0, 0.0, 10.0, 10.0), rect(10.0, 0.0, 20.0, 10.0)];
        let index = NeighborIndex::build(&records, &[0, 1]);
        assert_eq!(find_target(&records, 0, &[true, true], &index), None);
        assert_eq!(find_target(&records, 0, &[true, false], &index), Some(1));
    }

    #[test]
    fn corner_contact_is_not_a_shared_boundary() {
        let records = vec![rect(0.0, 0.0, 10.0, 10.0), rect(10.0, 10.0, 20.0, 20.0)];
        let index = NeighborIndex::build(&records, &[0, 1]);
        assert_eq!(find_target(&records, 0, &[true, false], &index), None);
    }

    #[test]
    fn ties_keep_the_lower_id() {
        let records = vec![
            rect(0.0, 0.0, 10.0, 10.0),
            rect(-10.0, 0.0, 0.0, 10.0),
            rect(10.0, 0.0, 20.0, 10.0),
        ];
        let index = NeighborIndex::build(&records, &[0, 1, 2]);
        assert_eq!(find_target(&records, 0, &[true, false, false], &index), Some(1));
    }
}
