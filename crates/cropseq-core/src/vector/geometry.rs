//! Polygon validity, repair, union and shared-boundary helpers.
//!
//! Validity here is the subset the pipeline relies on: closed rings of at
//! least four finite coordinates, positive area, and no two ring segments
//! crossing or overlapping. Rings may touch at single points.

use std::panic::{self, AssertUnwindSafe};

use geo::{Area, BooleanOps, Coord, LineString, MultiPolygon, Polygon};

/// Distance below which two coordinates or segments are treated as coincident.
pub const EPS: f64 = 1e-6;

type Segment = (Coord<f64>, Coord<f64>);

fn segments(poly: &Polygon<f64>) -> Vec<Segment> {
    std::iter::once(poly.exterior())
        .chain(poly.interiors())
        .flat_map(|ring| ring.lines().map(|l| (l.start, l.end)))
        .collect()
}

fn finite(s: &Segment) -> bool {
    s.0.x.is_finite() && s.0.y.is_finite() && s.1.x.is_finite() && s.1.y.is_finite()
}

fn ring_ok(ring: &LineString<f64>) -> bool {
    ring.0.len() >= 4 && ring.is_closed() && ring.coords().all(|c| c.x.is_finite() && c.y.is_finite())
}

fn cross(o: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn seg_len(s: &Segment) -> f64 {
    (s.1.x - s.0.x).hypot(s.1.y - s.0.y)
}

/// Length over which two segments lie on top of each other; 0 when they
/// are not collinear.
fn collinear_overlap(a: &Segment, b: &Segment) -> f64 {
    let len = seg_len(a);
    if len <= EPS {
        return 0.0;
    }
    if cross(a.0, a.1, b.0).abs() / len > EPS || cross(a.0, a.1, b.1).abs() / len > EPS {
        return 0.0;
    }
    let (ux, uy) = ((a.1.x - a.0.x) / len, (a.1.y - a.0.y) / len);
    let t0 = (b.0.x - a.0.x) * ux + (b.0.y - a.0.y) * uy;
    let t1 = (b.1.x - a.0.x) * ux + (b.1.y - a.0.y) * uy;
    let (lo, hi) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
    (hi.min(len) - lo.max(0.0)).max(0.0)
}

/// True when the segments cross at a point interior to both.
fn crosses(a: &Segment, b: &Segment) -> bool {
    let d1 = cross(a.0, a.1, b.0);
    let d2 = cross(a.0, a.1, b.1);
    let d3 = cross(b.0, b.1, a.0);
    let d4 = cross(b.0, b.1, a.1);
    d1 * d2 < 0.0 && d3 * d4 < 0.0
}

fn envelopes_meet(a: &Segment, b: &Segment) -> bool {
    a.0.x.min(a.1.x) <= b.0.x.max(b.1.x) + EPS
        && b.0.x.min(b.1.x) <= a.0.x.max(a.1.x) + EPS
        && a.0.y.min(a.1.y) <= b.0.y.max(b.1.y) + EPS
        && b.0.y.min(b.1.y) <= a.0.y.max(a.1.y) + EPS
}

/// Sweep over segments sorted by min x, calling `f` for each pair whose
/// envelopes meet. Stops early when `f` returns true.
fn any_pair(segs: &[Segment], mut f: impl FnMut(&Segment, &Segment) -> bool) -> bool {
    let mut order: Vec<usize> = (0..segs.len()).collect();
    order.sort_by(|&i, &j| segs[i].0.x.min(segs[i].1.x).total_cmp(&segs[j].0.x.min(segs[j].1.x)));
    for (k, &i) in order.iter().enumerate() {
        let max_x = segs[i].0.x.max(segs[i].1.x) + EPS;
        for &j in &order[k + 1..] {
            if segs[j].0.x.min(segs[j].1.x) > max_x {
                break;
            }
            if envelopes_meet(&segs[i], &segs[j]) && f(&segs[i], &segs[j]) {
                return true;
            }
        }
    }
    false
}

pub fn is_valid(poly: &Polygon<f64>) -> bool {
    if !ring_ok(poly.exterior()) || !poly.interiors().iter().all(ring_ok) {
        return false;
    }
    let area = poly.unsigned_area();
    if !area.is_finite() || area <= 0.0 {
        return false;
    }
    let segs = segments(poly);
    !any_pair(&segs, |a, b| crosses(a, b) || collinear_overlap(a, b) > EPS)
}

/// Largest-area part of `mp`, with the area of the parts left out.
pub fn largest_part(mp: MultiPolygon<f64>) -> Option<(Polygon<f64>, f64)> {
    let total: f64 = mp.0.iter().map(|p| p.unsigned_area()).sum();
    let best = mp
        .0
        .into_iter()
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))?;
    let kept = best.unsigned_area();
    Some((best, (total - kept).max(0.0)))
}

/// Re-node `poly` through a union with nothing and keep the largest part.
/// Returns `None` when the result is empty or still invalid.
pub fn repair(poly: &Polygon<f64>) -> Option<Polygon<f64>> {
    if !segments(poly).iter().all(finite) {
        return None;
    }
    let noded = try_union(&MultiPolygon::new(vec![poly.clone()]), &MultiPolygon::new(vec![]))?;
    let (part, _) = largest_part(noded)?;
    is_valid(&part).then_some(part)
}

/// Overlay union; a panic inside the overlay comes back as `None`.
pub fn try_union(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Option<MultiPolygon<f64>> {
    panic::catch_unwind(AssertUnwindSafe(|| a.union(b))).ok()
}

/// Union of every polygon, reduced pairwise so operand sizes stay balanced.
/// `None` if any overlay step failed.
pub fn union_all(polys: Vec<Polygon<f64>>) -> Option<MultiPolygon<f64>> {
    let mut level: Vec<MultiPolygon<f64>> = polys.into_iter().map(|p| MultiPolygon::new(vec![p])).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.into_iter();
        while let Some(a) = it.next() {
            match it.next() {
                Some(b) => next.push(try_union(&a, &b)?),
                None => next.push(a),
            }
        }
        level = next;
    }
    Some(level.pop().unwrap_or_else(|| MultiPolygon::new(vec![])))
}

/// Total length of boundary shared by `a` and `b`: the sum of collinear
/// overlaps between their ring segments. `None` when either has a
/// non-finite coordinate.
pub fn shared_boundary_length(a: &Polygon<f64>, b: &Polygon<f64>) -> Option<f64> {
    let sa = segments(a);
    let sb = segments(b);
    if !sa.iter().all(finite) || !sb.iter().all(finite) {
        return None;
    }
    let mut total = 0.0;
    for s in &sa {
        for t in &sb {
            if envelopes_meet(s, t) {
                total += collinear_overlap(s, t);
            }
        }
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use geo::polygon;

    fn rect(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon<f64> {
        polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1)]
    }

    #[test]
    fn rectangles_are_valid_bowtie_is_not() {
        assert!(is_valid(&rect(0.0, 0.0, 2.0, 1.0)));
        let bowtie = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 2.0), (x: 2.0, y: 0.0), (x: 0.0, y: 2.0)];
        assert!(!is_valid(&bowtie));
        let flat = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)];
        assert!(!is_valid(&flat));
    }

    #[test]
    fn hole_touching_shell_at_a_point_is_valid() {
        let shell = LineString::from(vec![(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0), (0.0, 0.0)]);
        let hole = LineString::from(vec![(0.0, 0.0), (1.0, 2.0), (2.0, 1.0), (0.0, 0.0)]);
        assert!(is_valid(&Polygon::new(shell, vec![hole])));
    }

    #[test]
    fn shared_boundary_sums_collinear_overlaps() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        let b = rect(10.0, 4.0, 20.0, 30.0);
        assert_relative_eq!(shared_boundary_length(&a, &b).unwrap(), 6.0);
        let c = rect(11.0, 0.0, 12.0, 1.0);
        assert_relative_eq!(shared_boundary_length(&a, &c).unwrap(), 0.0);
        let corner = rect(10.0, 10.0, 12.0, 12.0);
        assert_relative_eq!(shared_boundary_length(&a, &corner).unwrap(), 0.0);
    }

    #[test]
    fn shared_boundary_with_nan_is_none() {
        let a = rect(0.0, 0.0, 1.0, 1.0);
        let b = rect(1.0, 0.0, f64::NAN, 1.0);
        assert!(shared_boundary_length(&a, &b).is_none());
    }

    #[test]
    fn union_all_dissolves_adjacent() {
        let u = union_all(vec![rect(0.0, 0.0, 1.0, 1.0), rect(1.0, 0.0, 2.0, 1.0), rect(2.0, 0.0, 3.0, 1.0)]).unwrap();
        assert_eq!(u.0.len(), 1);
        assert_relative_eq!(u.unsigned_area(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn largest_part_reports_discarded_area() {
        let mp = MultiPolygon::new(vec![rect(0.0, 0.0, 1.0, 1.0), rect(5.0, 5.0, 8.0, 8.0)]);
        let (part, lost) = largest_part(mp).unwrap();
        assert_relative_eq!(part.unsigned_area(), 9.0);
        assert_relative_eq!(lost, 1.0);
    }

    #[test]
    fn repair_keeps_valid_input() {
        let fixed = repair(&rect(0.0, 0.0, 3.0, 2.0)).unwrap();
        assert_relative_eq!(fixed.unsigned_area(), 6.0, epsilon = 1e-9);
    }
}
