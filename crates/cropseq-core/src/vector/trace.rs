//! Region labelling and boundary tracing on the pixel lattice.
//!
//! Regions are 4-connected runs of one code. Boundaries are walked on the
//! integer lattice of pixel corners, `(col, row)`, with the region kept on
//! the left of every directed edge. In those coordinates exteriors have
//! positive shoelace area and holes negative. Where a region meets itself
//! only at a corner the walk takes the right turn, which splits the
//! boundary into an exterior and a hole touching at one point.

use std::collections::{HashMap, VecDeque};

use geo::{Contains, Coord, LineString, Polygon};
use geo::orient::{Direction, Orient};

use crate::raster::CodedRaster;

const UNLABELLED: u32 = u32::MAX;

type Vertex = (i64, i64);

/// Connected regions of a coded raster.
pub struct Labels {
    /// Region id per pixel, `u32::MAX` for nodata.
    pub ids: Vec<u32>,
    /// Code of each region, indexed by region id.
    pub codes: Vec<u32>,
}

/// Label 4-connected regions of equal code, skipping nodata. Region ids
/// follow the row-major position of each region's first pixel.
pub fn label_regions(coded: &CodedRaster) -> Labels {
    let (w, h) = (coded.width, coded.height);
    let mut ids = vec![UNLABELLED; w * h];
    let mut codes = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..w * h {
        let code = coded.data[start];
        if ids[start] != UNLABELLED || coded.is_nodata(code) {
            continue;
        }
        let id = codes.len() as u32;
        codes.push(code);
        ids[start] = id;
        queue.push_back(start);
        while let Some(idx) = queue.pop_front() {
            let (r, c) = (idx / w, idx % w);
            let mut visit = |n: usize| {
                if ids[n] == UNLABELLED && coded.data[n] == code {
                    ids[n] = id;
                    queue.push_back(n);
                }
            };
            if c > 0 {
                visit(idx - 1);
            }
            if c + 1 < w {
                visit(idx + 1);
            }
            if r > 0 {
                visit(idx - w);
            }
            if r + 1 < h {
                visit(idx + w);
            }
        }
    }
    Labels { ids, codes }
}

/// Directed boundary edges of every region, region on the left.
fn boundary_edges(labels: &Labels, w: usize, h: usize) -> Vec<Vec<(Vertex, Vertex)>> {
    let mut edges = vec![Vec::new(); labels.codes.len()];
    let id_at = |r: i64, c: i64| -> u32 {
        if r < 0 || c < 0 || r >= h as i64 || c >= w as i64 {
            UNLABELLED
        } else {
            labels.ids[r as usize * w + c as usize]
        }
    };
    for r in 0..h as i64 {
        for c in 0..w as i64 {
            let id = id_at(r, c);
            if id == UNLABELLED {
                continue;
            }
            let out = &mut edges[id as usize];
            if id_at(r - 1, c) != id {
                out.push(((c, r), (c + 1, r)));
            }
            if id_at(r, c + 1) != id {
                out.push(((c + 1, r), (c + 1, r + 1)));
            }
            if id_at(r + 1, c) != id {
                out.push(((c + 1, r + 1), (c, r + 1)));
            }
            if id_at(r, c - 1) != id {
                out.push(((c, r + 1), (c, r)));
            }
        }
    }
    edges
}

/// Turn rank of leaving along `out` after arriving along `inc`:
/// right, then straight, then left.
fn turn_rank(inc: Vertex, out: Vertex) -> u8 {
    let cross = inc.0 * out.1 - inc.1 * out.0;
    let dot = inc.0 * out.0 + inc.1 * out.1;
    match (cross.signum(), dot > 0) {
        (-1, _) => 0,
        (0, true) => 1,
        (1, _) => 2,
        _ => 3,
    }
}

/// Chain one region's edges into closed rings of lattice vertices.
///
/// Every edge has exactly one successor: the outgoing edge at its end
/// vertex with the best turn rank. Successors form a permutation of the
/// edges whose cycles are the rings.
fn chain_rings(edges: &[(Vertex, Vertex)]) -> Vec<Vec<Vertex>> {
    let mut outgoing: HashMap<Vertex, Vec<usize>> = HashMap::new();
    for (i, (a, _)) in edges.iter().enumerate() {
        outgoing.entry(*a).or_default().push(i);
    }
    let successor: Vec<Option<usize>> = edges
        .iter()
        .map(|&(a, b)| {
            let inc = (b.0 - a.0, b.1 - a.1);
            outgoing.get(&b).and_then(|cands| {
                cands.iter().copied().min_by_key(|&e| {
                    let (s, t) = edges[e];
                    turn_rank(inc, (t.0 - s.0, t.1 - s.1))
                })
            })
        })
        .collect();

    let mut used = vec![false; edges.len()];
    let mut rings = Vec::new();
    for first in 0..edges.len() {
        if used[first] {
            continue;
        }
        let mut ring = Vec::new();
        let mut current = first;
        while !used[current] {
            used[current] = true;
            ring.push(edges[current].0);
            match successor[current] {
                Some(next) => current = next,
                None => break,
            }
        }
        rings.push(drop_collinear(ring));
    }
    rings
}

/// Remove vertices lying on a straight run.
fn drop_collinear(ring: Vec<Vertex>) -> Vec<Vertex> {
    let n = ring.len();
    if n < 4 {
        return ring;
    }
    (0..n)
        .filter(|&i| {
            let p = ring[(i + n - 1) % n];
            let v = ring[i];
            let q = ring[(i + 1) % n];
            (v.0 - p.0) * (q.1 - v.1) - (v.1 - p.1) * (q.0 - v.0) != 0
        })
        .map(|i| ring[i])
        .collect()
}

fn lattice_area2(ring: &[Vertex]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (a, b) = (ring[i], ring[(i + 1) % n]);
            a.0 * b.1 - b.0 * a.1
        })
        .sum()
}

fn lattice_line(ring: &[Vertex]) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = ring.iter().map(|&(x, y)| Coord { x: x as f64, y: y as f64 }).collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    LineString::new(coords)
}

/// A traced region in lattice coordinates.
pub struct LatticeRegion {
    pub code: u32,
    pub polygons: Vec<Polygon<f64>>,
}

/// Trace every region of `coded` into lattice polygons, in region-id order.
pub fn trace_regions(coded: &CodedRaster) -> Vec<LatticeRegion> {
    let labels = label_regions(coded);
    let edges = boundary_edges(&labels, coded.width, coded.height);

    edges
        .iter()
        .zip(&labels.codes)
        .map(|(region_edges, &code)| {
            let mut exteriors = Vec::new();
            let mut holes = Vec::new();
            for ring in chain_rings(region_edges) {
                if lattice_area2(&ring) > 0 {
                    exteriors.push(ring);
                } else {
                    holes.push(ring);
                }
            }
            LatticeRegion { code, polygons: assemble(exteriors, holes) }
        })
        .collect()
}

/// Attach each hole to the exterior that contains it.
fn assemble(exteriors: Vec<Vec<Vertex>>, holes: Vec<Vec<Vertex>>) -> Vec<Polygon<f64>> {
    if exteriors.len() == 1 {
        let interiors = holes.iter().map(|h| lattice_line(h)).collect();
        return vec![Polygon::new(lattice_line(&exteriors[0]), interiors)];
    }
    let shells: Vec<Polygon<f64>> = exteriors.iter().map(|e| Polygon::new(lattice_line(e), vec![])).collect();
    let mut interiors: Vec<Vec<LineString<f64>>> = vec![Vec::new(); shells.len()];
    for hole in &holes {
        let (a, b) = (hole[0], hole[1 % hole.len()]);
        let probe = Coord { x: (a.0 + b.0) as f64 / 2.0, y: (a.1 + b.1) as f64 / 2.0 };
        if let Some(i) = shells.iter().position(|s| s.contains(&probe)) {
            interiors[i].push(lattice_line(hole));
        }
    }
    shells
        .into_iter()
        .zip(interiors)
        .map(|(shell, inner)| Polygon::new(shell.exterior().clone(), inner))
        .collect()
}

/// Map a lattice polygon through `apply` and normalise ring orientation
/// (exterior counter-clockwise, holes clockwise).
pub fn to_world(poly: &Polygon<f64>, apply: impl Fn(f64, f64) -> (f64, f64)) -> Polygon<f64> {
    let map = |ls: &LineString<f64>| {
        LineString::new(
            ls.coords()
                .map(|c| {
                    let (x, y) = apply(c.x, c.y);
                    Coord { x, y }
                })
                .collect(),
        )
    };
    let interiors = poly.interiors().iter().map(map).collect();
    Polygon::new(map(poly.exterior()), interiors).orient(Direction::Default)
}
