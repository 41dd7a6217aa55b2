//! Classification and reconstruction of missing points in gridded data.
//! This is everything between reading a raw grid and handing a gap-free
//! raster to the basal field solver.
/*
MIT License

Copyright (c) 2020 Peter Lee

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::raster::{CellStatus, Raster, EXTERIOR, EXTERIOR_QUEUED, NO_DATA};

/// How neighbor indices behave at the grid edge during flood fill.
///
/// The survey grids this pipeline was written for are classified with
/// `Toroidal` connectivity: neighbor indices wrap modulo the grid
/// dimensions, so the fill sweeps around the edges of the grid in one pass
/// from a single corner seed. That is a connectivity statement only; no
/// interpolation ever wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTopology {
    Toroidal,
    Clamped,
}

/// Flood-fills from `seed` over the 8-connected neighborhood, relabeling
/// every reachable no-data point as exterior. Points still tagged
/// [CellStatus::NoData] afterwards are interior gaps, surrounded by real
/// data, and are the candidates for [fill_interior_gaps].
///
/// Iterative with an explicit stack; the reachable region can cover tens of
/// thousands of cells. Each cell is pushed at most once because it is
/// retagged before pushing.
pub fn relabel_exterior(q: &mut Raster, seed: (usize, usize), topology: EdgeTopology) {
    let ny = q.ny() as isize;
    let nx = q.nx() as isize;

    let mut stack: Vec<(usize, usize)> = Vec::new();
    q.set(seed.0, seed.1, EXTERIOR_QUEUED);
    stack.push(seed);

    while let Some((i, j)) = stack.pop() {
        q.set(i, j, EXTERIOR);

        for di in -1..=1isize {
            for dj in -1..=1isize {
                if di == 0 && dj == 0 {
                    continue;
                }
                let (k, l) = match topology {
                    EdgeTopology::Toroidal => (
                        ((i as isize + di).rem_euclid(ny)) as usize,
                        ((j as isize + dj).rem_euclid(nx)) as usize,
                    ),
                    EdgeTopology::Clamped => {
                        let k = i as isize + di;
                        let l = j as isize + dj;
                        if k < 0 || k >= ny || l < 0 || l >= nx {
                            continue;
                        }
                        (k as usize, l as usize)
                    }
                };

                if q.status(k, l) == CellStatus::NoData {
                    q.set(k, l, EXTERIOR_QUEUED);
                    stack.push((k, l));
                }
            }
        }
    }
}

/// Result of a gap-filling pass.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub filled: usize,
    /// Gaps with no real neighbor within the radius, left at the no-data
    /// sentinel. Downstream stages must tolerate these.
    pub unfilled: Vec<(usize, usize)>,
}

impl FillOutcome {
    /// For callers that need every interior gap filled.
    pub fn require_complete(&self) -> Result<()> {
        if self.unfilled.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingData {
                count: self.unfilled.len(),
            })
        }
    }
}

/// Fills interior gaps by inverse-cube-distance weighting over the
/// `(2d+1)x(2d+1)` window around each gap, excluding the center. Only
/// neighbors carrying real data contribute; exterior-tagged points never
/// do. Gaps are processed in row-major order and a filled gap counts as
/// real data for the gaps after it.
pub fn fill_interior_gaps(q: &mut Raster, d: usize) -> FillOutcome {
    let ny = q.ny() as isize;
    let nx = q.nx() as isize;
    let d = d as isize;

    let mut gaps: Vec<(usize, usize)> = Vec::new();
    for i in 0..q.ny() {
        for j in 0..q.nx() {
            if q.status(i, j) == CellStatus::NoData {
                gaps.push((i, j));
            }
        }
    }

    let mut outcome = FillOutcome {
        filled: 0,
        unfilled: Vec::new(),
    };

    for &(i, j) in &gaps {
        let mut sum = 0.0;
        let mut weights = 0.0;

        for di in -d..=d {
            for dj in -d..=d {
                if di == 0 && dj == 0 {
                    continue;
                }
                let k = i as isize + di;
                let l = j as isize + dj;
                if k < 0 || k >= ny || l < 0 || l >= nx {
                    continue;
                }
                if q.has_data(k as usize, l as usize) {
                    let dist = ((di * di + dj * dj) as f64).sqrt();
                    let weight = 1.0 / dist.powi(3);
                    sum += weight * q.get(k as usize, l as usize);
                    weights += weight;
                }
            }
        }

        if weights != 0.0 {
            q.set(i, j, sum / weights);
            outcome.filled += 1;
        } else {
            debug!("gap at ({}, {}) has no data within radius {}", i, j, d);
            outcome.unfilled.push((i, j));
        }
    }

    if !outcome.unfilled.is_empty() {
        warn!(
            "{} of {} interior gaps had no data within radius {} and were left unfilled",
            outcome.unfilled.len(),
            gaps.len(),
            d
        );
    }

    outcome
}

/// How a reconstructed raster is combined with the raster it was derived
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep the reconstructed values as they are.
    Direct,
    /// Take the pointwise maximum of the reconstructed and original values.
    /// Exterior markers are far more negative than any measurement, so this
    /// restores the original value wherever one existed and keeps whichever
    /// classification result is larger elsewhere.
    MaxWithOriginal,
}

/// Classify-then-fill pass over a raster, as applied to the velocity grids
/// before writing them out. Returns the cleaned raster and the fill
/// outcome; `q` itself is not modified.
pub fn fixup(q: &Raster, seed: (usize, usize), d: usize, topology: EdgeTopology, merge: MergeMode) -> (Raster, FillOutcome) {
    let mut qc = q.clone();
    relabel_exterior(&mut qc, seed, topology);
    let outcome = fill_interior_gaps(&mut qc, d);

    if merge == MergeMode::MaxWithOriginal {
        for i in 0..q.ny() {
            for j in 0..q.nx() {
                let merged = qc.get(i, j).max(q.get(i, j));
                qc.set(i, j, merged);
            }
        }
    }

    (qc, outcome)
}

/// Neighbor-count thresholds for [despeckle].
#[derive(Debug, Clone, Copy)]
pub struct DespeckleThresholds {
    /// A no-data point with this many cardinal data neighbors is filled
    /// with their average.
    pub cardinal_fill: usize,
    /// A data point with at most this many of its 8 neighbors carrying
    /// data is cleared.
    pub isolated_max: usize,
    /// Second pass: a data point with fewer than this many of its 8
    /// neighbors carrying data is cleared.
    pub required_of_eight: usize,
}

impl Default for DespeckleThresholds {
    fn default() -> DespeckleThresholds {
        DespeckleThresholds {
            cardinal_fill: 4,
            isolated_max: 1,
            required_of_eight: 4,
        }
    }
}

const CARDINAL: [(isize, isize); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const RING: [(isize, isize); 8] = [
    (1, 1),
    (1, 0),
    (1, -1),
    (0, 1),
    (0, -1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

/// Cleans up a freshly decoded velocity grid: plug single-cell holes whose
/// cardinal neighbors all carry data, then drop points too isolated to
/// trust. Interior points only; the grid is edited in place and earlier
/// edits are visible to later ones, like the original survey tooling.
pub fn despeckle(q: &mut Raster, thresholds: DespeckleThresholds) {
    let ny = q.ny();
    let nx = q.nx();

    for i in 1..ny - 1 {
        for j in 1..nx - 1 {
            if q.status(i, j) == CellStatus::NoData {
                let mut count = 0;
                let mut total = 0.0;
                for &(di, dj) in &CARDINAL {
                    let k = (i as isize + di) as usize;
                    let l = (j as isize + dj) as usize;
                    if q.has_data(k, l) {
                        count += 1;
                        total += q.get(k, l);
                    }
                }
                if count >= thresholds.cardinal_fill {
                    q.set(i, j, total / count as f64);
                }
            } else if q.has_data(i, j) {
                let count = ring_data_count(q, i, j);
                if count <= thresholds.isolated_max {
                    q.set(i, j, NO_DATA);
                }
            }
        }
    }

    for i in 1..ny - 1 {
        for j in 1..nx - 1 {
            if q.has_data(i, j) && ring_data_count(q, i, j) < thresholds.required_of_eight {
                q.set(i, j, NO_DATA);
            }
        }
    }
}

fn ring_data_count(q: &Raster, i: usize, j: usize) -> usize {
    RING.iter()
        .filter(|&&(di, dj)| {
            q.has_data((i as isize + di) as usize, (j as isize + dj) as usize)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Raster, EXTERIOR, NO_DATA};

    fn coords(n: usize) -> Vec<f64> {
        (0..n).map(|k| k as f64).collect()
    }

    /// 5x5 grid: no-data border (exterior), one data ring, one enclosed
    /// no-data cell in the middle.
    fn ringed() -> Raster {
        let mut q = Raster::filled(coords(5), coords(5), 1.0).unwrap();
        for k in 0..5 {
            q.set(0, k, NO_DATA);
            q.set(4, k, NO_DATA);
            q.set(k, 0, NO_DATA);
            q.set(k, 4, NO_DATA);
        }
        q.set(2, 2, NO_DATA);
        q
    }

    #[test]
    fn flood_fill_separates_exterior_from_interior() {
        let mut q = ringed();
        relabel_exterior(&mut q, (0, 0), EdgeTopology::Toroidal);

        for k in 0..5 {
            assert_eq!(q.get(0, k), EXTERIOR);
            assert_eq!(q.get(4, k), EXTERIOR);
            assert_eq!(q.get(k, 0), EXTERIOR);
            assert_eq!(q.get(k, 4), EXTERIOR);
        }
        // the enclosed cell is untouched
        assert_eq!(q.get(2, 2), NO_DATA);
        assert_eq!(q.status(2, 2), CellStatus::NoData);
        assert_eq!(q.get(1, 1), 1.0);
    }

    #[test]
    fn flood_fill_is_idempotent() {
        let mut q = ringed();
        relabel_exterior(&mut q, (0, 0), EdgeTopology::Toroidal);
        let first = q.clone();
        relabel_exterior(&mut q, (0, 0), EdgeTopology::Toroidal);
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(q.get(i, j), first.get(i, j));
            }
        }
    }

    #[test]
    fn toroidal_fill_wraps_around_a_data_wall() {
        // data wall down column 2; seed at the west edge. With wraparound
        // the fill reaches the east side; clamped it cannot.
        let make = || {
            let mut q = Raster::filled(coords(5), coords(5), NO_DATA).unwrap();
            for i in 0..5 {
                q.set(i, 2, 1.0);
            }
            q
        };

        let mut wrapped = make();
        relabel_exterior(&mut wrapped, (2, 0), EdgeTopology::Toroidal);
        assert_eq!(wrapped.get(2, 4), EXTERIOR);

        let mut clamped = make();
        relabel_exterior(&mut clamped, (2, 0), EdgeTopology::Clamped);
        assert_eq!(clamped.get(2, 4), NO_DATA);
        assert_eq!(clamped.get(2, 1), EXTERIOR);
    }

    #[test]
    fn lone_gap_surrounded_by_equal_values_gets_that_value() {
        let mut q = Raster::filled(coords(5), coords(5), 1.0).unwrap();
        q.set(2, 2, NO_DATA);
        let outcome = fill_interior_gaps(&mut q, 1);
        assert_eq!(outcome.filled, 1);
        assert!(outcome.unfilled.is_empty());
        assert!((q.get(2, 2) - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn gap_with_no_neighbors_is_reported_not_zeroed() {
        // nothing to interpolate from anywhere on the grid
        let mut q = Raster::filled(coords(7), coords(7), NO_DATA).unwrap();
        let outcome = fill_interior_gaps(&mut q, 1);
        assert_eq!(outcome.filled, 0);
        assert!(outcome.unfilled.contains(&(3, 3)));
        assert_eq!(q.get(3, 3), NO_DATA);
        assert_eq!(q.status(3, 3), CellStatus::NoData);
        match outcome.require_complete() {
            Err(Error::MissingData { count }) => assert_eq!(count, 49),
            other => panic!("expected a missing-data error, got {:?}", other),
        }
    }

    #[test]
    fn exterior_points_never_contribute_to_fill() {
        let mut q = ringed();
        relabel_exterior(&mut q, (0, 0), EdgeTopology::Toroidal);
        // gap at (2,2): its 8 neighbors are all real 1.0 values; the
        // exterior markers two cells away must not be inside radius 1
        // anyway, but widen the radius to make sure they are skipped.
        let outcome = fill_interior_gaps(&mut q, 2);
        assert_eq!(outcome.filled, 1);
        assert!((q.get(2, 2) - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn weighted_fill_prefers_near_neighbors() {
        let mut q = Raster::filled(coords(5), coords(5), 1.0).unwrap();
        // distance-2 shell at value 100, distance-1 shell at 1
        for k in 0..5 {
            q.set(0, k, 100.0);
            q.set(4, k, 100.0);
            q.set(k, 0, 100.0);
            q.set(k, 4, 100.0);
        }
        q.set(2, 2, NO_DATA);
        fill_interior_gaps(&mut q, 2);
        let v = q.get(2, 2);
        // by hand: near shell weight 4 + 4/2^1.5, far shell weight
        // 4/8 + 8/5^1.5 + 4/8^1.5, inverse-cube weighting
        assert!((v - 21.2511).abs() < 1.0e-2, "filled value {}", v);
    }

    #[test]
    fn max_merge_restores_original_data() {
        let q = ringed();
        let (fixed, _) = fixup(&q, (0, 0), 1, EdgeTopology::Toroidal, MergeMode::MaxWithOriginal);
        // exterior cells merge back to the generic no-data sentinel
        assert_eq!(fixed.get(0, 0), NO_DATA);
        // the interior gap is filled
        assert!((fixed.get(2, 2) - 1.0).abs() < 1.0e-12);
        // real data is untouched
        assert_eq!(fixed.get(1, 1), 1.0);
    }

    #[test]
    fn despeckle_fills_cardinal_holes_and_drops_islands() {
        let mut q = Raster::filled(coords(7), coords(7), NO_DATA).unwrap();
        // block of data with a hole at its center
        for i in 2..5 {
            for j in 2..5 {
                q.set(i, j, 2.0);
            }
        }
        q.set(3, 3, NO_DATA);
        // isolated speckle far from the block
        q.set(1, 5, 7.0);

        despeckle(&mut q, DespeckleThresholds::default());

        assert!((q.get(3, 3) - 2.0).abs() < 1.0e-12);
        assert_eq!(q.get(1, 5), NO_DATA);
    }

    #[test]
    fn despeckle_second_pass_erodes_thin_features() {
        let mut q = Raster::filled(coords(9), coords(9), NO_DATA).unwrap();
        // single-cell-wide line: every point has at most 2 data neighbors
        for j in 1..8 {
            q.set(4, j, 3.0);
        }
        despeckle(&mut q, DespeckleThresholds::default());
        for j in 1..8 {
            assert_eq!(q.get(4, j), NO_DATA);
        }
    }
}
