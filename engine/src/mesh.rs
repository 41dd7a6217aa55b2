//! Unstructured triangle meshes and interpolation between the regular
//! raster grids and mesh vertices.
//!
//! The mesh generator and the forward solver both speak Triangle's
//! node/element convention; this module holds the in-memory form plus the
//! geometric primitives the pipeline needs: triangle area and per-element
//! gradients, point location, barycentric interpolation, and bilinear
//! sampling of a raster at arbitrary points.

use crate::error::{Error, Result};
use crate::raster::Raster;

/// An unstructured triangulation over a shared vertex index space.
/// Vertex boundary markers are carried as opaque metadata.
#[derive(Debug, Clone)]
pub struct Triangulation {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub triangles: Vec<[usize; 3]>,
    pub boundary: Vec<i32>,
}

impl Triangulation {
    pub fn new(
        x: Vec<f64>,
        y: Vec<f64>,
        triangles: Vec<[usize; 3]>,
        boundary: Vec<i32>,
    ) -> Result<Triangulation> {
        let nn = x.len();
        if y.len() != nn || boundary.len() != nn {
            return Err(Error::Domain(format!(
                "vertex arrays disagree: {} x, {} y, {} markers",
                nn,
                y.len(),
                boundary.len()
            )));
        }
        let tri = Triangulation {
            x,
            y,
            triangles,
            boundary,
        };
        for (n, t) in tri.triangles.iter().enumerate() {
            if t.iter().any(|&k| k >= nn) {
                return Err(Error::Domain(format!(
                    "triangle {} references vertex beyond {}",
                    n, nn
                )));
            }
            if t[0] == t[1] || t[1] == t[2] || t[0] == t[2] {
                return Err(Error::Domain(format!("triangle {} repeats a vertex", n)));
            }
            if tri.area(n) <= 1.0e-12 {
                return Err(Error::Domain(format!("triangle {} is degenerate", n)));
            }
        }
        Ok(tri)
    }

    pub fn num_vertices(&self) -> usize {
        self.x.len()
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    /// Half-cross-product area of triangle `n`.
    pub fn area(&self, n: usize) -> f64 {
        let [a, b, c] = self.triangles[n];
        0.5 * ((self.x[b] - self.x[a]) * (self.y[c] - self.y[a])
            - (self.x[c] - self.x[a]) * (self.y[b] - self.y[a]))
            .abs()
    }

    /// Gradient of a per-vertex field over triangle `n`, via the affine
    /// map from the reference edge vectors: solve `S^T grad = dq` with
    /// `S = [p1 - p0, p2 - p0]`.
    pub fn gradient(&self, n: usize, q: &[f64]) -> [f64; 2] {
        let [a, b, c] = self.triangles[n];
        let s00 = self.x[b] - self.x[a];
        let s01 = self.x[c] - self.x[a];
        let s10 = self.y[b] - self.y[a];
        let s11 = self.y[c] - self.y[a];
        let det = s00 * s11 - s01 * s10;
        let dq1 = q[b] - q[a];
        let dq2 = q[c] - q[a];
        [
            (dq1 * s11 - dq2 * s10) / det,
            (dq2 * s00 - dq1 * s01) / det,
        ]
    }

    /// Barycentric coordinates of `(px, py)` with respect to triangle `n`.
    pub fn barycentric(&self, n: usize, px: f64, py: f64) -> [f64; 3] {
        let [a, b, c] = self.triangles[n];
        let s00 = self.x[b] - self.x[a];
        let s01 = self.x[c] - self.x[a];
        let s10 = self.y[b] - self.y[a];
        let s11 = self.y[c] - self.y[a];
        let det = s00 * s11 - s01 * s10;
        let dx = px - self.x[a];
        let dy = py - self.y[a];
        let l1 = (dx * s11 - dy * s01) / det;
        let l2 = (dy * s00 - dx * s10) / det;
        [1.0 - l1 - l2, l1, l2]
    }
}

const INSIDE_TOL: f64 = 1.0e-12;

/// Point-location index over a triangulation: triangles are bucketed by
/// bounding box on a coarse uniform grid, so a query only tests the
/// handful of triangles near the point.
pub struct TriFinder<'a> {
    tri: &'a Triangulation,
    xmin: f64,
    ymin: f64,
    inv_w: f64,
    inv_h: f64,
    ncols: usize,
    nrows: usize,
    buckets: Vec<Vec<usize>>,
}

impl<'a> TriFinder<'a> {
    pub fn new(tri: &'a Triangulation) -> TriFinder<'a> {
        let xmin = tri.x.iter().cloned().fold(f64::INFINITY, f64::min);
        let xmax = tri.x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let ymin = tri.y.iter().cloned().fold(f64::INFINITY, f64::min);
        let ymax = tri.y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let nb = ((tri.num_triangles() as f64).sqrt().ceil() as usize).max(1);
        let ncols = nb;
        let nrows = nb;
        let w = ((xmax - xmin) / ncols as f64).max(f64::MIN_POSITIVE);
        let h = ((ymax - ymin) / nrows as f64).max(f64::MIN_POSITIVE);

        let mut buckets = vec![Vec::new(); ncols * nrows];
        for (n, t) in tri.triangles.iter().enumerate() {
            let txmin = t.iter().map(|&k| tri.x[k]).fold(f64::INFINITY, f64::min);
            let txmax = t.iter().map(|&k| tri.x[k]).fold(f64::NEG_INFINITY, f64::max);
            let tymin = t.iter().map(|&k| tri.y[k]).fold(f64::INFINITY, f64::min);
            let tymax = t.iter().map(|&k| tri.y[k]).fold(f64::NEG_INFINITY, f64::max);

            let c0 = (((txmin - xmin) / w) as usize).min(ncols - 1);
            let c1 = (((txmax - xmin) / w) as usize).min(ncols - 1);
            let r0 = (((tymin - ymin) / h) as usize).min(nrows - 1);
            let r1 = (((tymax - ymin) / h) as usize).min(nrows - 1);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    buckets[r * ncols + c].push(n);
                }
            }
        }

        TriFinder {
            tri,
            xmin,
            ymin,
            inv_w: 1.0 / w,
            inv_h: 1.0 / h,
            ncols,
            nrows,
            buckets,
        }
    }

    /// Index of the triangle containing the point, or `None` when the
    /// point lies outside the triangulated domain. Callers must check
    /// before using any interpolated value.
    pub fn find(&self, px: f64, py: f64) -> Option<usize> {
        let fc = (px - self.xmin) * self.inv_w;
        let fr = (py - self.ymin) * self.inv_h;
        if fc < 0.0 || fr < 0.0 {
            return None;
        }
        let c = (fc as usize).min(self.ncols - 1);
        let r = (fr as usize).min(self.nrows - 1);
        if fc > self.ncols as f64 || fr > self.nrows as f64 {
            return None;
        }

        for &n in &self.buckets[r * self.ncols + c] {
            let l = self.tri.barycentric(n, px, py);
            if l.iter().all(|&v| v >= -INSIDE_TOL) {
                return Some(n);
            }
        }
        None
    }
}

/// Linear interpolation of a per-vertex field at a point, using the
/// containing triangle's barycentric coordinates. `None` outside the mesh.
pub fn linear_interpolate(
    tri: &Triangulation,
    finder: &TriFinder,
    q: &[f64],
    px: f64,
    py: f64,
) -> Option<f64> {
    let n = finder.find(px, py)?;
    let l = tri.barycentric(n, px, py);
    let [a, b, c] = tri.triangles[n];
    Some(l[0] * q[a] + l[1] * q[b] + l[2] * q[c])
}

/// Bilinear blend of the four raster values around the point.
///
/// Fails when the cell below the point or its upper neighbors fall outside
/// the grid. No-data sentinels are not treated specially here; callers
/// either pre-filter or accept sentinel-contaminated blends, matching the
/// upstream convention.
pub fn bilinear_sample(r: &Raster, px: f64, py: f64) -> Result<f64> {
    let dx = r.dx();
    let dy = r.dy();
    let j = ((px - r.x[0]) / dx).floor();
    let i = ((py - r.y[0]) / dy).floor();
    if i < 0.0 || j < 0.0 || i + 1.0 >= r.ny() as f64 || j + 1.0 >= r.nx() as f64 {
        return Err(Error::Domain(format!(
            "point ({}, {}) has no complete bilinear cell",
            px, py
        )));
    }
    let i = i as usize;
    let j = j as usize;

    let ax = (px - r.x[j]) / dx;
    let ay = (py - r.y[i]) / dy;

    let q00 = r.get(i, j);
    let q01 = r.get(i, j + 1);
    let q10 = r.get(i + 1, j);
    let q11 = r.get(i + 1, j + 1);

    Ok(q00 + ax * (q01 - q00) + ay * (q10 - q00) + ax * ay * (q00 + q11 - q01 - q10))
}

/// Total-function variant of [bilinear_sample]: queries outside the grid
/// are clamped onto its edge cell. Used when resampling between two grids
/// that cover the same footprint but disagree at the margin by a cell.
pub fn bilinear_sample_clamped(r: &Raster, px: f64, py: f64) -> f64 {
    let dx = r.dx();
    let dy = r.dy();
    let j = (((px - r.x[0]) / dx).floor().max(0.0) as usize).min(r.nx() - 2);
    let i = (((py - r.y[0]) / dy).floor().max(0.0) as usize).min(r.ny() - 2);

    let ax = (px - r.x[j]) / dx;
    let ay = (py - r.y[i]) / dy;

    let q00 = r.get(i, j);
    let q01 = r.get(i, j + 1);
    let q10 = r.get(i + 1, j);
    let q11 = r.get(i + 1, j + 1);

    q00 + ax * (q01 - q00) + ay * (q10 - q00) + ax * ay * (q00 + q11 - q01 - q10)
}

/// Samples a raster at every mesh vertex.
pub fn sample_to_vertices(r: &Raster, tri: &Triangulation) -> Result<Vec<f64>> {
    (0..tri.num_vertices())
        .map(|n| bilinear_sample(r, tri.x[n], tri.y[n]))
        .collect()
}

/// Resamples a raster onto new coordinate vectors, clamping queries at the
/// source margin.
pub fn resample(src: &Raster, x: &[f64], y: &[f64]) -> Result<Raster> {
    let mut out = Raster::filled(x.to_vec(), y.to_vec(), 0.0)?;
    for i in 0..y.len() {
        for j in 0..x.len() {
            let v = bilinear_sample_clamped(src, x[j], y[i]);
            out.set(i, j, v);
        }
    }
    Ok(out)
}

/// Target areas for mesh refinement, one per element, from the local ice
/// speed: fast ice gets elements with edge length near `dx`, slower ice
/// coarsens by factors of 2 and 4. The speed at a vertex is the average of
/// the four raster nodes around it.
pub fn refinement_areas(tri: &Triangulation, speed: &Raster, dx: f64) -> Result<Vec<f64>> {
    let mut v = vec![0.0; tri.num_vertices()];
    for n in 0..tri.num_vertices() {
        let (i, j) = speed.cell_index(tri.x[n], tri.y[n])?;
        if i + 1 >= speed.ny() || j + 1 >= speed.nx() {
            return Err(Error::Domain(format!(
                "mesh vertex {} sits on the speed grid margin",
                n
            )));
        }
        v[n] = 0.25
            * (speed.get(i, j) + speed.get(i + 1, j) + speed.get(i, j + 1) + speed.get(i + 1, j + 1));
    }

    let unit = 3.0_f64.sqrt() / 4.0;
    Ok(tri
        .triangles
        .iter()
        .map(|t| {
            let s = (v[t[0]] + v[t[1]] + v[t[2]]) / 3.0;
            if s > 1000.0 {
                unit * dx * dx
            } else if s > 500.0 {
                unit * (2.0 * dx) * (2.0 * dx)
            } else {
                unit * (4.0 * dx) * (4.0 * dx)
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::NO_DATA;

    /// Unit square split along the main diagonal.
    fn square() -> Triangulation {
        Triangulation::new(
            vec![0.0, 1.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0, 1.0],
            vec![[0, 1, 2], [0, 2, 3]],
            vec![1, 1, 1, 1],
        )
        .unwrap()
    }

    fn grid_raster(nx: usize, ny: usize, d: f64, f: impl Fn(f64, f64) -> f64) -> Raster {
        let x: Vec<f64> = (0..nx).map(|k| k as f64 * d).collect();
        let y: Vec<f64> = (0..ny).map(|k| k as f64 * d).collect();
        let mut r = Raster::filled(x.clone(), y.clone(), 0.0).unwrap();
        for i in 0..ny {
            for j in 0..nx {
                r.set(i, j, f(x[j], y[i]));
            }
        }
        r
    }

    #[test]
    fn degenerate_triangles_are_rejected() {
        let colinear = Triangulation::new(
            vec![0.0, 1.0, 2.0],
            vec![0.0, 1.0, 2.0],
            vec![[0, 1, 2]],
            vec![0, 0, 0],
        );
        assert!(colinear.is_err());

        let repeated = Triangulation::new(
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![[0, 1, 1]],
            vec![0, 0, 0],
        );
        assert!(repeated.is_err());
    }

    #[test]
    fn shoelace_area_of_the_unit_square_halves() {
        let tri = square();
        assert!((tri.area(0) - 0.5).abs() < 1.0e-14);
        assert!((tri.area(1) - 0.5).abs() < 1.0e-14);
    }

    #[test]
    fn gradient_is_exact_for_affine_fields() {
        let tri = square();
        let q: Vec<f64> = tri
            .x
            .iter()
            .zip(tri.y.iter())
            .map(|(&x, &y)| 3.0 * x - 2.0 * y + 7.0)
            .collect();
        for n in 0..tri.num_triangles() {
            let g = tri.gradient(n, &q);
            assert!((g[0] - 3.0).abs() < 1.0e-12);
            assert!((g[1] + 2.0).abs() < 1.0e-12);
        }
    }

    #[test]
    fn trifinder_locates_points_and_rejects_outsiders() {
        let tri = square();
        let finder = TriFinder::new(&tri);
        assert_eq!(finder.find(0.7, 0.2), Some(0));
        assert_eq!(finder.find(0.2, 0.7), Some(1));
        assert_eq!(finder.find(1.5, 0.5), None);
        assert_eq!(finder.find(-0.1, 0.5), None);
    }

    #[test]
    fn linear_interpolation_reproduces_affine_fields() {
        let tri = square();
        let finder = TriFinder::new(&tri);
        let q: Vec<f64> = tri
            .x
            .iter()
            .zip(tri.y.iter())
            .map(|(&x, &y)| 5.0 * x + 2.0 * y - 1.0)
            .collect();
        for &(px, py) in &[(0.3, 0.3), (0.9, 0.05), (0.1, 0.85), (0.5, 0.5)] {
            let v = linear_interpolate(&tri, &finder, &q, px, py).unwrap();
            assert!((v - (5.0 * px + 2.0 * py - 1.0)).abs() < 1.0e-12);
        }
        assert!(linear_interpolate(&tri, &finder, &q, 2.0, 2.0).is_none());
    }

    #[test]
    fn bilinear_is_exact_at_the_four_cell_corners() {
        let r = grid_raster(4, 4, 1.0, |x, y| x * 10.0 + y);
        // corners of the cell with lower-left node (1, 1)
        for &(i, j) in &[(1usize, 1usize), (1, 2), (2, 1), (2, 2)] {
            let v = bilinear_sample(&r, r.x[j], r.y[i]).unwrap();
            assert_eq!(v, r.get(i, j));
        }
    }

    #[test]
    fn bilinear_reproduces_affine_fields_between_nodes() {
        let r = grid_raster(5, 5, 2.0, |x, y| 1.5 * x - 0.5 * y + 4.0);
        for &(px, py) in &[(1.3, 2.7), (3.99, 0.01), (5.5, 7.5), (0.1, 6.2)] {
            let v = bilinear_sample(&r, px, py).unwrap();
            assert!((v - (1.5 * px - 0.5 * py + 4.0)).abs() < 1.0e-10);
        }
    }

    #[test]
    fn bilinear_rejects_points_without_a_complete_cell() {
        let r = grid_raster(4, 4, 1.0, |_, _| 0.0);
        assert!(bilinear_sample(&r, -0.5, 1.0).is_err());
        assert!(bilinear_sample(&r, 1.0, 3.5).is_err());
        // the far corner node itself has no cell above/right of it
        assert!(bilinear_sample(&r, 3.0, 3.0).is_err());
    }

    #[test]
    fn bilinear_propagates_sentinels_rather_than_hiding_them() {
        let mut r = grid_raster(3, 3, 1.0, |_, _| 1.0);
        r.set(0, 0, NO_DATA);
        let v = bilinear_sample(&r, 0.5, 0.5).unwrap();
        // the blend is contaminated, on purpose
        assert!(v < -1.0e8);
    }

    #[test]
    fn clamped_sampling_extends_the_margin() {
        let r = grid_raster(4, 4, 1.0, |x, y| x + y);
        let inside = bilinear_sample_clamped(&r, 3.0, 3.0);
        assert!((inside - 6.0).abs() < 1.0e-12);
        // beyond the grid the affine extension continues
        let beyond = bilinear_sample_clamped(&r, 3.5, 3.0);
        assert!((beyond - 6.5).abs() < 1.0e-12);
    }

    #[test]
    fn refinement_areas_follow_the_speed_thresholds() {
        // big raster so every vertex has a full cell around it
        let slow = grid_raster(8, 8, 1.0, |_, _| 100.0);
        let mid = grid_raster(8, 8, 1.0, |_, _| 700.0);
        let fast = grid_raster(8, 8, 1.0, |_, _| 1500.0);

        let tri = Triangulation::new(
            vec![2.0, 4.0, 4.0, 2.0],
            vec![2.0, 2.0, 4.0, 4.0],
            vec![[0, 1, 2], [0, 2, 3]],
            vec![0, 0, 0, 0],
        )
        .unwrap();

        let dx = 250.0;
        let unit = 3.0_f64.sqrt() / 4.0;
        assert!((refinement_areas(&tri, &fast, dx).unwrap()[0] - unit * dx * dx).abs() < 1.0e-6);
        assert!(
            (refinement_areas(&tri, &mid, dx).unwrap()[0] - unit * 4.0 * dx * dx).abs() < 1.0e-6
        );
        assert!(
            (refinement_areas(&tri, &slow, dx).unwrap()[0] - unit * 16.0 * dx * dx).abs() < 1.0e-6
        );
    }
}
