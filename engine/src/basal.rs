//! Initial guesses for basal sliding velocity and basal friction from
//! surface data, under a shallow-ice style closure.
//!
//! Surface velocity maps give the speed at the top of the ice column; the
//! forward model needs a starting guess for the speed at the bottom and
//! for the friction coefficient beta in the sliding law
//! `tau = -beta^2 * u`. This module derives both from the surface
//! velocity, the surface/bed elevations, and an assumed fraction of the
//! driving stress carried by basal drag.

use ndarray::Array2;

use crate::config::PhysicalConstants;
use crate::error::{Error, Result};
use crate::raster::{Raster, NO_DATA};

/// The three derived grids, co-indexed with the input velocity rasters.
/// Wherever the surface velocity had no data, all three carry the no-data
/// sentinel.
#[derive(Debug)]
pub struct BasalFields {
    pub beta: Raster,
    pub ub: Raster,
    pub vb: Raster,
}

/// One smoothing pass over the interior, `s <- (4s + N + S + E + W)/8`,
/// applied in place in row-major order so earlier updates feed later ones.
pub fn smooth_surface(s: &mut Raster) {
    for i in 1..s.ny() - 1 {
        for j in 1..s.nx() - 1 {
            let v = (4.0 * s.get(i, j)
                + s.get(i + 1, j)
                + s.get(i - 1, j)
                + s.get(i, j + 1)
                + s.get(i, j - 1))
                / 8.0;
            s.set(i, j, v);
        }
    }
}

/// Centered-difference surface slope components. Interior cells only; the
/// boundary rows/columns are then replicated from their interior neighbors.
pub fn surface_slope(s: &Raster) -> (Array2<f64>, Array2<f64>) {
    let ny = s.ny();
    let nx = s.nx();
    let dx = s.dx();
    let dy = s.dy();

    let mut dsdx = Array2::zeros((ny, nx));
    let mut dsdy = Array2::zeros((ny, nx));

    for i in 1..ny - 1 {
        for j in 1..nx - 1 {
            dsdx[[i, j]] = 0.5 * (s.get(i, j + 1) - s.get(i, j - 1)) / dx;
            dsdy[[i, j]] = 0.5 * (s.get(i + 1, j) - s.get(i - 1, j)) / dy;
        }
    }

    replicate_boundary(&mut dsdx);
    replicate_boundary(&mut dsdy);

    (dsdx, dsdy)
}

fn replicate_boundary(phi: &mut Array2<f64>) {
    let ny = phi.nrows();
    let nx = phi.ncols();
    for j in 0..nx {
        phi[[0, j]] = phi[[1, j]];
        phi[[ny - 1, j]] = phi[[ny - 2, j]];
    }
    for i in 0..ny {
        phi[[i, 0]] = phi[[i, 1]];
        phi[[i, nx - 1]] = phi[[i, nx - 2]];
    }
}

fn replicate_boundary_raster(phi: &mut Raster) {
    let ny = phi.ny();
    let nx = phi.nx();
    for j in 0..nx {
        let top = phi.get(1, j);
        phi.set(0, j, top);
        let bottom = phi.get(ny - 2, j);
        phi.set(ny - 1, j, bottom);
    }
    for i in 0..ny {
        let left = phi.get(i, 1);
        phi.set(i, 0, left);
        let right = phi.get(i, nx - 2);
        phi.set(i, nx - 1, right);
    }
}

/// Caps outlier slopes at `mean + 0.25 * stddev` of the slope magnitude,
/// rescaling both components so the direction is preserved. This is a
/// robustness clip for the sliding-speed guess, not a physical threshold.
pub fn cap_slope(dsdx: &mut Array2<f64>, dsdy: &mut Array2<f64>) -> Array2<f64> {
    let ny = dsdx.nrows();
    let nx = dsdx.ncols();

    let mut ds = Array2::zeros((ny, nx));
    for i in 0..ny {
        for j in 0..nx {
            ds[[i, j]] = dsdx[[i, j]].hypot(dsdy[[i, j]]);
        }
    }

    let n = (ny * nx) as f64;
    let mean = ds.iter().sum::<f64>() / n;
    let var = ds.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let cap = mean + 0.25 * var.sqrt();

    for i in 0..ny {
        for j in 0..nx {
            if ds[[i, j]] > cap {
                dsdx[[i, j]] *= cap / ds[[i, j]];
                dsdy[[i, j]] *= cap / ds[[i, j]];
                ds[[i, j]] = cap;
            }
        }
    }

    ds
}

/// Derives the basal sliding velocity and friction coefficient.
///
/// All four rasters must share the velocity grid. `frac` is the assumed
/// fraction of the driving stress supported by basal drag, in (0, 1).
/// Cells where the surface velocity has no data propagate the sentinel to
/// all three outputs and are excluded from the physics.
pub fn compute_basal_fields(
    s: &Raster,
    b: &Raster,
    u: &Raster,
    v: &Raster,
    frac: f64,
    beta_floor: f64,
    constants: &PhysicalConstants,
) -> Result<BasalFields> {
    let ny = u.ny();
    let nx = u.nx();
    for (name, r) in &[("surface", s), ("bed", b), ("v-velocity", v)] {
        if r.ny() != ny || r.nx() != nx {
            return Err(Error::Domain(format!(
                "{} raster is {}x{}, expected the {}x{} velocity grid",
                name,
                r.ny(),
                r.nx(),
                ny,
                nx
            )));
        }
    }
    if frac <= 0.0 || frac >= 1.0 {
        return Err(Error::Domain(format!("frac must lie in (0, 1), got {}", frac)));
    }

    let rho = constants.rho();
    let g = constants.g();
    let a = constants.arrhenius();

    let (mut dsdx, mut dsdy) = surface_slope(s);
    let ds = cap_slope(&mut dsdx, &mut dsdy);

    let mut beta = Raster::filled(u.x.clone(), u.y.clone(), 0.0)?;
    let mut ub = Raster::filled(u.x.clone(), u.y.clone(), 0.0)?;
    let mut vb = Raster::filled(u.x.clone(), u.y.clone(), 0.0)?;

    for i in 1..ny - 1 {
        for j in 1..nx - 1 {
            if !u.has_data(i, j) {
                beta.set(i, j, NO_DATA);
                ub.set(i, j, NO_DATA);
                vb.set(i, j, NO_DATA);
                continue;
            }

            let mut alpha = frac;
            let h = (s.get(i, j) - b.get(i, j)).max(0.0);
            let q = a * (rho * g * h).powi(3) * ds[[i, j]].powi(3) / 2.0;
            let speed = u.get(i, j).hypot(v.get(i, j));

            // A stagnant cell constrains nothing; pin the sliding speed to
            // zero rather than divide by it below.
            if speed == 0.0 {
                ub.set(i, j, 0.0);
                vb.set(i, j, 0.0);
                beta.set(i, j, beta_floor);
                continue;
            }

            let mut basal_speed = speed - alpha.powi(3) * h * q;
            if basal_speed <= 0.0 {
                // The assumed stress partition would make the ice deform
                // faster than it moves. Fall back to a small sliding speed
                // and re-derive the fraction consistent with it; h * q is
                // strictly positive on this branch.
                basal_speed = 10.0_f64.min(0.1 * speed);
                alpha = ((speed - basal_speed) / (h * q)).cbrt();
            }

            // Sliding keeps the direction of the surface velocity.
            ub.set(i, j, basal_speed / speed * u.get(i, j));
            vb.set(i, j, basal_speed / speed * v.get(i, j));

            // Inverting tau_xz = -beta^2 * u with the SIA strain rate gives
            // beta from quantities already guessed.
            let beta_val = (2.0 * alpha.powi(3) * q / (a * basal_speed.powi(3))).powf(1.0 / 6.0);
            beta.set(i, j, beta_val.max(beta_floor));
        }
    }

    replicate_boundary_raster(&mut beta);
    replicate_boundary_raster(&mut ub);
    replicate_boundary_raster(&mut vb);

    Ok(BasalFields { beta, ub, vb })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhysicalConstants;
    use crate::raster::CellStatus;

    fn coords(n: usize, d: f64) -> Vec<f64> {
        (0..n).map(|k| k as f64 * d).collect()
    }

    fn plane(nx: usize, ny: usize, d: f64, f: impl Fn(f64, f64) -> f64) -> Raster {
        let x = coords(nx, d);
        let y = coords(ny, d);
        let mut r = Raster::filled(x.clone(), y.clone(), 0.0).unwrap();
        for i in 0..ny {
            for j in 0..nx {
                r.set(i, j, f(x[j], y[i]));
            }
        }
        r
    }

    #[test]
    fn slope_of_a_plane_is_exact() {
        let s = plane(6, 5, 100.0, |x, y| 0.02 * x - 0.01 * y + 3.0);
        let (dsdx, dsdy) = surface_slope(&s);
        for i in 0..5 {
            for j in 0..6 {
                assert!((dsdx[[i, j]] - 0.02).abs() < 1.0e-12);
                assert!((dsdy[[i, j]] + 0.01).abs() < 1.0e-12);
            }
        }
    }

    #[test]
    fn slope_cap_preserves_direction() {
        let mut dsdx = Array2::zeros((4, 4));
        let mut dsdy = Array2::zeros((4, 4));
        dsdx[[1, 1]] = 3.0;
        dsdy[[1, 1]] = 4.0;
        let ds = cap_slope(&mut dsdx, &mut dsdy);
        // the outlier was clipped to the cap...
        assert!(ds[[1, 1]] < 5.0);
        // ...with its direction intact
        let ratio = dsdy[[1, 1]] / dsdx[[1, 1]];
        assert!((ratio - 4.0 / 3.0).abs() < 1.0e-12);
        assert!((dsdx[[1, 1]].hypot(dsdy[[1, 1]]) - ds[[1, 1]]).abs() < 1.0e-12);
    }

    #[test]
    fn sentinel_velocity_propagates_to_all_outputs() {
        let s = plane(6, 6, 100.0, |x, _| 1000.0 + 0.01 * x);
        let b = plane(6, 6, 100.0, |_, _| 0.0);
        let mut u = plane(6, 6, 100.0, |_, _| 300.0);
        let v = plane(6, 6, 100.0, |_, _| 0.0);
        u.set(2, 3, NO_DATA);

        let out =
            compute_basal_fields(&s, &b, &u, &v, 0.5, 0.015, &PhysicalConstants::default())
                .unwrap();
        assert_eq!(out.beta.get(2, 3), NO_DATA);
        assert_eq!(out.ub.get(2, 3), NO_DATA);
        assert_eq!(out.vb.get(2, 3), NO_DATA);
        assert_eq!(out.beta.status(2, 3), CellStatus::NoData);
        // neighbors with data still get real values
        assert!(out.beta.has_data(2, 2));
    }

    #[test]
    fn bed_above_surface_clamps_thickness() {
        // b > s everywhere: h = 0, q = 0, so the basal speed equals the
        // surface speed and nothing goes negative or NaN
        let s = plane(5, 5, 100.0, |_, _| 10.0);
        let b = plane(5, 5, 100.0, |_, _| 50.0);
        let u = plane(5, 5, 100.0, |_, _| 40.0);
        let v = plane(5, 5, 100.0, |_, _| 30.0);

        let out =
            compute_basal_fields(&s, &b, &u, &v, 0.5, 0.015, &PhysicalConstants::default())
                .unwrap();
        for i in 0..5 {
            for j in 0..5 {
                assert!(out.ub.get(i, j).is_finite());
                assert!((out.ub.get(i, j) - 40.0).abs() < 1.0e-9);
                assert!((out.vb.get(i, j) - 30.0).abs() < 1.0e-9);
                // q = 0 makes the raw beta zero; the floor takes over
                assert!((out.beta.get(i, j) - 0.015).abs() < 1.0e-12);
            }
        }
    }

    #[test]
    fn zero_speed_cell_does_not_divide() {
        let s = plane(5, 5, 100.0, |x, _| 500.0 + 0.05 * x);
        let b = plane(5, 5, 100.0, |_, _| 0.0);
        let mut u = plane(5, 5, 100.0, |_, _| 100.0);
        let mut v = plane(5, 5, 100.0, |_, _| 0.0);
        u.set(2, 2, 0.0);
        v.set(2, 2, 0.0);

        let out =
            compute_basal_fields(&s, &b, &u, &v, 0.5, 0.015, &PhysicalConstants::default())
                .unwrap();
        assert_eq!(out.ub.get(2, 2), 0.0);
        assert_eq!(out.vb.get(2, 2), 0.0);
        assert_eq!(out.beta.get(2, 2), 0.015);
    }

    #[test]
    fn sliding_is_slower_than_the_surface_and_aligned_with_it() {
        let s = plane(8, 8, 200.0, |x, y| 1200.0 + 0.04 * x + 0.01 * y);
        let b = plane(8, 8, 200.0, |_, _| 100.0);
        let u = plane(8, 8, 200.0, |_, _| 240.0);
        let v = plane(8, 8, 200.0, |_, _| -100.0);

        let out =
            compute_basal_fields(&s, &b, &u, &v, 0.5, 0.015, &PhysicalConstants::default())
                .unwrap();
        for i in 1..7 {
            for j in 1..7 {
                let sliding = out.ub.get(i, j).hypot(out.vb.get(i, j));
                let surface = 240.0_f64.hypot(-100.0);
                assert!(sliding > 0.0 && sliding <= surface + 1.0e-9);
                // same direction: components keep the surface ratio
                let ratio = out.vb.get(i, j) / out.ub.get(i, j);
                assert!((ratio - (-100.0 / 240.0)).abs() < 1.0e-9);
                assert!(out.beta.get(i, j) >= 0.015);
            }
        }
    }

    #[test]
    fn smoothing_pulls_a_spike_toward_its_neighbors() {
        let mut s = plane(5, 5, 100.0, |_, _| 10.0);
        s.set(2, 2, 90.0);
        smooth_surface(&mut s);
        assert!(s.get(2, 2) < 90.0);
        assert!(s.get(2, 2) > 10.0);
        // boundary is untouched
        assert_eq!(s.get(0, 0), 10.0);
    }
}
