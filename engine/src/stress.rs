//! Diagnostic stress fields: gridded driving stress from the DEMs, basal
//! shear stress from an inverted friction coefficient, and the power
//! integrals used to check the overall stress balance of a solution.

use ndarray::Array2;

use crate::config::PhysicalConstants;
use crate::dem_io::GRID_NO_DATA;
use crate::error::{Error, Result};
use crate::mesh::Triangulation;
use crate::raster::Raster;

/// Driving stress magnitude `rho g h |grad s|` in kPa on interior cells;
/// the border keeps the map no-data fill. The surface is assumed gap-free
/// here (run the fixup stage first).
pub fn driving_stress(s: &Raster, b: &Raster, constants: &PhysicalConstants) -> Result<Array2<f64>> {
    check_same_grid(s, b)?;
    let ny = s.ny();
    let nx = s.nx();
    let dx = s.dx();
    let dy = s.dy();
    let rho_g = constants.rho_g_kpa();

    let mut tau = Array2::from_elem((ny, nx), GRID_NO_DATA);
    for i in 1..ny - 1 {
        for j in 1..nx - 1 {
            let dsdx = 0.5 * (s.get(i, j + 1) - s.get(i, j - 1)) / dx;
            let dsdy = 0.5 * (s.get(i + 1, j) - s.get(i - 1, j)) / dy;
            let h = (s.get(i, j) - b.get(i, j)).max(0.0);
            tau[[i, j]] = rho_g * h * dsdx.hypot(dsdy);
        }
    }
    Ok(tau)
}

/// Signed driving stress components `-rho g h ds/dx` (resp. y), kPa, on
/// interior cells where the surface carries data at the point and its four
/// cardinal neighbors.
pub fn signed_driving_stress(
    s: &Raster,
    b: &Raster,
    constants: &PhysicalConstants,
) -> Result<(Array2<f64>, Array2<f64>)> {
    check_same_grid(s, b)?;
    let ny = s.ny();
    let nx = s.nx();
    let dx = s.dx();
    let dy = s.dy();
    let rho_g = constants.rho_g_kpa();

    let mut taudx = Array2::from_elem((ny, nx), GRID_NO_DATA);
    let mut taudy = Array2::from_elem((ny, nx), GRID_NO_DATA);
    for i in 1..ny - 1 {
        for j in 1..nx - 1 {
            let guarded = s.has_data(i, j)
                && s.has_data(i + 1, j)
                && s.has_data(i - 1, j)
                && s.has_data(i, j + 1)
                && s.has_data(i, j - 1);
            if !guarded {
                continue;
            }
            let h = s.get(i, j) - b.get(i, j);
            taudx[[i, j]] = -0.5 * rho_g * h * (s.get(i, j + 1) - s.get(i, j - 1)) / dx;
            taudy[[i, j]] = -0.5 * rho_g * h * (s.get(i + 1, j) - s.get(i - 1, j)) / dy;
        }
    }
    Ok((taudx, taudy))
}

fn check_same_grid(s: &Raster, b: &Raster) -> Result<()> {
    if s.ny() != b.ny() || s.nx() != b.nx() {
        return Err(Error::Domain(format!(
            "surface is {}x{} but bed is {}x{}",
            s.ny(),
            s.nx(),
            b.ny(),
            b.nx()
        )));
    }
    Ok(())
}

/// Basal shear stress components per vertex from the sliding law
/// `tau = -beta^2 * u`.
pub fn basal_shear_stress(beta: &[f64], u: &[f64], v: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let tau_x = beta.iter().zip(u.iter()).map(|(&b, &u)| -b * b * u).collect();
    let tau_y = beta.iter().zip(v.iter()).map(|(&b, &v)| -b * b * v).collect();
    (tau_x, tau_y)
}

/// `f . (B g)` with the P1 element mass matrix
/// `B = a * [[1/6,1/12,1/12],[1/12,1/6,1/12],[1/12,1/12,1/6]]`.
fn mass_dot(a: f64, f: [f64; 3], g: [f64; 3]) -> f64 {
    let diag = f[0] * g[0] + f[1] * g[1] + f[2] * g[2];
    let cross = f[0] * (g[1] + g[2]) + f[1] * (g[0] + g[2]) + f[2] * (g[0] + g[1]);
    a * (diag / 6.0 + cross / 12.0)
}

fn elem(q: &[f64], t: [usize; 3]) -> [f64; 3] {
    [q[t[0]], q[t[1]], q[t[2]]]
}

/// Total power dissipated against basal friction,
/// `integral(tau . u) dA` over the triangulation.
pub fn basal_stress_power(
    tri: &Triangulation,
    u: &[f64],
    v: &[f64],
    tau_x: &[f64],
    tau_y: &[f64],
) -> f64 {
    let mut power = 0.0;
    for (n, &t) in tri.triangles.iter().enumerate() {
        let a = tri.area(n);
        power += mass_dot(a, elem(u, t), elem(tau_x, t)) + mass_dot(a, elem(v, t), elem(tau_y, t));
    }
    power
}

/// Total power input by the driving stress,
/// `-integral(rho g h grad s . u) dA` over the triangulation, with the
/// surface gradient taken per element.
pub fn driving_stress_power(
    tri: &Triangulation,
    u: &[f64],
    v: &[f64],
    s: &[f64],
    b: &[f64],
    constants: &PhysicalConstants,
) -> f64 {
    let rho_g = constants.rho_ice * constants.gravity;
    let h: Vec<f64> = s.iter().zip(b.iter()).map(|(&s, &b)| s - b).collect();

    let mut power = 0.0;
    for (n, &t) in tri.triangles.iter().enumerate() {
        let a = tri.area(n);
        let ds = tri.gradient(n, s);
        let he = elem(&h, t);
        power -= rho_g * (ds[0] * mass_dot(a, elem(u, t), he) + ds[1] * mass_dot(a, elem(v, t), he));
    }
    power
}
