//! High-level entry points tying the pipeline stages together, one per
//! driver operation: clean up a DEM file, build velocity DEMs from raw
//! binary grids, derive the basal fields, emit diagnostic stress maps,
//! size a mesh refinement, project a solution back onto a grid, and run
//! the regularization sweep.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::Array2;

use crate::basal::{compute_basal_fields, smooth_surface};
use crate::config::{PhysicalConstants, PipelineConfig};
use crate::dem_io;
use crate::error::{Error, Result};
use crate::fixup::{despeckle, fixup, EdgeTopology, FillOutcome, MergeMode};
use crate::mesh::{
    linear_interpolate, refinement_areas, resample, sample_to_vertices, TriFinder, Triangulation,
};
use crate::raster::Raster;
use crate::stress::{
    basal_shear_stress, basal_stress_power, driving_stress, driving_stress_power,
};
use crate::sweep::{log_spaced, run_sweep, SubprocessSolver, SweepReport};

/// Classifies and gap-fills a DEM file in place (or next to it as
/// `<name>.fixup` when `overwrite` is false). The cleaned grid is merged
/// with the original through the maximum so no real measurement is lost.
pub fn fixup_dem_file(path: &Path, d: usize, overwrite: bool) -> Result<FillOutcome> {
    let q = dem_io::read_dem(path)?;
    let (fixed, outcome) = fixup(&q, (0, 0), d, EdgeTopology::Toroidal, MergeMode::MaxWithOriginal);

    let fixup_path = PathBuf::from(format!("{}.fixup", path.display()));
    dem_io::write_dem(&fixup_path, &fixed)?;
    if overwrite {
        fs::rename(&fixup_path, path)?;
    }
    info!(
        "fixed up {}: {} gaps filled, {} left",
        path.display(),
        outcome.filled,
        outcome.unfilled.len()
    );
    Ok(outcome)
}

/// Builds `UDEM.xy`/`VDEM.xy` for a glacier from the raw binary velocity
/// grids: despeckle, crop to the measured footprint plus a margin of two
/// cells, write, then classify and gap-fill both files.
pub fn make_velocity_dems(
    vx_stem: &Path,
    vy_stem: &Path,
    out_dir: &Path,
    config: &PipelineConfig,
) -> Result<()> {
    let mut vx = dem_io::read_geodat(vx_stem)?;
    let mut vy = dem_io::read_geodat(vy_stem)?;

    // each grid is cleaned only if it has gaps of its own
    if has_gaps(&vx) {
        despeckle(&mut vx, config.despeckle);
    }
    if has_gaps(&vy) {
        despeckle(&mut vy, config.despeckle);
    }

    let (imin, imax, jmin, jmax) = data_window(&vx, 2)?;
    let vx = vx.crop(imin, imax, jmin, jmax)?;
    let vy = vy.crop(imin, imax, jmin, jmax)?;

    let u_path = out_dir.join("UDEM.xy");
    let v_path = out_dir.join("VDEM.xy");
    dem_io::write_dem(&u_path, &vx)?;
    dem_io::write_dem(&v_path, &vy)?;

    fixup_dem_file(&u_path, config.basal.fill_radius, true)?;
    fixup_dem_file(&v_path, config.basal.fill_radius, true)?;
    Ok(())
}

fn has_gaps(q: &Raster) -> bool {
    (0..q.ny()).any(|i| (0..q.nx()).any(|j| !q.has_data(i, j)))
}

/// Bounding box of the cells carrying data, grown by `margin` and clamped
/// to the grid.
fn data_window(q: &Raster, margin: usize) -> Result<(usize, usize, usize, usize)> {
    let mut imin = usize::max_value();
    let mut imax = 0;
    let mut jmin = usize::max_value();
    let mut jmax = 0;
    for i in 0..q.ny() {
        for j in 0..q.nx() {
            if q.has_data(i, j) {
                imin = imin.min(i);
                imax = imax.max(i);
                jmin = jmin.min(j);
                jmax = jmax.max(j);
            }
        }
    }
    if imin > imax {
        return Err(Error::Domain("velocity grid has no valid data".into()));
    }
    Ok((
        imin.saturating_sub(margin),
        (imax + margin).min(q.ny() - 1),
        jmin.saturating_sub(margin),
        (jmax + margin).min(q.nx() - 1),
    ))
}

/// Derives `betaDEM.xy`, `UBDEM.xy`, `VBDEM.xy` for a glacier directory
/// holding `UDEM.xy`, `VDEM.xy`, `zsDEM.xy`, `zbDEM.xy`. Does nothing if
/// all three outputs already exist.
pub fn make_basal_dems(glacier_dir: &Path, config: &PipelineConfig) -> Result<()> {
    let beta_path = glacier_dir.join("betaDEM.xy");
    let ub_path = glacier_dir.join("UBDEM.xy");
    let vb_path = glacier_dir.join("VBDEM.xy");
    if beta_path.exists() && ub_path.exists() && vb_path.exists() {
        info!("basal fields in {} are already made", glacier_dir.display());
        return Ok(());
    }

    let u = dem_io::read_dem(&glacier_dir.join("UDEM.xy"))?;
    let v = dem_io::read_dem(&glacier_dir.join("VDEM.xy"))?;
    let mut s = dem_io::read_dem(&glacier_dir.join("zsDEM.xy"))?;
    let b = dem_io::read_dem(&glacier_dir.join("zbDEM.xy"))?;

    smooth_surface(&mut s);

    // elevations live on their own grid; bring them to the velocity grid
    let s = resample(&s, &u.x, &u.y)?;
    let b = resample(&b, &u.x, &u.y)?;

    let fields = compute_basal_fields(
        &s,
        &b,
        &u,
        &v,
        config.basal.frac,
        config.basal.beta_floor,
        &config.constants,
    )?;

    dem_io::write_dem(&beta_path, &fields.beta)?;
    dem_io::write_dem(&ub_path, &fields.ub)?;
    dem_io::write_dem(&vb_path, &fields.vb)?;
    info!("done computing basal fields for {}", glacier_dir.display());
    Ok(())
}

/// Gridded driving-stress map for a glacier directory, written in the
/// Arc/Info ASCII format.
pub fn make_driving_stress_grid(
    glacier_dir: &Path,
    out_path: &Path,
    config: &PipelineConfig,
) -> Result<()> {
    let mut s = dem_io::read_dem(&glacier_dir.join("zsDEM.xy"))?;
    let b = dem_io::read_dem(&glacier_dir.join("zbDEM.xy"))?;

    smooth_surface(&mut s);
    let b = resample(&b, &s.x, &s.y)?;
    let tau = driving_stress(&s, &b, &config.constants)?;

    dem_io::write_qgis(out_path, &tau, s.x[0], s.y[0], s.dx(), dem_io::GRID_NO_DATA)?;
    info!("done writing driving stress to {}", out_path.display());
    Ok(())
}

/// Ice speed grid from the velocity DEMs: zero wherever the measurements
/// are missing, so refinement sizing treats unmeasured ice as slow.
pub fn speed_raster(glacier_dir: &Path) -> Result<Raster> {
    let u = dem_io::read_dem(&glacier_dir.join("UDEM.xy"))?;
    let v = dem_io::read_dem(&glacier_dir.join("VDEM.xy"))?;
    let mut speed = Raster::filled(u.x.clone(), u.y.clone(), 0.0)?;
    for i in 0..u.ny() {
        for j in 0..u.nx() {
            if u.has_data(i, j) {
                speed.set(i, j, u.get(i, j).hypot(v.get(i, j)));
            }
        }
    }
    Ok(speed)
}

/// Sizes a refinement of the preliminary mesh by local ice speed and
/// writes the `.area` file the mesh generator reads next to the mesh.
pub fn make_refinement_areas(mesh_stem: &Path, glacier_dir: &Path, dx: f64) -> Result<()> {
    let tri = dem_io::read_triangle_mesh(mesh_stem)?;
    let speed = speed_raster(glacier_dir)?;
    let areas = refinement_areas(&tri, &speed, dx)?;
    let area_path = PathBuf::from(format!("{}.area", mesh_stem.display()));
    dem_io::write_area_file(&area_path, &areas)?;
    info!("wrote {} element areas to {}", areas.len(), area_path.display());
    Ok(())
}

/// Per-vertex solution fields handed back by the forward solver.
#[derive(Debug)]
pub struct SolutionFields {
    pub beta: Vec<f64>,
    pub uxb: Vec<f64>,
    pub uyb: Vec<f64>,
    pub uxs: Vec<f64>,
    pub uys: Vec<f64>,
}

impl SolutionFields {
    /// Reads the five per-vertex field files `beta.dat`, `uxb.dat`,
    /// `uyb.dat`, `uxs.dat`, `uys.dat` from a directory.
    pub fn read(dir: &Path, num_vertices: usize) -> Result<SolutionFields> {
        let field = |name: &str| dem_io::read_vertex_field(&dir.join(name), num_vertices);
        Ok(SolutionFields {
            beta: field("beta.dat")?,
            uxb: field("uxb.dat")?,
            uyb: field("uyb.dat")?,
            uxs: field("uxs.dat")?,
            uys: field("uys.dat")?,
        })
    }
}

/// Projects solver output onto a regular grid and writes basal shear
/// stress, basal speed, and surface speed maps (`<stem>_taub.txt`,
/// `<stem>_ub.txt`, `<stem>_us.txt`). Grid nodes outside the mesh keep
/// the no-data fill; that is the expected case near the domain edge, not
/// an error.
pub fn postprocess_solution(
    tri: &Triangulation,
    fields: &SolutionFields,
    out_stem: &Path,
    spacing: f64,
) -> Result<()> {
    let xmin = spacing * (tri.x.iter().cloned().fold(f64::INFINITY, f64::min) / spacing).floor();
    let xmax = spacing * (tri.x.iter().cloned().fold(f64::NEG_INFINITY, f64::max) / spacing).ceil();
    let ymin = spacing * (tri.y.iter().cloned().fold(f64::INFINITY, f64::min) / spacing).floor();
    let ymax = spacing * (tri.y.iter().cloned().fold(f64::NEG_INFINITY, f64::max) / spacing).ceil();

    let nx = ((xmax - xmin) / spacing) as usize + 1;
    let ny = ((ymax - ymin) / spacing) as usize + 1;

    let mut tau = Array2::from_elem((ny, nx), dem_io::GRID_NO_DATA);
    let mut ub = Array2::from_elem((ny, nx), dem_io::GRID_NO_DATA);
    let mut us = Array2::from_elem((ny, nx), dem_io::GRID_NO_DATA);

    let finder = TriFinder::new(tri);
    for i in 0..ny {
        let py = ymin + i as f64 * spacing;
        for j in 0..nx {
            let px = xmin + j as f64 * spacing;
            let beta = match linear_interpolate(tri, &finder, &fields.beta, px, py) {
                Some(v) => v,
                None => continue,
            };
            let uxb = linear_interpolate(tri, &finder, &fields.uxb, px, py).unwrap_or(0.0);
            let uyb = linear_interpolate(tri, &finder, &fields.uyb, px, py).unwrap_or(0.0);
            let uxs = linear_interpolate(tri, &finder, &fields.uxs, px, py).unwrap_or(0.0);
            let uys = linear_interpolate(tri, &finder, &fields.uys, px, py).unwrap_or(0.0);

            ub[[i, j]] = uxb.hypot(uyb);
            us[[i, j]] = uxs.hypot(uys);
            // beta^2 u in MPa, reported in kPa
            tau[[i, j]] = 1000.0 * beta * beta * ub[[i, j]];
        }
    }

    let write = |suffix: &str, data: &Array2<f64>| -> Result<()> {
        let path = PathBuf::from(format!("{}{}", out_stem.display(), suffix));
        dem_io::write_qgis(&path, data, xmin, ymin, spacing, dem_io::GRID_NO_DATA)
    };
    write("_taub.txt", &tau)?;
    write("_ub.txt", &ub)?;
    write("_us.txt", &us)?;
    Ok(())
}

/// Power balance of a solution: total power dissipated against basal
/// friction versus total power input by the driving stress. For a
/// self-consistent inversion the ratio is the fraction of the driving
/// stress the bed supports.
pub fn stress_balance(
    tri: &Triangulation,
    beta: &[f64],
    uxb: &[f64],
    uyb: &[f64],
    uxh: &[f64],
    uyh: &[f64],
    surf: &Raster,
    bed: &Raster,
    constants: &PhysicalConstants,
) -> Result<(f64, f64)> {
    let (tau_x, tau_y) = basal_shear_stress(beta, uxb, uyb);
    let s = sample_to_vertices(surf, tri)?;
    let b = sample_to_vertices(bed, tri)?;
    let basal = basal_stress_power(tri, uxb, uyb, &tau_x, &tau_y);
    let driving = driving_stress_power(tri, uxh, uyh, &s, &b, constants);
    Ok((basal, driving))
}

/// Runs the L-curve sweep over `count` log-spaced regularization strengths
/// between `10^min_exp` and `10^max_exp`.
pub fn run_lcurve(
    config: &PipelineConfig,
    tri: &Triangulation,
    glacier: &str,
    min_exp: f64,
    max_exp: f64,
    count: usize,
    work_dir: &Path,
    cache_path: &Path,
) -> Result<SweepReport> {
    let solver = SubprocessSolver::new(config.solver.clone(), tri.num_vertices())?;
    let lambdas = log_spaced(min_exp, max_exp, count);
    run_sweep(
        &solver,
        tri,
        glacier,
        &lambdas,
        config.solver.max_iterations,
        work_dir,
        cache_path,
    )
}
