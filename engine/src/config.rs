//! Run configuration: physical constants, basal-solver tuning, and the
//! external solver invocation settings. Everything here is plain data,
//! constructed once and passed down explicitly; nothing reads process-wide
//! state.

use std::path::PathBuf;
use std::time::Duration;

use configparser::ini::Ini;

use crate::error::{Error, Result};
use crate::fixup::DespeckleThresholds;

/// Physical constants for the shallow-ice closure.
///
/// The solver works in the "MPa-year" unit system the forward model
/// expects: stresses in megapascals, lengths in meters, time in years.
/// The fields below are stored in SI and converted by the accessor
/// methods, so the year-vs-second convention lives in exactly one place.
#[derive(Debug, Clone)]
pub struct PhysicalConstants {
    /// Ice density, kg m^-3.
    pub rho_ice: f64,
    /// Gravitational acceleration, m s^-2.
    pub gravity: f64,
    /// Seconds per year.
    pub year_in_sec: f64,
    /// Glen's-law prefactor, Pa^-3 s^-1.
    pub a0: f64,
    /// Creep activation energy, J mol^-1.
    pub activation_energy: f64,
    /// Ice column temperature, K.
    pub temperature: f64,
    /// Universal gas constant, J mol^-1 K^-1.
    pub gas_constant: f64,
}

impl Default for PhysicalConstants {
    fn default() -> PhysicalConstants {
        PhysicalConstants {
            rho_ice: 917.0,
            gravity: 9.81,
            year_in_sec: 365.25 * 24.0 * 60.0 * 60.0,
            a0: 3.985e-13,
            activation_energy: 6.0e4,
            temperature: 273.0 - 13.0,
            gas_constant: 8.3144,
        }
    }
}

impl PhysicalConstants {
    /// Ice density in MPa a^2 m^-2.
    pub fn rho(&self) -> f64 {
        self.rho_ice * 1.0e-6 / self.year_in_sec.powi(2)
    }

    /// Gravity in m a^-2.
    pub fn g(&self) -> f64 {
        self.gravity * self.year_in_sec.powi(2)
    }

    /// Glen's-law rate factor at the configured temperature via the
    /// Arrhenius relation, in MPa^-3 a^-1.
    pub fn arrhenius(&self) -> f64 {
        let a0 = self.a0 * self.year_in_sec * 1.0e18;
        a0 * (-self.activation_energy / (self.gas_constant * self.temperature)).exp()
    }

    /// rho * g in kPa m^-1, for driving-stress maps in kilopascals.
    pub fn rho_g_kpa(&self) -> f64 {
        1.0e-3 * self.rho_ice * self.gravity
    }
}

/// Tuning for the basal field solver and the gap filling ahead of it.
#[derive(Debug, Clone)]
pub struct BasalConfig {
    /// Fraction of the driving stress assumed to be supported by basal
    /// drag.
    pub frac: f64,
    /// Smallest admissible friction coefficient.
    pub beta_floor: f64,
    /// Half-window radius, in cells, for inverse-distance gap filling.
    pub fill_radius: usize,
}

impl Default for BasalConfig {
    fn default() -> BasalConfig {
        BasalConfig {
            frac: 0.5,
            beta_floor: 0.015,
            fill_radius: 12,
        }
    }
}

/// Invocation settings for the external finite-element solver.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// MPI launcher binary.
    pub mpirun: String,
    /// Solver binary handed to the launcher.
    pub solver: String,
    /// Number of mesh partitions / MPI ranks.
    pub partitions: u32,
    /// Environment variable the solver's user procedures read the glacier
    /// name from. Set on the child process only.
    pub glacier_env: String,
    /// Pointer file the solver reads its input file name from.
    pub start_info: PathBuf,
    /// Solver input template path; `{glacier}` in the path expands to the
    /// title-cased glacier name, and `{regularization}` /
    /// `{max_iterations}` inside the file are filled in per run.
    pub sif_template: String,
    /// Regex with one capture group extracting the cost value from the
    /// solver log; the last match wins.
    pub cost_pattern: String,
    /// Maximum iterations for the optimization procedure.
    pub max_iterations: u32,
    /// Kill the solver after this long; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for SolverConfig {
    fn default() -> SolverConfig {
        SolverConfig {
            mpirun: "mpirun".into(),
            solver: "ElmerSolver_mpi".into(),
            partitions: 4,
            glacier_env: "glacier".into(),
            start_info: PathBuf::from("ELMERSOLVER_STARTINFO"),
            sif_template: "elmer/Robin_Beta_{glacier}.sif".into(),
            cost_pattern: r"(?i)cost\s*[:=]\s*([-+0-9.eE]+)".into(),
            max_iterations: 35,
            timeout: None,
        }
    }
}

/// Everything a pipeline run needs, loadable from an ini file.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub constants: PhysicalConstants,
    pub basal: BasalConfig,
    pub despeckle: DespeckleThresholds,
    pub solver: SolverConfig,
}

macro_rules! load_float {
    ($ini:expr, $path:expr, $sec:expr, $key:expr, $field:expr) => {
        match $ini.getfloat($sec, $key) {
            Ok(Some(v)) => $field = v,
            Ok(None) => {}
            Err(e) => return Err(Error::format($path, e)),
        }
    };
}

macro_rules! load_uint {
    ($ini:expr, $path:expr, $sec:expr, $key:expr, $field:expr, $ty:ty) => {
        match $ini.getint($sec, $key) {
            Ok(Some(v)) if v >= 0 => $field = v as $ty,
            Ok(Some(v)) => {
                return Err(Error::format($path, format!("{} must not be negative, got {}", $key, v)))
            }
            Ok(None) => {}
            Err(e) => return Err(Error::format($path, e)),
        }
    };
}

impl PipelineConfig {
    /// Reads overrides from an ini file; keys that are absent keep their
    /// defaults. Sections: `[physics]`, `[basal]`, `[despeckle]`,
    /// `[solver]`.
    pub fn parse_config(path: &str) -> Result<PipelineConfig> {
        let mut ini = Ini::new();
        ini.load(path).map_err(|e| Error::format(path, e))?;

        let mut c = PipelineConfig::default();

        load_float!(ini, path, "physics", "rho_ice", c.constants.rho_ice);
        load_float!(ini, path, "physics", "gravity", c.constants.gravity);
        load_float!(ini, path, "physics", "year_in_sec", c.constants.year_in_sec);
        load_float!(ini, path, "physics", "a0", c.constants.a0);
        load_float!(ini, path, "physics", "activation_energy", c.constants.activation_energy);
        load_float!(ini, path, "physics", "temperature", c.constants.temperature);
        load_float!(ini, path, "physics", "gas_constant", c.constants.gas_constant);

        load_float!(ini, path, "basal", "frac", c.basal.frac);
        load_float!(ini, path, "basal", "beta_floor", c.basal.beta_floor);
        load_uint!(ini, path, "basal", "fill_radius", c.basal.fill_radius, usize);

        load_uint!(ini, path, "despeckle", "cardinal_fill", c.despeckle.cardinal_fill, usize);
        load_uint!(ini, path, "despeckle", "isolated_max", c.despeckle.isolated_max, usize);
        load_uint!(ini, path, "despeckle", "required_of_eight", c.despeckle.required_of_eight, usize);

        if let Some(v) = ini.get("solver", "mpirun") {
            c.solver.mpirun = v;
        }
        if let Some(v) = ini.get("solver", "solver") {
            c.solver.solver = v;
        }
        load_uint!(ini, path, "solver", "partitions", c.solver.partitions, u32);
        if let Some(v) = ini.get("solver", "glacier_env") {
            c.solver.glacier_env = v;
        }
        if let Some(v) = ini.get("solver", "start_info") {
            c.solver.start_info = PathBuf::from(v);
        }
        if let Some(v) = ini.get("solver", "sif_template") {
            c.solver.sif_template = v;
        }
        if let Some(v) = ini.get("solver", "cost_pattern") {
            c.solver.cost_pattern = v;
        }
        load_uint!(ini, path, "solver", "max_iterations", c.solver.max_iterations, u32);
        match ini.getint("solver", "timeout_secs") {
            Ok(Some(v)) if v > 0 => c.solver.timeout = Some(Duration::from_secs(v as u64)),
            Ok(Some(v)) => {
                return Err(Error::format(path, format!("timeout_secs must be positive, got {}", v)))
            }
            Ok(None) => {}
            Err(e) => return Err(Error::format(path, e)),
        }

        if c.basal.frac <= 0.0 || c.basal.frac >= 1.0 {
            return Err(Error::format(
                path,
                format!("frac must lie in (0, 1), got {}", c.basal.frac),
            ));
        }

        Ok(c)
    }
}
