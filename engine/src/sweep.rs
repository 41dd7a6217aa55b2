//! Regularization sweep support: runs the external inversion once per
//! regularization strength and collects the `(cost, model norm)` pair for
//! each, producing the data behind an L-curve plot.
//!
//! Each forward solve is a blocking subprocess call that can take hours,
//! so completed samples are appended to a cache file as they arrive and a
//! later run short-circuits to loading the cache. A failed sample is
//! logged and skipped; it never aborts the rest of the scan.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{info, warn};
use regex::Regex;

use crate::config::SolverConfig;
use crate::dem_io;
use crate::error::{Error, Result};
use crate::mesh::Triangulation;

/// One forward solve: which glacier, how strong a regularization, and
/// where the solver should leave its log and its basal friction output.
#[derive(Debug, Clone)]
pub struct InversionRequest {
    pub glacier: String,
    pub regularization: f64,
    pub max_iterations: u32,
    pub log_path: PathBuf,
    pub beta_path: PathBuf,
}

/// What a completed forward solve hands back to the sweep.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// Final value of the solver's cost functional.
    pub cost: f64,
    /// Inverted friction coefficient, one value per mesh vertex.
    pub beta: Vec<f64>,
}

/// The external inversion, seen from the sweep. Implementations are
/// expected to block until the solve finishes.
pub trait ForwardSolver {
    fn solve(&self, request: &InversionRequest) -> Result<SolveOutcome>;
}

/// Runs the solver binary under an MPI launcher, in the manner the
/// finite-element tool expects: a pointer file names the solver input, and
/// the glacier selector travels in the child's environment because the
/// tool has no way to accept it as an argument. Only the child process
/// sees that variable.
pub struct SubprocessSolver {
    config: SolverConfig,
    cost_re: Regex,
    num_vertices: usize,
}

impl SubprocessSolver {
    pub fn new(config: SolverConfig, num_vertices: usize) -> Result<SubprocessSolver> {
        let cost_re = Regex::new(&config.cost_pattern)
            .map_err(|e| Error::SolverInvocation(format!("bad cost pattern: {}", e)))?;
        Ok(SubprocessSolver {
            config,
            cost_re,
            num_vertices,
        })
    }

    /// Instantiates the solver input from its template: `{glacier}` in the
    /// template path expands to the title-cased glacier name, and
    /// `{regularization}` / `{max_iterations}` inside the file are replaced
    /// per sample. The pointer file then names the instantiated input.
    fn prepare_input(&self, request: &InversionRequest) -> Result<()> {
        let template = self
            .config
            .sif_template
            .replace("{glacier}", &title_case(&request.glacier));
        let text = fs::read_to_string(&template)?;
        let concrete = text
            .replace("{regularization}", &format!("{:e}", request.regularization))
            .replace("{max_iterations}", &request.max_iterations.to_string());

        let sif_path = request.log_path.with_extension("sif");
        fs::write(&sif_path, concrete)?;
        fs::write(&self.config.start_info, format!("{}\n", sif_path.display()))?;
        Ok(())
    }
}

impl ForwardSolver for SubprocessSolver {
    fn solve(&self, request: &InversionRequest) -> Result<SolveOutcome> {
        self.prepare_input(request)?;

        let log_file = File::create(&request.log_path)?;
        let err_file = log_file.try_clone()?;
        let mut child = Command::new(&self.config.mpirun)
            .arg("-n")
            .arg(self.config.partitions.to_string())
            .arg(&self.config.solver)
            .env(&self.config.glacier_env, &request.glacier)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file))
            .spawn()
            .map_err(|e| {
                Error::SolverInvocation(format!("could not spawn {}: {}", self.config.mpirun, e))
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if let Some(limit) = self.config.timeout {
                        if started.elapsed() > limit {
                            child.kill().ok();
                            child.wait().ok();
                            return Err(Error::SolverInvocation(format!(
                                "timed out after {:?} at lambda = {:e}",
                                limit, request.regularization
                            )));
                        }
                    }
                    thread::sleep(Duration::from_millis(250));
                }
            }
        };
        if !status.success() {
            return Err(Error::SolverInvocation(format!(
                "exit status {} at lambda = {:e}",
                status, request.regularization
            )));
        }

        let log_text = fs::read_to_string(&request.log_path)?;
        let cost = extract_cost(&log_text, &self.cost_re)?;
        let beta = dem_io::read_vertex_field(&request.beta_path, self.num_vertices)?;
        Ok(SolveOutcome { cost, beta })
    }
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Last cost value the solver printed. The regex must carry one capture
/// group; a log with no match means the solve did not converge to a
/// reportable cost and the sample is unusable.
pub fn extract_cost(log_text: &str, pattern: &Regex) -> Result<f64> {
    let mut cost = None;
    for cap in pattern.captures_iter(log_text) {
        if let Ok(v) = cap[1].parse::<f64>() {
            cost = Some(v);
        }
    }
    cost.ok_or_else(|| Error::SolverInvocation("no cost value in solver log".into()))
}

/// `integral |grad beta|^2 dA` over the mesh: the gradient is constant per
/// triangle, so midpoint quadrature is exact.
pub fn model_norm(tri: &Triangulation, beta: &[f64]) -> f64 {
    let mut norm = 0.0;
    for n in 0..tri.num_triangles() {
        let g = tri.gradient(n, beta);
        norm += tri.area(n) * (g[0] * g[0] + g[1] * g[1]);
    }
    norm
}

/// `count` log-spaced values between `10^min_exp` and `10^max_exp`,
/// endpoints included.
pub fn log_spaced(min_exp: f64, max_exp: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![10.0_f64.powf(min_exp)],
        _ => (0..count)
            .map(|k| {
                let e = min_exp + k as f64 * (max_exp - min_exp) / (count - 1) as f64;
                10.0_f64.powf(e)
            })
            .collect(),
    }
}

/// One point on the L-curve.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSample {
    pub cost: f64,
    pub model_norm: f64,
    pub lambda: f64,
}

/// Outcome of a sweep: the usable samples plus the parameters that failed
/// and why. Failed samples leave holes in the curve, never a bogus point.
#[derive(Debug)]
pub struct SweepReport {
    pub samples: Vec<SweepSample>,
    pub failures: Vec<(f64, String)>,
    pub started: DateTime<Utc>,
}

const CACHE_HEADER: &str = "cost,model_norm,lambda";

/// Loads a previously written cache file.
pub fn read_cache(path: &Path) -> Result<Vec<SweepSample>> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    match lines.next() {
        Some(h) if h.trim() == CACHE_HEADER => {}
        _ => return Err(Error::format(path, format!("missing '{}' header", CACHE_HEADER))),
    }
    let mut samples = Vec::new();
    for (k, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 3 {
            return Err(Error::format(path, format!("row {} has {} fields", k, fields.len())));
        }
        let parse = |t: &str| -> Result<f64> {
            t.trim()
                .parse::<f64>()
                .map_err(|_| Error::format(path, format!("bad number '{}' in row {}", t, k)))
        };
        samples.push(SweepSample {
            cost: parse(fields[0])?,
            model_norm: parse(fields[1])?,
            lambda: parse(fields[2])?,
        });
    }
    Ok(samples)
}

/// Sweeps the regularization parameter. If `cache_path` already exists the
/// solver is not invoked at all; otherwise each successful sample is
/// appended (and flushed) so partial progress survives an interrupted
/// scan.
pub fn run_sweep(
    solver: &dyn ForwardSolver,
    tri: &Triangulation,
    glacier: &str,
    lambdas: &[f64],
    max_iterations: u32,
    work_dir: &Path,
    cache_path: &Path,
) -> Result<SweepReport> {
    let started = Utc::now();

    if cache_path.exists() {
        let samples = read_cache(cache_path)?;
        info!(
            "loaded {} cached L-curve samples from {}",
            samples.len(),
            cache_path.display()
        );
        return Ok(SweepReport {
            samples,
            failures: Vec::new(),
            started,
        });
    }

    let mut cache = File::create(cache_path)?;
    writeln!(cache, "{}", CACHE_HEADER)?;

    let mut samples = Vec::new();
    let mut failures = Vec::new();

    for &lambda in lambdas {
        let request = InversionRequest {
            glacier: glacier.to_string(),
            regularization: lambda,
            max_iterations,
            log_path: work_dir.join(format!("{}_lambda-{:e}.txt", glacier, lambda)),
            beta_path: work_dir.join(format!("{}_beta-{:e}.dat", glacier, lambda)),
        };

        match solver.solve(&request) {
            Ok(outcome) => {
                if outcome.beta.len() != tri.num_vertices() {
                    failures.push((
                        lambda,
                        format!(
                            "{} beta values for {} vertices",
                            outcome.beta.len(),
                            tri.num_vertices()
                        ),
                    ));
                    continue;
                }
                let norm = model_norm(tri, &outcome.beta);
                info!(
                    "lambda = {:e}: cost = {:e}, model norm = {:e} ({})",
                    lambda,
                    outcome.cost,
                    norm,
                    started.format("%Y-%m-%d %H:%M:%S")
                );
                writeln!(cache, "{},{},{}", outcome.cost, norm, lambda)?;
                cache.flush()?;
                samples.push(SweepSample {
                    cost: outcome.cost,
                    model_norm: norm,
                    lambda,
                });
            }
            Err(e) => {
                warn!("sweep sample at lambda = {:e} failed: {}", lambda, e);
                failures.push((lambda, e.to_string()));
            }
        }
    }

    Ok(SweepReport {
        samples,
        failures,
        started,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn square() -> Triangulation {
        Triangulation::new(
            vec![0.0, 1.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0, 1.0],
            vec![[0, 1, 2], [0, 2, 3]],
            vec![1, 1, 1, 1],
        )
        .unwrap()
    }

    struct MockSolver {
        calls: Cell<usize>,
        fail_at: Option<f64>,
    }

    impl ForwardSolver for MockSolver {
        fn solve(&self, request: &InversionRequest) -> Result<SolveOutcome> {
            self.calls.set(self.calls.get() + 1);
            if Some(request.regularization) == self.fail_at {
                return Err(Error::SolverInvocation("simulated crash".into()));
            }
            Ok(SolveOutcome {
                cost: 1.0 / request.regularization,
                // beta = x at every vertex of the unit square
                beta: vec![0.0, 1.0, 1.0, 0.0],
            })
        }
    }

    #[test]
    fn log_spacing_hits_both_endpoints() {
        let v = log_spaced(-2.0, 2.0, 5);
        assert_eq!(v.len(), 5);
        assert!((v[0] - 0.01).abs() < 1.0e-12);
        assert!((v[2] - 1.0).abs() < 1.0e-12);
        assert!((v[4] - 100.0).abs() < 1.0e-9);
    }

    #[test]
    fn model_norm_of_a_linear_beta_is_the_domain_area() {
        let tri = square();
        // beta = x: |grad|^2 = 1 everywhere, integral over the unit square = 1
        let beta = vec![0.0, 1.0, 1.0, 0.0];
        assert!((model_norm(&tri, &beta) - 1.0).abs() < 1.0e-12);
        // constant beta has zero norm
        assert_eq!(model_norm(&tri, &[4.0; 4]), 0.0);
    }

    #[test]
    fn cost_extraction_takes_the_last_match() {
        let re = Regex::new(r"(?i)cost\s*[:=]\s*([-+0-9.eE]+)").unwrap();
        let log = "iter 1\nCost: 5.0E+02\nnoise\ncost = 2.5e+02\n";
        assert!((extract_cost(log, &re).unwrap() - 250.0).abs() < 1.0e-9);
        assert!(extract_cost("no numbers here", &re).is_err());
    }

    #[test]
    fn sweep_records_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("L_curve_data.txt");
        let solver = MockSolver {
            calls: Cell::new(0),
            fail_at: Some(1.0),
        };
        let tri = square();
        let lambdas = [0.1, 1.0, 10.0];

        let report =
            run_sweep(&solver, &tri, "helheim", &lambdas, 20, dir.path(), &cache).unwrap();
        assert_eq!(report.samples.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 1.0);
        assert_eq!(solver.calls.get(), 3);
        // the surviving samples carry the mock cost and the exact norm
        assert!((report.samples[0].cost - 10.0).abs() < 1.0e-12);
        assert!((report.samples[0].model_norm - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn existing_cache_short_circuits_the_solver() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("L_curve_data.txt");
        let tri = square();
        let lambdas = [0.1, 10.0];

        let first = MockSolver {
            calls: Cell::new(0),
            fail_at: None,
        };
        run_sweep(&first, &tri, "helheim", &lambdas, 20, dir.path(), &cache).unwrap();
        assert_eq!(first.calls.get(), 2);

        let second = MockSolver {
            calls: Cell::new(0),
            fail_at: None,
        };
        let report =
            run_sweep(&second, &tri, "helheim", &lambdas, 20, dir.path(), &cache).unwrap();
        assert_eq!(second.calls.get(), 0, "cache hit must not invoke the solver");
        assert_eq!(report.samples.len(), 2);
        assert!((report.samples[1].lambda - 10.0).abs() < 1.0e-12);
    }

    #[test]
    fn malformed_cache_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("L_curve_data.txt");
        fs::write(&cache, "lambda,cost\n1,2\n").unwrap();
        assert!(read_cache(&cache).is_err());

        fs::write(&cache, format!("{}\n1.0,2.0\n", CACHE_HEADER)).unwrap();
        assert!(read_cache(&cache).is_err());
    }
}
