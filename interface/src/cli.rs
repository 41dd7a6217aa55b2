extern crate iceflow_dem_engine;
#[macro_use]
extern crate clap;
use clap::{App, Arg, ArgMatches};

use std::path::{Path, PathBuf};

use iceflow_dem_engine::config::PipelineConfig;
use iceflow_dem_engine::dem_io;
use iceflow_dem_engine::error::Result;
use iceflow_dem_engine::interface;

arg_enum! {
    #[derive(Debug)]
    pub enum OpModes {
        MakeDems,
        FixupDem,
        MakeBeta,
        DrivingStress,
        MeshAreas,
        Postprocess,
        LCurve
    }
}

fn main() {
    env_logger::init();

    let matches = App::new("Glacier DEM preparation")
        .version("1.0")
        .author("Peter Q. Lee <pqjlee@uwaterloo.ca>")
        .about("Prepares glacier data sets for ice-flow inversions.

Reads satellite velocity grids and surface/bed elevation models, fills
the gaps in them, derives initial guesses for the basal sliding velocity
and friction coefficient, sizes mesh refinement by ice speed, and
post-processes the forward solver's output into diagnostic stress maps
and L-curve data.
")
        .arg(Arg::with_name("OpMode")
             .help("Operational mode.


MakeDems:
  Builds UDEM.xy/VDEM.xy from raw binary velocity grids (--vx/--vy
  stems), despeckling, cropping to the measured footprint, and filling
  interior gaps.

FixupDem:
  Classifies and gap-fills a single DEM file (-i) in place.

MakeBeta:
  Derives betaDEM.xy, UBDEM.xy and VBDEM.xy for a glacier directory
  (-g) from the velocity and elevation DEMs it contains.

DrivingStress:
  Writes a gridded driving-stress map (-o) for a glacier directory.

MeshAreas:
  Writes the .area file sizing a refinement of the preliminary mesh
  (-m) by local ice speed.

Postprocess:
  Projects per-vertex solver output (-e directory) on a mesh (-m) onto
  a regular grid and writes stress and speed maps at the output stem
  (-o).

LCurve:
  Runs the external inversion over log-spaced regularization strengths
  (-r min_exp,max_exp,count) and records (cost, model norm) per sample.

")
             .required(true)
             .possible_values(&OpModes::variants()))
        .arg(Arg::with_name("glacier")
             .short("g")
             .value_name("DIR")
             .help("Glacier data directory")
             .required(false))
        .arg(Arg::with_name("config")
             .short("c")
             .value_name("Config")
             .help("Configuration file for constants and solver settings")
             .required(false))
        .arg(Arg::with_name("input")
             .short("i")
             .value_name("FILE")
             .help("Input DEM file for FixupDem")
             .required(false))
        .arg(Arg::with_name("radius")
             .short("d")
             .value_name("CELLS")
             .help("Gap-fill window radius in cells")
             .required(false))
        .arg(Arg::with_name("fraction")
             .short("f")
             .value_name("FRAC")
             .help("Fraction of the driving stress supported by basal shear stress, e.g. 0.5, 0.75, 0.001")
             .required(false))
        .arg(Arg::with_name("mesh")
             .short("m")
             .value_name("STEM")
             .help("Triangle mesh file stem, e.g. meshes/helheim/helheim.1")
             .required(false))
        .arg(Arg::with_name("output")
             .short("o")
             .value_name("PATH")
             .help("Output file or stem")
             .required(false))
        .arg(Arg::with_name("length")
             .short("l")
             .value_name("METERS")
             .help("Target edge length for refined elements")
             .required(false))
        .arg(Arg::with_name("spacing")
             .short("s")
             .value_name("METERS")
             .help("Grid spacing for Postprocess output")
             .required(false))
        .arg(Arg::with_name("fields")
             .short("e")
             .value_name("DIR")
             .help("Directory of per-vertex solver field files")
             .required(false))
        .arg(Arg::with_name("range")
             .short("r")
             .value_name("MIN,MAX,N")
             .help("L-curve exponent range and sample count, e.g. 8,12,9")
             .required(false))
        .arg(Arg::with_name("vx")
             .long("vx")
             .value_name("STEM")
             .help("Raw x-velocity stem (binary + .geodat sidecar)")
             .required(false))
        .arg(Arg::with_name("vy")
             .long("vy")
             .value_name("STEM")
             .help("Raw y-velocity stem (binary + .geodat sidecar)")
             .required(false))
        .get_matches();

    let opmode: OpModes = value_t!(matches.value_of("OpMode"), OpModes).unwrap_or_else(|e| e.exit());

    let mut config = match matches.value_of("config") {
        Some(s) => match PipelineConfig::parse_config(s) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Could not parse config {}", e);
                std::process::exit(1);
            }
        },
        None => PipelineConfig::default(),
    };
    if let Some(f) = matches.value_of("fraction") {
        config.basal.frac = parse_or_exit(f, "fraction");
    }
    if let Some(d) = matches.value_of("radius") {
        config.basal.fill_radius = parse_or_exit(d, "radius");
    }

    let result = match opmode {
        OpModes::MakeDems => make_dems(&matches, &config),
        OpModes::FixupDem => fixup_dem(&matches, &config),
        OpModes::MakeBeta => interface::make_basal_dems(Path::new(req(&matches, "glacier")), &config),
        OpModes::DrivingStress => driving_stress(&matches, &config),
        OpModes::MeshAreas => mesh_areas(&matches, &config),
        OpModes::Postprocess => postprocess(&matches, &config),
        OpModes::LCurve => l_curve(&matches, &config),
    };

    if let Err(e) = result {
        eprintln!("An error occurred. No output: {}", e);
        std::process::exit(1);
    }
}

fn req<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    match matches.value_of(name) {
        Some(v) => v,
        None => {
            eprintln!("Missing required argument for this mode: {}", name);
            std::process::exit(1);
        }
    }
}

fn parse_or_exit<T: std::str::FromStr>(s: &str, what: &str) -> T {
    match s.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("Could not parse {} value '{}'", what, s);
            std::process::exit(1);
        }
    }
}

fn make_dems(matches: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let vx = Path::new(req(matches, "vx"));
    let vy = Path::new(req(matches, "vy"));
    let out_dir = Path::new(req(matches, "glacier"));
    interface::make_velocity_dems(vx, vy, out_dir, config)
}

fn fixup_dem(matches: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let path = Path::new(req(matches, "input"));
    interface::fixup_dem_file(path, config.basal.fill_radius, true).map(|_| ())
}

fn driving_stress(matches: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let dir = Path::new(req(matches, "glacier"));
    let out = Path::new(req(matches, "output"));
    interface::make_driving_stress_grid(dir, out, config)
}

fn mesh_areas(matches: &ArgMatches, _config: &PipelineConfig) -> Result<()> {
    let mesh = Path::new(req(matches, "mesh"));
    let dir = Path::new(req(matches, "glacier"));
    let dx: f64 = matches
        .value_of("length")
        .map(|s| parse_or_exit(s, "length"))
        .unwrap_or(250.0);
    interface::make_refinement_areas(mesh, dir, dx)
}

fn postprocess(matches: &ArgMatches, _config: &PipelineConfig) -> Result<()> {
    let mesh = Path::new(req(matches, "mesh"));
    let fields_dir = Path::new(req(matches, "fields"));
    let out_stem = PathBuf::from(req(matches, "output"));
    let spacing: f64 = matches
        .value_of("spacing")
        .map(|s| parse_or_exit(s, "spacing"))
        .unwrap_or(100.0);

    let tri = dem_io::read_triangle_mesh(mesh)?;
    let fields = interface::SolutionFields::read(fields_dir, tri.num_vertices())?;
    interface::postprocess_solution(&tri, &fields, &out_stem, spacing)
}

fn l_curve(matches: &ArgMatches, config: &PipelineConfig) -> Result<()> {
    let mesh = Path::new(req(matches, "mesh"));
    let dir = PathBuf::from(req(matches, "glacier"));
    let range = req(matches, "range");
    let parts: Vec<&str> = range.split(',').collect();
    if parts.len() != 3 {
        eprintln!("Range should be min_exp,max_exp,count, e.g. 8,12,9");
        std::process::exit(1);
    }
    let min_exp: f64 = parse_or_exit(parts[0], "range");
    let max_exp: f64 = parse_or_exit(parts[1], "range");
    let count: usize = parse_or_exit(parts[2], "range");

    let glacier = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "glacier".to_string());

    let tri = dem_io::read_triangle_mesh(mesh)?;
    let cache = dir.join("L_curve_data.txt");
    let report = interface::run_lcurve(
        config, &tri, &glacier, min_exp, max_exp, count, &dir, &cache,
    )?;

    println!("lambda, cost, model norm");
    for sample in &report.samples {
        println!("{:e} {:e} {:e}", sample.lambda, sample.cost, sample.model_norm);
    }
    for (lambda, why) in &report.failures {
        println!("lambda {:e} failed: {}", lambda, why);
    }
    Ok(())
}
