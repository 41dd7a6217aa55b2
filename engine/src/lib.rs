//! Backbone engine for glacier DEM preparation and ice-flow inversion
//! support: reads satellite velocity and elevation grids, reconstructs
//! their missing points, derives initial guesses for the basal sliding
//! parameters, sizes mesh refinement by ice speed, and post-processes
//! forward-solver output into diagnostic stress fields and L-curve data.
//! Main entry points are within the [interface] and [sweep] modules.

extern crate ndarray;

pub mod error;
pub mod config;
pub mod raster;
pub mod dem_io;
pub mod fixup;
pub mod basal;
pub mod mesh;
pub mod stress;
pub mod sweep;
pub mod interface;
