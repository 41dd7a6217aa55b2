//! Error taxonomy for the DEM preparation pipeline.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A coordinate or index fell outside the raster or mesh it refers to.
    #[error("domain error: {0}")]
    Domain(String),

    /// Interior gap cells with no real data inside the fill radius.
    /// Recoverable; callers decide whether a partly filled grid is usable.
    #[error("{count} interior gap(s) had no data within the fill radius")]
    MissingData { count: usize },

    /// The external forward solver failed, timed out, or produced output
    /// we could not parse a cost value from.
    #[error("solver invocation failed: {0}")]
    SolverInvocation(String),

    /// A persisted raster, polygon or mesh file is malformed.
    /// Always fatal at load time; there is no partial parsing.
    #[error("malformed file {}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn format<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Error {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
