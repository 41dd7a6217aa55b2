//! In-memory model for gridded scalar fields (DEMs, velocity grids) on a
//! regular grid with an explicit no-data convention.
//!
//! The persisted formats mark missing measurements with the value -2.0e+9.
//! Two further, more negative values are used transiently while classifying
//! missing points (see [crate::fixup]). All three are compared exactly, with
//! no epsilon, to match the upstream convention. To keep those comparisons
//! out of the algorithms, every cell also carries a [CellStatus] tag that is
//! updated in lockstep whenever a value is written through the raster API.

use ndarray::Array2;

use crate::error::{Error, Result};

/// Value marking a grid point with no measured data.
pub const NO_DATA: f64 = -2.0e+9;
/// Transient marker for points queued by the exterior flood fill.
pub const EXTERIOR_QUEUED: f64 = -3.0e+9;
/// Terminal marker for points confirmed to lie outside the glacier.
pub const EXTERIOR: f64 = -4.0e+9;

/// Per-cell classification, derived from the sentinel convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Carries a real measurement.
    Data,
    /// Missing data, not yet classified.
    NoData,
    /// Queued by the flood fill, confirmation pending.
    Queued,
    /// Confirmed exterior missing data.
    Exterior,
}

impl CellStatus {
    pub fn from_value(v: f64) -> CellStatus {
        if v == NO_DATA {
            CellStatus::NoData
        } else if v == EXTERIOR_QUEUED {
            CellStatus::Queued
        } else if v == EXTERIOR {
            CellStatus::Exterior
        } else {
            CellStatus::Data
        }
    }

    pub fn is_data(self) -> bool {
        self == CellStatus::Data
    }
}

/// A 2-D gridded scalar field with uniformly spaced, strictly increasing
/// coordinate vectors. `values` is indexed `[row = y index, col = x index]`.
#[derive(Debug, Clone)]
pub struct Raster {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    values: Array2<f64>,
    status: Array2<CellStatus>,
}

impl Raster {
    pub fn new(x: Vec<f64>, y: Vec<f64>, values: Array2<f64>) -> Result<Raster> {
        if values.nrows() != y.len() || values.ncols() != x.len() {
            return Err(Error::Domain(format!(
                "value grid is {}x{} but coordinates are {}x{}",
                values.nrows(),
                values.ncols(),
                y.len(),
                x.len()
            )));
        }
        if x.len() < 2 || y.len() < 2 {
            return Err(Error::Domain("raster needs at least 2x2 points".into()));
        }
        let status = values.map(|&v| CellStatus::from_value(v));
        Ok(Raster { x, y, values, status })
    }

    /// Raster of constant value on the given coordinate vectors.
    pub fn filled(x: Vec<f64>, y: Vec<f64>, value: f64) -> Result<Raster> {
        let values = Array2::from_elem((y.len(), x.len()), value);
        Raster::new(x, y, values)
    }

    pub fn nx(&self) -> usize {
        self.x.len()
    }

    pub fn ny(&self) -> usize {
        self.y.len()
    }

    pub fn dx(&self) -> f64 {
        self.x[1] - self.x[0]
    }

    pub fn dy(&self) -> f64 {
        self.y[1] - self.y[0]
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[[i, j]]
    }

    pub fn status(&self, i: usize, j: usize) -> CellStatus {
        self.status[[i, j]]
    }

    pub fn has_data(&self, i: usize, j: usize) -> bool {
        self.status[[i, j]].is_data()
    }

    /// Writes a value and keeps the status tag in sync with the sentinel
    /// convention.
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.values[[i, j]] = v;
        self.status[[i, j]] = CellStatus::from_value(v);
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Index of the cell whose lower-left corner is nearest below the point,
    /// i.e. `floor((coord - origin)/spacing)` on both axes.
    pub fn cell_index(&self, px: f64, py: f64) -> Result<(usize, usize)> {
        let j = ((px - self.x[0]) / self.dx()).floor();
        let i = ((py - self.y[0]) / self.dy()).floor();
        if i < 0.0 || j < 0.0 || i >= self.ny() as f64 || j >= self.nx() as f64 {
            return Err(Error::Domain(format!(
                "point ({}, {}) is outside the raster extent",
                px, py
            )));
        }
        Ok((i as usize, j as usize))
    }

    /// Point read by real coordinate (nearest-lower-index lookup).
    pub fn get_at(&self, px: f64, py: f64) -> Result<f64> {
        let (i, j) = self.cell_index(px, py)?;
        Ok(self.values[[i, j]])
    }

    /// Point write by real coordinate (nearest-lower-index lookup).
    pub fn set_at(&mut self, px: f64, py: f64, v: f64) -> Result<()> {
        let (i, j) = self.cell_index(px, py)?;
        self.set(i, j, v);
        Ok(())
    }

    /// Sub-raster over inclusive index ranges.
    pub fn crop(&self, imin: usize, imax: usize, jmin: usize, jmax: usize) -> Result<Raster> {
        if imax >= self.ny() || jmax >= self.nx() || imin > imax || jmin > jmax {
            return Err(Error::Domain(format!(
                "crop window rows {}..={} cols {}..={} exceeds {}x{} grid",
                imin,
                imax,
                jmin,
                jmax,
                self.ny(),
                self.nx()
            )));
        }
        let x = self.x[jmin..=jmax].to_vec();
        let y = self.y[imin..=imax].to_vec();
        let mut values = Array2::zeros((imax - imin + 1, jmax - jmin + 1));
        for i in imin..=imax {
            for j in jmin..=jmax {
                values[[i - imin, j - jmin]] = self.values[[i, j]];
            }
        }
        Raster::new(x, y, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn coords(n: usize, origin: f64, d: f64) -> Vec<f64> {
        (0..n).map(|k| origin + k as f64 * d).collect()
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let values = Array2::zeros((3, 4));
        assert!(Raster::new(coords(3, 0.0, 1.0), coords(3, 0.0, 1.0), values).is_err());
    }

    #[test]
    fn status_tracks_sentinels() {
        let values = arr2(&[[1.0, NO_DATA], [EXTERIOR, EXTERIOR_QUEUED]]);
        let r = Raster::new(coords(2, 0.0, 1.0), coords(2, 0.0, 1.0), values).unwrap();
        assert_eq!(r.status(0, 0), CellStatus::Data);
        assert_eq!(r.status(0, 1), CellStatus::NoData);
        assert_eq!(r.status(1, 0), CellStatus::Exterior);
        assert_eq!(r.status(1, 1), CellStatus::Queued);
    }

    #[test]
    fn set_keeps_status_in_sync() {
        let mut r = Raster::filled(coords(2, 0.0, 1.0), coords(2, 0.0, 1.0), 1.0).unwrap();
        r.set(0, 1, NO_DATA);
        assert_eq!(r.status(0, 1), CellStatus::NoData);
        r.set(0, 1, 5.0);
        assert_eq!(r.status(0, 1), CellStatus::Data);
    }

    #[test]
    fn coordinate_lookup_floors_and_rejects_out_of_bounds() {
        let r = Raster::filled(coords(4, 10.0, 2.0), coords(3, -5.0, 1.0), 0.0).unwrap();
        assert_eq!(r.cell_index(10.0, -5.0).unwrap(), (0, 0));
        assert_eq!(r.cell_index(13.9, -3.2).unwrap(), (1, 1));
        assert!(r.cell_index(9.9, -5.0).is_err());
        assert!(r.cell_index(10.0, -8.0).is_err());
        assert!(r.cell_index(1.0e6, 0.0).is_err());
    }

    #[test]
    fn crop_preserves_coordinates() {
        let values = arr2(&[[0.0, 1.0, 2.0], [3.0, 4.0, 5.0], [6.0, 7.0, 8.0]]);
        let r = Raster::new(coords(3, 0.0, 1.0), coords(3, 0.0, 1.0), values).unwrap();
        let c = r.crop(1, 2, 0, 1).unwrap();
        assert_eq!(c.ny(), 2);
        assert_eq!(c.nx(), 2);
        assert_eq!(c.get(0, 0), 3.0);
        assert_eq!(c.get(1, 1), 7.0);
        assert_eq!(c.y[0], 1.0);
    }
}
