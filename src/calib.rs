//! Calibration reference container
//!
//! The calibration reference is produced offline by a separate workflow (a
//! multi-hour target-reliability scoring pass over clutter returns) and is
//! read-only for this crate. It provides, per cell, the average I/Q vector of
//! the reference period and the phase error observed during calibration, plus
//! one scalar: the surface refractivity that held while the reference was
//! recorded. The absolute-N retrieval is always *relative to* this reference.

use crate::config::GridGeometry;
use crate::polar_grid::PolarGrid;
use crate::types::{Iq, RefractError, RefractResult};

/// Read-only calibration reference for one radar configuration.
#[derive(Debug, Clone)]
pub struct CalibrationRef {
    avg_iq: PolarGrid<Iq>,
    phase_error: PolarGrid<f64>,
    reference_n: f64,
}

impl CalibrationRef {
    /// Build a reference, checking that both fields match the geometry.
    pub fn new(
        geom: &GridGeometry,
        avg_iq: PolarGrid<Iq>,
        phase_error: PolarGrid<f64>,
        reference_n: f64,
    ) -> RefractResult<Self> {
        for len in [avg_iq.len(), phase_error.len()] {
            if len != geom.num_cells() {
                return Err(RefractError::GridMismatch {
                    expected: geom.num_cells(),
                    actual: len,
                });
            }
        }
        Ok(Self {
            avg_iq,
            phase_error,
            reference_n,
        })
    }

    /// Average reference I/Q at a cell.
    #[inline]
    pub fn avg_iq(&self, az: usize, r: usize) -> Iq {
        *self.avg_iq.get(az, r)
    }

    /// Calibration-time phase error (degrees) at a cell.
    #[inline]
    pub fn phase_error(&self, az: usize, r: usize) -> f64 {
        *self.phase_error.get(az, r)
    }

    /// Surface refractivity of the reference period.
    #[inline]
    pub fn reference_n(&self) -> f64 {
        self.reference_n
    }
}
