//! Configuration for refractivity processing
//!
//! Two structs describe one radar setup:
//!
//! - [`GridGeometry`] — the fixed polar grid (beams, gates, gate spacing,
//!   wavelength), constant for a given radar configuration.
//! - [`RefractParams`] — tunable processing parameters (minimum range,
//!   consistency threshold, smoothing footprints, relaxation switch, output
//!   valid band).
//!
//! Both are serde-serializable so a caller can carry them in its own YAML or
//! TOML parameter file; `validate()` enforces the invariants the numeric core
//! assumes instead of checking them per call.
//!
//! ## Example
//!
//! ```
//! use refract_core::config::{GridGeometry, RefractParams};
//!
//! let geom = GridGeometry {
//!     num_beams: 360,
//!     num_gates: 100,
//!     gate_spacing_m: 150.0,
//!     wavelength_m: 0.1,
//! };
//! let params = RefractParams::default();
//! assert!(geom.validate().is_ok());
//! assert!(params.validate(&geom).is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{RefractError, RefractResult};

/// Source of the secondary per-cell quality indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitySource {
    /// Doppler spectrum width (m/s); wide spectra mean moving targets.
    SpectrumWidth,
    /// Clutter phase alignment in `[0, 1]`; high means stationary clutter.
    Cpa,
}

impl Default for QualitySource {
    fn default() -> Self {
        QualitySource::SpectrumWidth
    }
}

/// Fixed polar-grid geometry of one radar configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Number of azimuth samples over the full 360° sweep.
    pub num_beams: usize,
    /// Number of range gates per beam.
    pub num_gates: usize,
    /// Range gate spacing in metres.
    pub gate_spacing_m: f64,
    /// Radar wavelength in metres (e.g. 0.1 for S-band).
    pub wavelength_m: f64,
}

impl GridGeometry {
    /// Azimuthal spacing between consecutive beams, in degrees.
    #[inline]
    pub fn azim_spacing_deg(&self) -> f64 {
        360.0 / self.num_beams as f64
    }

    /// Total cell count.
    #[inline]
    pub fn num_cells(&self) -> usize {
        self.num_beams * self.num_gates
    }

    /// Check the geometry invariants the numeric core assumes.
    pub fn validate(&self) -> RefractResult<()> {
        if self.num_beams < 16 {
            return Err(RefractError::Config(format!(
                "num_beams = {} too small; the azimuth window clamp needs at least 16 beams",
                self.num_beams
            )));
        }
        if self.num_gates < 4 {
            return Err(RefractError::Config(format!(
                "num_gates = {} too small",
                self.num_gates
            )));
        }
        if !(self.gate_spacing_m > 0.0) {
            return Err(RefractError::Config(format!(
                "gate_spacing_m must be positive, got {}",
                self.gate_spacing_m
            )));
        }
        if !(self.wavelength_m > 0.0) {
            return Err(RefractError::Config(format!(
                "wavelength_m must be positive, got {}",
                self.wavelength_m
            )));
        }
        Ok(())
    }
}

/// Tunable processing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefractParams {
    /// First usable range gate; gates below it have quality forced to zero
    /// (blind zone around the radar).
    pub r_min: usize,
    /// Relative per-cell consistency threshold in `(0, 1)` used by the
    /// adaptive smoother's acceptance test.
    pub min_consistency: f64,
    /// Target physical footprint (metres) of the smoothing window for the
    /// absolute-N fit.
    pub n_smoothing_side_len_m: f64,
    /// Smoothing footprint (metres) for the scan-to-scan dN/dt fit.
    pub dn_smoothing_side_len_m: f64,
    /// Run the relaxation diffuser after each fit.
    pub do_relax: bool,
    /// Interpretation of the secondary quality indicator.
    pub quality_source: QualitySource,
    /// Quality floor below which a cell is treated as unusable.
    pub quality_threshold: f64,
    /// Lower edge of the physically valid N band; output outside it is
    /// masked. Near-surface refractivity sits in roughly 250–400 N-units.
    pub min_n_value: f64,
    /// Upper edge of the valid N band.
    pub max_n_value: f64,
    /// Magnitude bound for valid dN/dt output (N-units per scan interval).
    pub max_dn_value: f64,
}

impl Default for RefractParams {
    fn default() -> Self {
        Self {
            r_min: 4,
            min_consistency: 0.015,
            n_smoothing_side_len_m: 4000.0,
            dn_smoothing_side_len_m: 4000.0,
            do_relax: true,
            quality_source: QualitySource::default(),
            quality_threshold: 0.0,
            min_n_value: 200.0,
            max_n_value: 450.0,
            max_dn_value: 30.0,
        }
    }
}

impl RefractParams {
    /// Check parameter invariants against a geometry.
    pub fn validate(&self, geom: &GridGeometry) -> RefractResult<()> {
        if self.r_min >= geom.num_gates {
            return Err(RefractError::Config(format!(
                "r_min = {} must be below num_gates = {}",
                self.r_min, geom.num_gates
            )));
        }
        if !(self.min_consistency > 0.0 && self.min_consistency < 1.0) {
            return Err(RefractError::Config(format!(
                "min_consistency must be in (0, 1), got {}",
                self.min_consistency
            )));
        }
        for (name, len) in [
            ("n_smoothing_side_len_m", self.n_smoothing_side_len_m),
            ("dn_smoothing_side_len_m", self.dn_smoothing_side_len_m),
        ] {
            if !(len > 0.0) {
                return Err(RefractError::Config(format!(
                    "{name} must be positive, got {len}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.quality_threshold) {
            return Err(RefractError::Config(format!(
                "quality_threshold must be in [0, 1), got {}",
                self.quality_threshold
            )));
        }
        if self.min_n_value >= self.max_n_value {
            return Err(RefractError::Config(format!(
                "valid N band empty: [{}, {}]",
                self.min_n_value, self.max_n_value
            )));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> GridGeometry {
        GridGeometry {
            num_beams: 360,
            num_gates: 100,
            gate_spacing_m: 150.0,
            wavelength_m: 0.1,
        }
    }

    // -----------------------------------------------------------------------
    // 1. Defaults validate
    // -----------------------------------------------------------------------
    #[test]
    fn test_defaults_validate() {
        let g = geom();
        assert!(g.validate().is_ok());
        assert!(RefractParams::default().validate(&g).is_ok());
    }

    // -----------------------------------------------------------------------
    // 2. r_min past the grid is rejected
    // -----------------------------------------------------------------------
    #[test]
    fn test_r_min_out_of_range() {
        let g = geom();
        let mut p = RefractParams::default();
        p.r_min = 100;
        assert!(p.validate(&g).is_err());
    }

    // -----------------------------------------------------------------------
    // 3. Degenerate geometry is rejected
    // -----------------------------------------------------------------------
    #[test]
    fn test_bad_geometry() {
        let mut g = geom();
        g.gate_spacing_m = 0.0;
        assert!(g.validate().is_err());
        let mut g = geom();
        g.num_beams = 8;
        assert!(g.validate().is_err());
    }

    // -----------------------------------------------------------------------
    // 4. Empty valid band is rejected
    // -----------------------------------------------------------------------
    #[test]
    fn test_empty_valid_band() {
        let g = geom();
        let mut p = RefractParams::default();
        p.min_n_value = 450.0;
        p.max_n_value = 200.0;
        assert!(p.validate(&g).is_err());
    }

    // -----------------------------------------------------------------------
    // 5. Azimuth spacing
    // -----------------------------------------------------------------------
    #[test]
    fn test_azim_spacing() {
        assert!((geom().azim_spacing_deg() - 1.0).abs() < 1e-12);
    }
}
