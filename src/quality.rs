//! Quality estimation and I/Q weighting
//!
//! Converts per-cell signal-to-noise ratio plus a secondary indicator
//! (Doppler spectrum width or clutter-phase-alignment) into a fuzzy `[0, 1]`
//! quality weight, derives the expected phase error from that weight, and
//! rescales the raw I/Q vector to the weight so that every downstream vector
//! sum is automatically quality-weighted.
//!
//! ## Quality model
//!
//! - Base quality from SNR: `q = 1 / (1 + 10^(-0.1·SNR))` — a logistic ramp
//!   that reaches 0.5 at 0 dB. Cells with no SNR measurement fall back to a
//!   neutral 0.5.
//! - Spectrum width correction: `q *= exp(-(w / W_T)^k)` — a fuzzy threshold
//!   at `W_T` m/s; wide spectra mean the target moves and its phase is
//!   useless for refractivity.
//! - CPA correction: `q *= cpa` directly (already a `[0, 1]` stationarity
//!   score).
//! - Expected phase error: `sqrt(-2·ln(q) / q)` radians, the standard error
//!   of the phase of a unit vector observed with coherence `q`.
//!
//! A cell whose measured error comes out *better* than the calibration's own
//! error at that cell is suspect: at far range that usually means anomalous
//! propagation ducting (echoes from targets that are not the calibrated
//! clutter), so the cell is sharply down-weighted; elsewhere the cell is
//! simply capped at its calibration baseline.

use crate::calib::CalibrationRef;
use crate::config::QualitySource;
use crate::polar_grid::PolarGrid;
use crate::types::{Iq, RefractError, RefractResult, DEG_TO_RAD, VERY_LARGE};

/// Fuzzy spectrum-width threshold in m/s.
const WIDTH_THRESHOLD: f64 = 5.0;

/// Steepness of the spectrum-width fuzzy threshold.
const ABRUPT_FACTOR: f64 = 2.0;

/// Base quality used when the SNR measurement is missing.
const SNR_FALLBACK_QUALITY: f64 = 0.5;

/// Down-weight applied to suspected anomalous-propagation cells.
const AP_FACTOR: f64 = 0.04;

/// Quality above which a better-than-calibration far-range cell is treated
/// as anomalous propagation rather than capped at the calibration baseline.
const AP_QUALITY_BAR: f64 = 0.85;

/// Per-cell quality and expected phase error produced by the estimator.
#[derive(Debug, Clone)]
pub struct QualityFields {
    /// Quality weight in `[0, 1]`; 0 means unusable.
    pub quality: PolarGrid<f64>,
    /// Expected phase error in degrees; [`VERY_LARGE`] for unusable cells.
    pub phase_error: PolarGrid<f64>,
}

/// Quality estimator for one scan.
#[derive(Debug, Clone)]
pub struct QualityEstimator {
    source: QualitySource,
}

impl QualityEstimator {
    /// Create an estimator reading the secondary indicator as `source`.
    pub fn new(source: QualitySource) -> Self {
        Self { source }
    }

    /// Estimate quality for a scan and rescale `iq` to the quality weight in
    /// place.
    ///
    /// `snr` is in dB; `indicator` is spectrum width in m/s or CPA in
    /// `[0, 1]` depending on the configured source; `None` entries mean the
    /// measurement is missing. Rescaling is a no-op on zero vectors, so "no
    /// data" cells stay that way, and applying the estimator to an
    /// already-weighted field with the same inputs changes nothing (the
    /// weight is a target magnitude, not a multiplier).
    pub fn estimate(
        &self,
        iq: &mut PolarGrid<Iq>,
        snr: &PolarGrid<Option<f64>>,
        indicator: &PolarGrid<Option<f64>>,
        calib: &CalibrationRef,
    ) -> RefractResult<QualityFields> {
        for len in [snr.len(), indicator.len()] {
            if len != iq.len() {
                return Err(RefractError::GridMismatch {
                    expected: iq.len(),
                    actual: len,
                });
            }
        }
        let num_beams = iq.num_beams();
        let num_gates = iq.num_gates();
        let mut quality = PolarGrid::new(num_beams, num_gates, 0.0f64);
        let mut phase_error = PolarGrid::new(num_beams, num_gates, VERY_LARGE);

        for az in 0..num_beams {
            for r in 0..num_gates {
                let mut q = match *snr.get(az, r) {
                    Some(snr_db) => 1.0 / (1.0 + 10f64.powf(-0.1 * snr_db)),
                    None => SNR_FALLBACK_QUALITY,
                };
                if let Some(ind) = *indicator.get(az, r) {
                    q *= match self.source {
                        QualitySource::SpectrumWidth => {
                            (-(ind / WIDTH_THRESHOLD).powf(ABRUPT_FACTOR)).exp()
                        }
                        QualitySource::Cpa => ind.clamp(0.0, 1.0),
                    };
                }

                let calib_err = calib.phase_error(az, r);
                let mut err = if q > 0.0 && calib_err < VERY_LARGE {
                    phase_error_from_quality(q)
                } else {
                    q = 0.0;
                    VERY_LARGE
                };

                // A cell cannot legitimately beat its own calibration. At far
                // range that pattern is the signature of anomalous
                // propagation; elsewhere the calibration baseline is simply
                // the floor.
                if err < calib_err {
                    if r >= num_gates / 2 && q > AP_QUALITY_BAR {
                        q *= AP_FACTOR;
                        err = phase_error_from_quality(q);
                    } else {
                        err = calib_err;
                    }
                }

                *quality.get_mut(az, r) = q;
                *phase_error.get_mut(az, r) = err;
                let cell = iq.get_mut(az, r);
                *cell = cell.with_norm(q);
            }
        }

        Ok(QualityFields {
            quality,
            phase_error,
        })
    }
}

/// Expected phase error, in degrees, of a phase measured with coherence `q`.
fn phase_error_from_quality(q: f64) -> f64 {
    if q <= 0.0 {
        return VERY_LARGE;
    }
    if q >= 1.0 {
        return 0.0;
    }
    ((-2.0 * q.ln() / q).sqrt() / DEG_TO_RAD).min(VERY_LARGE)
}
