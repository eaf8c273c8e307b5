//! Coherent phase differencing
//!
//! Builds the two phase-difference fields the smoother consumes:
//!
//! - **Scan-to-scan** (`cur · conj(prev)`): the phase drift since the last
//!   scan, whose range-derivative yields dN/dt.
//! - **Reference** (`cur · conj(calib_avg)`): the absolute phase relative to
//!   the calibration period, whose range-derivative yields N itself.
//!
//! The scan-to-scan product is renormalized by a soft non-linear scale,
//! `(I² + Q²)^0.375`, chosen empirically to suppress very strong returns
//! without losing weak-signal resolution; its residual magnitude is the
//! coherence of the pair and converts to a phase-error estimate. The
//! reference product is normalized by the calibration vector's magnitude so
//! the current scan's quality weighting is what remains.
//!
//! Each field carries its own quality grid, the residual magnitude of the
//! difference vector: `(q_prev · q_cur)^0.25` for the scan pair, the current
//! scan's quality for the reference product. This, not the single-scan
//! quality estimate, is what the smoother weighs the field by, so cells
//! where the other half of the product is missing (no previous-scan data, a
//! zero calibration vector) carry zero weight.
//!
//! A zero vector anywhere in the chain propagates "no data" (`None` phase,
//! zero I/Q) rather than manufacturing a spurious angle.

use crate::calib::CalibrationRef;
use crate::polar_grid::PolarGrid;
use crate::types::{Iq, RefractError, RefractResult, DEG_TO_RAD, VERY_LARGE};

/// Soft normalization exponent applied to `|diff|²`.
const DIFF_NORM_EXPONENT: f64 = 0.375;

/// Scan-to-scan phase difference field with its coherence-derived error.
#[derive(Debug, Clone)]
pub struct ScanDiff {
    /// Normalized difference vectors; magnitude is pair coherence.
    pub iq: PolarGrid<Iq>,
    /// Phase difference in degrees; `None` where either scan had no data.
    pub phase: PolarGrid<Option<f64>>,
    /// Error estimate in degrees; [`VERY_LARGE`] where undefined.
    pub error: PolarGrid<f64>,
    /// Pair coherence `(q_prev · q_cur)^0.25`; the quality the smoother
    /// weighs this field by. Zero where either scan had no data.
    pub quality: PolarGrid<f64>,
}

/// Phase relative to the calibration reference.
#[derive(Debug, Clone)]
pub struct RefDiff {
    /// Difference vectors normalized by the calibration magnitude.
    pub iq: PolarGrid<Iq>,
    /// Absolute phase in degrees; `None` where undefined.
    pub phase: PolarGrid<Option<f64>>,
    /// Current-scan quality surviving the product; zero wherever the
    /// calibration vector itself is zero.
    pub quality: PolarGrid<f64>,
}

/// Compute the scan-to-scan phase difference field.
///
/// Both grids must be quality-weighted current/previous I/Q of the same
/// shape.
pub fn scan_to_scan(
    current: &PolarGrid<Iq>,
    previous: &PolarGrid<Iq>,
) -> RefractResult<ScanDiff> {
    if !current.same_shape(previous) {
        return Err(RefractError::GridMismatch {
            expected: current.len(),
            actual: previous.len(),
        });
    }
    let (nb, ng) = (current.num_beams(), current.num_gates());
    let mut iq = PolarGrid::new(nb, ng, Iq::ZERO);
    let mut phase = PolarGrid::new(nb, ng, None);
    let mut error = PolarGrid::new(nb, ng, VERY_LARGE);
    let mut quality = PolarGrid::new(nb, ng, 0.0);

    for az in 0..nb {
        for r in 0..ng {
            let diff = current.get(az, r).conj_mul(*previous.get(az, r));
            let norm = diff.norm_sqr().powf(DIFF_NORM_EXPONENT);
            if norm == 0.0 {
                continue;
            }
            *phase.get_mut(az, r) = diff.phase_deg();
            let scaled = diff.scale(1.0 / norm);
            *quality.get_mut(az, r) = scaled.norm();
            *iq.get_mut(az, r) = scaled;
            // norm <= 1 for quality-weighted inputs; clamp guards rounding.
            let coh = norm.min(1.0 - f64::EPSILON);
            *error.get_mut(az, r) =
                ((-2.0 * coh.ln() / coh).sqrt() / DEG_TO_RAD).min(VERY_LARGE);
        }
    }
    Ok(ScanDiff {
        iq,
        phase,
        error,
        quality,
    })
}

/// Compute the phase difference against the calibration reference.
pub fn to_reference(
    current: &PolarGrid<Iq>,
    calib: &CalibrationRef,
) -> RefractResult<RefDiff> {
    let (nb, ng) = (current.num_beams(), current.num_gates());
    let mut iq = PolarGrid::new(nb, ng, Iq::ZERO);
    let mut phase = PolarGrid::new(nb, ng, None);
    let mut quality = PolarGrid::new(nb, ng, 0.0);

    for az in 0..nb {
        for r in 0..ng {
            let avg = calib.avg_iq(az, r);
            let diff = current.get(az, r).conj_mul(avg);
            if diff.is_zero() {
                continue;
            }
            *phase.get_mut(az, r) = diff.phase_deg();
            let norm = avg.norm();
            let scaled = if norm > 0.0 {
                diff.scale(1.0 / norm)
            } else {
                diff
            };
            *quality.get_mut(az, r) = scaled.norm();
            *iq.get_mut(az, r) = scaled;
        }
    }
    Ok(RefDiff { iq, phase, quality })
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridGeometry;

    const BEAMS: usize = 36;
    const GATES: usize = 8;

    fn grid_at(deg: f64, mag: f64) -> PolarGrid<Iq> {
        PolarGrid::new(BEAMS, GATES, Iq::from_phase_deg(deg).scale(mag))
    }

    fn calib_at(deg: f64) -> CalibrationRef {
        let geom = GridGeometry {
            num_beams: BEAMS,
            num_gates: GATES,
            gate_spacing_m: 150.0,
            wavelength_m: 0.1,
        };
        CalibrationRef::new(
            &geom,
            PolarGrid::new(BEAMS, GATES, Iq::from_phase_deg(deg).scale(2.0)),
            PolarGrid::new(BEAMS, GATES, 10.0),
            300.0,
        )
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // 1. Scan-to-scan recovers the injected phase step
    // -----------------------------------------------------------------------
    #[test]
    fn test_scan_diff_phase() {
        let prev = grid_at(20.0, 0.8);
        let cur = grid_at(65.0, 0.8);
        let d = scan_to_scan(&cur, &prev).unwrap();
        let p = d.phase.get(3, 3).unwrap();
        assert!((p - 45.0).abs() < 1e-9, "expected 45, got {p}");
        assert!(*d.error.get(3, 3) < VERY_LARGE);
    }

    // -----------------------------------------------------------------------
    // 2. Soft normalization: |diff| = (|raw|²)^0.375 divides out
    // -----------------------------------------------------------------------
    #[test]
    fn test_scan_diff_soft_norm() {
        let prev = grid_at(0.0, 0.5);
        let cur = grid_at(30.0, 0.5);
        let d = scan_to_scan(&cur, &prev).unwrap();
        let raw_sq = 0.25f64 * 0.25; // |cur·conj(prev)|²
        let expect = (0.25) / raw_sq.powf(DIFF_NORM_EXPONENT);
        assert!((d.iq.get(0, 0).norm() - expect).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // 3. Zero vectors propagate "no data"
    // -----------------------------------------------------------------------
    #[test]
    fn test_zero_propagates_invalid() {
        let mut prev = grid_at(0.0, 1.0);
        *prev.get_mut(2, 2) = Iq::ZERO;
        let cur = grid_at(10.0, 1.0);
        let d = scan_to_scan(&cur, &prev).unwrap();
        assert!(d.phase.get(2, 2).is_none());
        assert!(d.iq.get(2, 2).is_zero());
        assert_eq!(*d.error.get(2, 2), VERY_LARGE);
    }

    // -----------------------------------------------------------------------
    // 4. Reference difference is the absolute phase
    // -----------------------------------------------------------------------
    #[test]
    fn test_reference_diff() {
        let cur = grid_at(100.0, 0.9);
        let cal = calib_at(40.0);
        let d = to_reference(&cur, &cal).unwrap();
        let p = d.phase.get(0, 0).unwrap();
        assert!((p - 60.0).abs() < 1e-9, "expected 60, got {p}");
        // Normalized by |calib| = 2, magnitude should equal current quality.
        assert!((d.iq.get(0, 0).norm() - 0.9).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // 5. Shape mismatch is reported
    // -----------------------------------------------------------------------
    #[test]
    fn test_shape_mismatch() {
        let a = PolarGrid::new(BEAMS, GATES, Iq::ZERO);
        let b = PolarGrid::new(BEAMS, GATES + 1, Iq::ZERO);
        assert!(scan_to_scan(&a, &b).is_err());
    }

    // -----------------------------------------------------------------------
    // 6. Quality grids are the product coherences, not the input qualities
    // -----------------------------------------------------------------------
    #[test]
    fn test_quality_is_product_coherence() {
        let prev = grid_at(10.0, 0.9);
        let cur = grid_at(40.0, 0.8);
        let d = scan_to_scan(&cur, &prev).unwrap();
        // |cur·conj(prev)| / (|cur·conj(prev)|²)^0.375 = (q_prev·q_cur)^0.25
        let expect = (0.9f64 * 0.8).powf(0.25);
        assert!((d.quality.get(5, 5) - expect).abs() < 1e-9);

        let rd = to_reference(&cur, &calib_at(40.0)).unwrap();
        assert!((rd.quality.get(5, 5) - 0.8).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // 7. A zero calibration vector zeroes the reference-field quality
    // -----------------------------------------------------------------------
    #[test]
    fn test_zero_calib_zero_quality() {
        let geom = GridGeometry {
            num_beams: BEAMS,
            num_gates: GATES,
            gate_spacing_m: 150.0,
            wavelength_m: 0.1,
        };
        let mut avg = PolarGrid::new(BEAMS, GATES, Iq::from_phase_deg(40.0).scale(2.0));
        *avg.get_mut(7, 3) = Iq::ZERO;
        let cal = CalibrationRef::new(
            &geom,
            avg,
            PolarGrid::new(BEAMS, GATES, 10.0),
            300.0,
        )
        .unwrap();
        let cur = grid_at(100.0, 0.8);
        let rd = to_reference(&cur, &cal).unwrap();
        assert_eq!(*rd.quality.get(7, 3), 0.0);
        assert!(rd.phase.get(7, 3).is_none());
        assert!(*rd.quality.get(7, 4) > 0.0);
    }
}
