//! Scan-by-scan retrieval pipeline
//!
//! [`ScanProcessor`] wires the pieces together and owns all inter-scan
//! state. One call per radar sweep:
//!
//! ```text
//!   raw I/Q ──► quality weighting ──► phase differences ──► adaptive fit
//!                                      │ vs previous scan     (dN/dt)
//!                                      └ vs calibration  ──► adaptive fit
//!                                                            (absolute N)
//!                                                 optional relaxation, then
//!                                                 valid-band masking ──► out
//! ```
//!
//! The first scan only primes the previous-scan buffer and yields no output.
//! A scan with no coherent signal fails with
//! [`DegenerateSlope`](crate::types::RefractError::DegenerateSlope) *after*
//! the buffer is updated, so the next scan still differences against it.
//! That next scan then finds a degenerate scan-to-scan field; it skips its
//! dN products (emitted all-masked) but retrieves N as usual, and the scan
//! after that has a full baseline again.
//!
//! Internally everything is `Option<f64>` / zero-vector "no data"; the
//! sentinel encoding (`-9999` invalid) exists only in the
//! [`ScanOutput::n_with_sentinels`] family of exporters, for callers that
//! feed legacy gridded-file writers.

use tracing::{debug, info, warn};

use crate::calib::CalibrationRef;
use crate::config::{GridGeometry, RefractParams};
use crate::phase_diff;
use crate::phase_fit::{weighted_mean_n, FitOutput, PhaseField, PhaseFitter};
use crate::polar_grid::PolarGrid;
use crate::quality::QualityEstimator;
use crate::relax::RelaxationDiffuser;
use crate::types::{Iq, RefractError, RefractResult, INVALID, VERY_LARGE};

/// One sweep of moments, all on the configured polar grid.
#[derive(Debug, Clone)]
pub struct ScanInput {
    /// Raw clutter I/Q per cell; `I = Q = 0` means no data.
    pub iq: PolarGrid<Iq>,
    /// Signal-to-noise ratio in dB; `None` where not measured.
    pub snr: PolarGrid<Option<f64>>,
    /// Secondary quality indicator (spectrum width in m/s, or CPA in
    /// `[0, 1]`, per the configured source); `None` where not measured.
    pub indicator: PolarGrid<Option<f64>>,
    /// Per-beam validity from the scan ingest (antenna transitions, missing
    /// rays). Invalid beams are masked wholesale in the output. `None`
    /// means all beams are usable.
    pub beam_valid: Option<Vec<bool>>,
}

/// Retrieval products for one sweep.
#[derive(Debug, Clone)]
pub struct ScanOutput {
    /// Refractivity; `None` where masked or never retrieved.
    pub n: PolarGrid<Option<f64>>,
    /// Refractivity error, capped at [`VERY_LARGE`].
    pub n_error: PolarGrid<f64>,
    /// Scan-to-scan refractivity change; `None` where masked.
    pub dn: PolarGrid<Option<f64>>,
    /// Error of the scan-to-scan change.
    pub dn_error: PolarGrid<f64>,
    /// Error-and-range-weighted mean N over the sweep.
    pub mean_n: Option<f64>,
    /// Error-and-range-weighted mean dN over the sweep.
    pub mean_dn: Option<f64>,
}

impl ScanOutput {
    /// N as a flat azimuth-major array with `None` encoded as [`INVALID`].
    pub fn n_with_sentinels(&self) -> Vec<f64> {
        sentinel_encode(&self.n)
    }

    /// dN as a flat azimuth-major array with `None` encoded as [`INVALID`].
    pub fn dn_with_sentinels(&self) -> Vec<f64> {
        sentinel_encode(&self.dn)
    }
}

fn sentinel_encode(grid: &PolarGrid<Option<f64>>) -> Vec<f64> {
    grid.as_slice().iter().map(|v| v.unwrap_or(INVALID)).collect()
}

/// The full retrieval pipeline for one radar configuration.
#[derive(Debug)]
pub struct ScanProcessor {
    geom: GridGeometry,
    params: RefractParams,
    calib: CalibrationRef,
    estimator: QualityEstimator,
    fitter: PhaseFitter,
    diffuser: RelaxationDiffuser,
    n_fit: FitOutput,
    dn_fit: FitOutput,
    prev_iq: Option<PolarGrid<Iq>>,
    scan_count: u64,
}

impl ScanProcessor {
    /// Build a processor; validates geometry and parameters up front so the
    /// per-scan path can assume them.
    pub fn new(
        geom: GridGeometry,
        params: RefractParams,
        calib: CalibrationRef,
    ) -> RefractResult<Self> {
        geom.validate()?;
        params.validate(&geom)?;
        let estimator = QualityEstimator::new(params.quality_source);
        let fitter = PhaseFitter::new(geom, params.r_min, params.min_consistency);
        let diffuser = RelaxationDiffuser::new(geom);
        Ok(Self {
            geom,
            params,
            calib,
            estimator,
            fitter,
            diffuser,
            n_fit: FitOutput::new(&geom),
            dn_fit: FitOutput::new(&geom),
            prev_iq: None,
            scan_count: 0,
        })
    }

    /// Process one sweep. Returns `Ok(None)` for the first scan (nothing to
    /// difference against yet), `Ok(Some(..))` afterwards.
    pub fn process_scan(&mut self, scan: ScanInput) -> RefractResult<Option<ScanOutput>> {
        if scan.iq.len() != self.geom.num_cells() {
            return Err(RefractError::GridMismatch {
                expected: self.geom.num_cells(),
                actual: scan.iq.len(),
            });
        }
        if let Some(mask) = &scan.beam_valid {
            if mask.len() != self.geom.num_beams {
                return Err(RefractError::GridMismatch {
                    expected: self.geom.num_beams,
                    actual: mask.len(),
                });
            }
        }
        self.scan_count += 1;
        let ScanInput {
            mut iq,
            snr,
            indicator,
            beam_valid,
        } = scan;

        let mut fields = self.estimator.estimate(&mut iq, &snr, &indicator, &self.calib)?;
        self.apply_blind_zone_and_floor(&mut iq, &mut fields.quality);

        let Some(prev) = self.prev_iq.take() else {
            debug!(scan = self.scan_count, "first scan, priming previous-scan buffer");
            self.prev_iq = Some(iq);
            return Ok(None);
        };

        let scan_diff = phase_diff::scan_to_scan(&iq, &prev)?;
        let ref_diff = phase_diff::to_reference(&iq, &self.calib)?;
        self.prev_iq = Some(iq);

        let dn_field = PhaseField {
            iq: &scan_diff.iq,
            quality: &scan_diff.quality,
            smooth_side_len_m: self.params.dn_smoothing_side_len_m,
            ref_n: 0.0,
        };
        // A degenerate scan-to-scan field (the previous scan was empty, or
        // nothing decorrelates coherently) only costs this scan's dN: the
        // buffer already holds the current scan, so the next one has a
        // fresh baseline, and the N retrieval below still runs.
        let dn_ok = match self.fitter.fit_phase_field(&dn_field, &mut self.dn_fit) {
            Ok(()) => true,
            Err(RefractError::DegenerateSlope) => {
                warn!(
                    scan = self.scan_count,
                    "scan-to-scan field degenerate, skipping dN until a new baseline"
                );
                false
            }
            Err(e) => return Err(e),
        };
        if dn_ok && self.params.do_relax {
            self.diffuser.relax(
                &mut self.dn_fit,
                0.0,
                self.params.dn_smoothing_side_len_m,
                self.params.r_min,
            );
            self.dn_fit.mean_n = weighted_mean_n(&self.dn_fit.n, &self.dn_fit.n_error);
        }

        let n_field = PhaseField {
            iq: &ref_diff.iq,
            quality: &ref_diff.quality,
            smooth_side_len_m: self.params.n_smoothing_side_len_m,
            ref_n: self.calib.reference_n(),
        };
        self.fitter.fit_phase_field(&n_field, &mut self.n_fit)?;
        if self.params.do_relax {
            self.diffuser.relax(
                &mut self.n_fit,
                self.calib.reference_n(),
                self.params.n_smoothing_side_len_m,
                self.params.r_min,
            );
            self.n_fit.mean_n = weighted_mean_n(&self.n_fit.n, &self.n_fit.n_error);
        }

        let beams = beam_valid.as_deref();
        let (min_n, max_n) = (self.params.min_n_value, self.params.max_n_value);
        let max_dn = self.params.max_dn_value;
        let (n, n_error) = self.masked(&self.n_fit, beams, |v| v >= min_n && v <= max_n);
        let (dn, dn_error, mean_dn) = if dn_ok {
            let (dn, dn_error) = self.masked(&self.dn_fit, beams, |v| v.abs() <= max_dn);
            (dn, dn_error, self.dn_fit.mean_n)
        } else {
            let nb = self.geom.num_beams;
            let ng = self.geom.num_gates;
            (
                PolarGrid::new(nb, ng, None),
                PolarGrid::new(nb, ng, VERY_LARGE),
                None,
            )
        };
        let out = ScanOutput {
            n,
            n_error,
            dn,
            dn_error,
            mean_n: self.n_fit.mean_n,
            mean_dn,
        };
        info!(
            scan = self.scan_count,
            mean_n = out.mean_n,
            mean_dn = out.mean_dn,
            "scan processed"
        );
        Ok(Some(out))
    }

    /// Zero out the blind zone around the radar and everything under the
    /// configured quality floor, so neither can enter a window sum.
    fn apply_blind_zone_and_floor(&self, iq: &mut PolarGrid<Iq>, quality: &mut PolarGrid<f64>) {
        let floor = self.params.quality_threshold;
        for az in 0..self.geom.num_beams {
            for r in 0..self.geom.num_gates {
                let q = quality.get_mut(az, r);
                if r < self.params.r_min || *q < floor {
                    *q = 0.0;
                    *iq.get_mut(az, r) = Iq::ZERO;
                }
            }
        }
    }

    /// Apply the beam-validity mask and valid band and, when relaxation is
    /// off, drop every cell the fit never accepted (relaxation is what makes
    /// unfitted cells meaningful).
    fn masked(
        &self,
        fit: &FitOutput,
        beam_valid: Option<&[bool]>,
        valid: impl Fn(f64) -> bool,
    ) -> (PolarGrid<Option<f64>>, PolarGrid<f64>) {
        let nb = self.geom.num_beams;
        let ng = self.geom.num_gates;
        let mut values = PolarGrid::new(nb, ng, None);
        let mut errors = PolarGrid::new(nb, ng, VERY_LARGE);
        for az in 0..nb {
            if beam_valid.is_some_and(|m| !m[az]) {
                continue;
            }
            for r in 0..ng {
                // Blind-zone gates stay masked even though a smoothing
                // window centred there can reach live data further out.
                if r < self.params.r_min {
                    continue;
                }
                let retrieved = self.params.do_relax || fit.phase_fit.get(az, r).is_some();
                let v = *fit.n.get(az, r);
                if retrieved && valid(v) {
                    *values.get_mut(az, r) = Some(v);
                }
                *errors.get_mut(az, r) = fit.n_error.get(az, r).min(VERY_LARGE);
            }
        }
        (values, errors)
    }
}
