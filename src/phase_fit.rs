//! Adaptive phase smoothing and refractivity derivation (the PhaseFit core)
//!
//! Ground-clutter phase is noisy and wraps every 360°, yet refractivity is
//! its *range derivative*: a retrieval is only as good as the de-aliased,
//! smoothed phase field it starts from. This module fits such a field to a
//! phase-difference map, very carefully and very gradually:
//!
//! 1. Anchor slopes are estimated by a pulse-pair method — an initial slope
//!    over the first few kilometres with a wide azimuth smear, and a
//!    whole-sweep average slope with a narrower smear.
//! 2. Going out in range, each cell is smoothed over a window whose physical
//!    footprint stays roughly constant: the azimuth half-width shrinks as
//!    `1/r` while the range half-width is fixed. Every contributing sample
//!    is first *de-rotated* by the evolving per-beam slope (via a
//!    precomputed 360-entry sin/cos table) so that summation aligns phases
//!    that differ only because of the known local slope.
//! 3. A guess phase extrapolated from the last accepted value gates the
//!    result: windows whose vector consistency clears a data-dependent
//!    threshold are accepted (phase wrapped to ±180° of the guess) and feed
//!    back into the slope estimate; windows that do not are left unwritten
//!    and only seed a faint vector at the guess angle so later ranges stay
//!    anchored.
//! 4. The per-beam slope trajectory is kept honest by a raw-slope fallback
//!    in very poor windows, a blend toward the initial slope at close range,
//!    and a hard ±60° rail around the sweep-average slope.
//!
//! The smoothed I/Q field then converts to N and its error by a pulse-pair
//! over range neighbours; edge gates are forced to the slope-implied value
//! with infinite error.
//!
//! Scratch buffers live in the [`PhaseFitter`] and are reused across scans;
//! one [`FitOutput`] owns the per-fit result arrays and is likewise reusable.

use tracing::debug;

use crate::config::GridGeometry;
use crate::polar_grid::PolarGrid;
use crate::types::{wrap_to_deg, Iq, RefractError, RefractResult, DEG_TO_RAD, VERY_LARGE};

/// Azimuth smear (degrees) for the whole-sweep average slope estimate.
const SMEAR_AZ_DEG: f64 = 10.0;

/// Azimuth smear (degrees) for the initial near-range slope estimate.
const SMEAR_AZ_INIT_DEG: f64 = 30.0;

/// Range sub-window (gates) of the pulse-pair slope estimator.
const SMEAR_RANGE: usize = 2;

/// Physical length (metres) of the initial slope estimation window; also the
/// range inside which the evolving slope is blended back toward it.
const INITIAL_SLOPE_LEN_M: f64 = 4000.0;

/// Absolute floor on the per-window consistency threshold.
const MIN_ABS_CONSISTENCY: f64 = 4.0;

/// Cap on the per-cell quality estimate.
const MAX_QUALITY: f64 = 0.99;

/// Rail half-width (degrees per gate) around the sweep-average slope.
const SLOPE_RAIL_DEG: f64 = 60.0;

const SQRT_2: f64 = std::f64::consts::SQRT_2;

/// One phase-difference field to fit, with its companion quality.
#[derive(Debug, Clone, Copy)]
pub struct PhaseField<'a> {
    /// Normalized difference vectors (magnitude = per-cell quality/coherence).
    pub iq: &'a PolarGrid<Iq>,
    /// Raw per-cell quality in `[0, 1]`; 0 excludes the cell.
    pub quality: &'a PolarGrid<f64>,
    /// Target physical smoothing footprint in metres.
    pub smooth_side_len_m: f64,
    /// Refractivity of the reference this field is relative to (0 for the
    /// scan-to-scan dN/dt field).
    pub ref_n: f64,
}

/// Result arrays of one `fit_phase_field` call.
#[derive(Debug, Clone)]
pub struct FitOutput {
    /// Smoothed, de-aliased phase in degrees; `None` where no window was
    /// accepted.
    pub phase_fit: PolarGrid<Option<f64>>,
    /// Error of the smoothed phase in degrees; [`VERY_LARGE`] where unset.
    pub phase_error: PolarGrid<f64>,
    /// Smoothed I/Q field (accepted windows plus faint guess seeds).
    pub smooth_iq: PolarGrid<Iq>,
    /// Derived refractivity per cell.
    pub n: PolarGrid<f64>,
    /// Refractivity error per cell.
    pub n_error: PolarGrid<f64>,
    /// Whole-sweep average phase slope, degrees per gate.
    pub range_slope: f64,
    /// Mean phase extrapolated back to range zero, degrees.
    pub expected_phase_range0: f64,
    /// Error-and-range-weighted mean of the derived field, if defined.
    pub mean_n: Option<f64>,
}

impl FitOutput {
    /// Allocate result arrays for a geometry.
    pub fn new(geom: &GridGeometry) -> Self {
        Self {
            phase_fit: PolarGrid::new(geom.num_beams, geom.num_gates, None),
            phase_error: PolarGrid::new(geom.num_beams, geom.num_gates, VERY_LARGE),
            smooth_iq: PolarGrid::new(geom.num_beams, geom.num_gates, Iq::ZERO),
            n: PolarGrid::new(geom.num_beams, geom.num_gates, 0.0),
            n_error: PolarGrid::new(geom.num_beams, geom.num_gates, VERY_LARGE),
            range_slope: 0.0,
            expected_phase_range0: 0.0,
            mean_n: None,
        }
    }

    fn reset(&mut self) {
        self.phase_fit.fill(None);
        self.phase_error.fill(VERY_LARGE);
        self.smooth_iq.fill(Iq::ZERO);
        self.n.fill(0.0);
        self.n_error.fill(VERY_LARGE);
        self.range_slope = 0.0;
        self.expected_phase_range0 = 0.0;
        self.mean_n = None;
    }
}

/// Which pulse-pair slope window to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlopeWindow {
    /// Near-range window of fixed physical length, wide azimuth smear.
    Initial,
    /// Whole sweep, narrow azimuth smear.
    Average,
}

/// Adaptive phase smoother for one radar configuration.
///
/// Owns all scratch arrays so repeated fits allocate nothing.
#[derive(Debug)]
pub struct PhaseFitter {
    geom: GridGeometry,
    r_min: usize,
    min_consistency: f64,
    // De-rotation table: entry [angle][dr] rotates by (sr - dr)·angle
    // degrees; rebuilt only when the smoothing range half-width changes.
    slope_cos: Vec<f64>,
    slope_sin: Vec<f64>,
    table_sr: usize,
    // Per-beam state of the range sweep.
    slope_in_range: Vec<f64>,
    next_slope: Vec<f64>,
    guess_phase: Vec<f64>,
    guess_jump: Vec<f64>,
    // Rolling azimuth window of partial sums.
    sum_iq: Vec<Iq>,
    window_quality: Vec<f64>,
}

impl PhaseFitter {
    /// Create a fitter; `r_min` is the first usable gate and
    /// `min_consistency` the relative acceptance threshold.
    pub fn new(geom: GridGeometry, r_min: usize, min_consistency: f64) -> Self {
        let nb = geom.num_beams;
        Self {
            geom,
            r_min,
            min_consistency,
            slope_cos: Vec::new(),
            slope_sin: Vec::new(),
            table_sr: usize::MAX,
            slope_in_range: vec![0.0; nb],
            next_slope: vec![0.0; nb],
            guess_phase: vec![0.0; nb],
            guess_jump: vec![1.0; nb],
            sum_iq: vec![Iq::ZERO; nb / 4 + 1],
            window_quality: vec![0.0; nb / 4 + 1],
        }
    }

    /// Fit a smoothed phase field and derive N / N-error into `out`.
    ///
    /// Fails with [`RefractError::DegenerateSlope`] when a pulse-pair slope
    /// window accumulates an exactly-zero vector (no coherent signal); the
    /// caller treats that as "skip this scan", not as fatal.
    pub fn fit_phase_field(
        &mut self,
        field: &PhaseField<'_>,
        out: &mut FitOutput,
    ) -> RefractResult<()> {
        out.reset();

        let init_slope = self
            .mean_phase_slope(field.iq, SlopeWindow::Initial)
            .ok_or(RefractError::DegenerateSlope)?;
        let range_slope = self
            .mean_phase_slope(field.iq, SlopeWindow::Average)
            .ok_or(RefractError::DegenerateSlope)?;
        let phase0 = self
            .phase_at_min_range(field.iq)
            .ok_or(RefractError::DegenerateSlope)?;
        let expected_phase_range0 = phase0 - self.r_min as f64 * init_slope;

        let km = 1000.0 / self.geom.gate_spacing_m;
        debug!(
            range_slope_deg_per_km = range_slope * km,
            init_slope_deg_per_km = init_slope * km,
            "phase slope anchors"
        );

        out.range_slope = range_slope;
        out.expected_phase_range0 = expected_phase_range0;
        self.smooth(field, out, init_slope, range_slope, expected_phase_range0);
        self.derive_n(field, out);
        out.mean_n = weighted_mean_n(&out.n, &out.n_error);
        Ok(())
    }

    /// Per-beam slope estimates after the most recent sweep; exposed for the
    /// railing property tests.
    #[cfg(test)]
    pub(crate) fn slopes(&self) -> &[f64] {
        &self.slope_in_range
    }

    /// Pulse-pair estimate of the mean d(phase)/d(range) in degrees per
    /// gate, or `None` when the window holds no coherent signal at all.
    fn mean_phase_slope(&self, iq: &PolarGrid<Iq>, window: SlopeWindow) -> Option<f64> {
        let nb = self.geom.num_beams;
        let ng = self.geom.num_gates;
        let (max_r, smear_deg) = match window {
            SlopeWindow::Average => (ng - SMEAR_RANGE, SMEAR_AZ_DEG),
            SlopeWindow::Initial => {
                let len_gates = (INITIAL_SLOPE_LEN_M / self.geom.gate_spacing_m) as usize;
                ((self.r_min + len_gates).min(ng - SMEAR_RANGE), SMEAR_AZ_INIT_DEG)
            }
        };
        let smear_az = ((smear_deg * nb as f64 / 360.0) as usize).max(1);

        let mut slope_vec = Iq::ZERO;
        for az in (0..nb).step_by(smear_az) {
            let mut window_sum = Iq::ZERO;
            let mut r = self.r_min;
            while r < max_r {
                let old = window_sum;
                window_sum = Iq::ZERO;
                for j in 0..smear_az {
                    for k in 1..=SMEAR_RANGE {
                        window_sum += *iq.get_wrapped((az + j) as isize, r + k);
                    }
                }
                slope_vec += window_sum.conj_mul(old);
                r += SMEAR_RANGE;
            }
        }
        slope_vec
            .phase_deg()
            .map(|p| p / SMEAR_RANGE as f64)
    }

    /// Mean phase at the first usable gate, averaged over all beams.
    fn phase_at_min_range(&self, iq: &PolarGrid<Iq>) -> Option<f64> {
        let mut sum = Iq::ZERO;
        for az in 0..self.geom.num_beams {
            sum += *iq.get(az, self.r_min);
        }
        sum.phase_deg()
    }

    /// (Re)build the de-rotation table for a range half-width.
    fn build_slope_table(&mut self, sr: usize) {
        if self.table_sr == sr {
            return;
        }
        let cols = 2 * sr + 1;
        self.slope_cos.clear();
        self.slope_sin.clear();
        self.slope_cos.reserve(360 * cols);
        self.slope_sin.reserve(360 * cols);
        for angle in 0..360 {
            for dr in 0..cols {
                let rad = (sr as f64 - dr as f64) * angle as f64 * DEG_TO_RAD;
                self.slope_cos.push(rad.cos());
                self.slope_sin.push(rad.sin());
            }
        }
        self.table_sr = sr;
    }

    /// Table row base for a slope value, matching `floor(slope + 0.5)`
    /// folded into `[0, 360)`.
    fn table_base(&self, slope_deg: f64) -> usize {
        let angle = ((slope_deg + 0.5).floor() as i64).rem_euclid(360) as usize;
        angle * (2 * self.table_sr + 1)
    }

    /// De-rotate one sample by `(sr - dr)` times the tabulated angle.
    #[inline]
    fn derotate(&self, sample: Iq, base: usize, dr: usize) -> Iq {
        let c = self.slope_cos[base + dr];
        let s = self.slope_sin[base + dr];
        Iq::new(
            sample.i() * c - sample.q() * s,
            sample.q() * c + sample.i() * s,
        )
    }

    /// The range sweep: fill `phase_fit`, `phase_error`, and `smooth_iq`.
    fn smooth(
        &mut self,
        field: &PhaseField<'_>,
        out: &mut FitOutput,
        init_slope: f64,
        range_slope: f64,
        expected_phase_range0: f64,
    ) {
        let nb = self.geom.num_beams;
        let ng = self.geom.num_gates;
        let gate = self.geom.gate_spacing_m;
        let side_len = field.smooth_side_len_m;

        let sr = ((side_len / 2.0 / gate) as usize).max(1);
        let two_sr = 2 * sr;
        self.build_slope_table(sr);

        let init_len_gates = INITIAL_SLOPE_LEN_M / gate;
        let gate_over_len = gate / side_len;

        self.slope_in_range.iter_mut().for_each(|s| *s = init_slope);
        self.next_slope.copy_from_slice(&self.slope_in_range);

        for r in 0..ng {
            // Azimuth half-window keeping the physical footprint constant;
            // unbounded at the origin, so clamp before anything else.
            let sa = if r == 0 {
                nb / 8 - 1
            } else {
                let ideal = side_len * 360.0
                    / (self.geom.azim_spacing_deg()
                        * r as f64
                        * gate
                        * 4.0
                        * std::f64::consts::PI);
                (ideal as usize).clamp(1, nb / 8 - 1)
            };
            let two_sa = 2 * sa;
            let min_consistency_abs =
                ((two_sr + 1) as f64 * (two_sa + 1) as f64 * self.min_consistency)
                    .max(MIN_ABS_CONSISTENCY);

            // Prime the rolling window one beam before the first, so the
            // per-beam shift below lands the first window on beam 0.
            for daz in 0..=two_sa {
                self.sum_iq[daz] = Iq::ZERO;
                self.window_quality[daz] = 0.0;
            }
            let last = nb as isize - 1;
            for dr in 0..=two_sr {
                let gate_idx = r as isize + dr as isize - sr as isize;
                if gate_idx < self.r_min as isize || gate_idx >= ng as isize {
                    continue;
                }
                let gate_idx = gate_idx as usize;
                let w = range_kernel(sr, dr);
                for daz in 0..=two_sa {
                    let az = field.iq.wrap_az(last + daz as isize - sa as isize);
                    let base = self.table_base(self.slope_in_range[az]);
                    let cell = self.derotate(*field.iq.get(az, gate_idx), base, dr);
                    self.sum_iq[daz] += cell.scale(w);
                    self.window_quality[daz] += w * field.quality.get(az, gate_idx);
                }
            }

            self.fill_guesses(out, r, expected_phase_range0);

            for az2 in 0..nb {
                // Shift the window one beam and accumulate the new column.
                for daz in 0..two_sa {
                    self.sum_iq[daz] = self.sum_iq[daz + 1];
                    self.window_quality[daz] = self.window_quality[daz + 1];
                }
                self.sum_iq[two_sa] = Iq::ZERO;
                self.window_quality[two_sa] = 0.0;
                let az_new = field.iq.wrap_az(az2 as isize + sa as isize);
                let base = self.table_base(self.slope_in_range[az_new]);
                for dr in 0..=two_sr {
                    let gate_idx = r as isize + dr as isize - sr as isize;
                    if gate_idx < self.r_min as isize || gate_idx >= ng as isize {
                        continue;
                    }
                    let gate_idx = gate_idx as usize;
                    let w = range_kernel(sr, dr);
                    let cell = self.derotate(*field.iq.get(az_new, gate_idx), base, dr);
                    self.sum_iq[two_sa] += cell.scale(w);
                    self.window_quality[two_sa] += w * field.quality.get(az_new, gate_idx);
                }

                // Combine the azimuth window, correcting each column for the
                // expected mean-phase drift across the window. Corrections
                // past 180° are dampened by half; full correction there
                // misbehaves.
                let mut combined = Iq::ZERO;
                let mut max_consistency = 0.0;
                for daz in 0..=two_sa {
                    let az = field.iq.wrap_az(az2 as isize + daz as isize - sa as isize);
                    let column = if r > 0
                        && out.phase_fit.get(az, r - 1).is_some()
                        && out.phase_fit.get(az2, r - 1).is_some()
                    {
                        let drift = self.guess_phase[az2] - self.guess_phase[az];
                        let mut k = ((drift + 0.5).floor() as i64).rem_euclid(360) as usize;
                        if k < 180 {
                            k /= 2;
                        } else {
                            k += (360 - k) / 2;
                        }
                        // Table row k at dr = sr-1 rotates by exactly k°.
                        self.derotate(self.sum_iq[daz], k * (two_sr + 1), sr - 1)
                    } else {
                        self.sum_iq[daz]
                    };
                    let w = azim_kernel(sa, daz);
                    combined += column.scale(w);
                    max_consistency += w * self.window_quality[daz];
                }

                let weight_fact = ((two_sr + 1) * (two_sa + 1)) as f64;
                *out.smooth_iq.get_mut(az2, r) = combined.scale(1.0 / weight_fact);

                // Coherence corrected for the random-walk noise floor of a
                // window this size, then normalized into a quality estimate.
                let mut consistency = combined.norm();
                let noise_floor = (2.0 / weight_fact).sqrt() * max_consistency;
                consistency = if consistency < noise_floor {
                    0.0
                } else {
                    (consistency * consistency - noise_floor * noise_floor)
                        .max(0.0)
                        .sqrt()
                };
                let mut quality = if max_consistency > 0.0 {
                    if weight_fact > max_consistency {
                        consistency / (max_consistency * weight_fact).sqrt()
                    } else {
                        consistency / max_consistency
                    }
                } else {
                    0.0
                };
                quality = quality.min(MAX_QUALITY);
                if quality < self.min_consistency {
                    consistency = 0.0;
                }

                let jump = self.guess_jump[az2].max(1.0);
                let neighbour_relax = gate_over_len
                    * (self.slope_in_range[out.phase_fit.wrap_az(az2 as isize - 1)]
                        + self.slope_in_range[(az2 + 1) % nb]
                        + 0.25 * range_slope
                        - 2.25 * self.slope_in_range[az2]);

                if consistency > min_consistency_abs {
                    let phase = combined
                        .phase_deg()
                        .map(|p| wrap_to_deg(p, self.guess_phase[az2]))
                        .unwrap_or(self.guess_phase[az2]);
                    *out.phase_fit.get_mut(az2, r) = Some(phase);
                    *out.phase_error.get_mut(az2, r) = (-2.0 * quality.ln() / quality)
                        .sqrt()
                        / DEG_TO_RAD
                        / (max_consistency / 2.0).sqrt();
                    let miss = phase - self.guess_phase[az2];
                    if consistency > 4.0 * min_consistency_abs {
                        self.next_slope[az2] += 2.0 * gate_over_len / jump * miss;
                    } else {
                        let rel = consistency / min_consistency_abs;
                        self.next_slope[az2] += 0.5 * rel * gate_over_len / jump * miss;
                        self.next_slope[az2] += (1.0 - 0.25 * rel) * neighbour_relax;
                    }
                } else {
                    // No confirmed value: relax the slope toward neighbours
                    // and the sweep average, and seed a faint vector at the
                    // guess angle so later ranges stay anchored.
                    self.next_slope[az2] += neighbour_relax;
                    *out.smooth_iq.get_mut(az2, r) =
                        Iq::from_phase_deg(self.guess_phase[az2]).scale(0.1 * min_consistency_abs);
                }

                // Really poor quality means the evolving slope itself may be
                // wrong; re-measure it the raw way over a doubled window and
                // adopt it only if it is believable.
                if quality < (2.0 / weight_fact).sqrt() {
                    self.raw_slope_fallback(field, az2, r, sa, sr, range_slope);
                }

                if (r as f64) < init_len_gates {
                    self.next_slope[az2] +=
                        0.1 * (1.0 - r as f64 / init_len_gates) * (init_slope - self.next_slope[az2]);
                }
                self.next_slope[az2] = self.next_slope[az2]
                    .clamp(range_slope - SLOPE_RAIL_DEG, range_slope + SLOPE_RAIL_DEG);
            }

            self.slope_in_range.copy_from_slice(&self.next_slope);
        }
    }

    /// Extrapolate the guess phase for every beam at range `r`.
    fn fill_guesses(&mut self, out: &FitOutput, r: usize, expected_phase_range0: f64) {
        let nb = self.geom.num_beams;
        for az in 0..nb {
            if r == self.r_min {
                self.guess_phase[az] = expected_phase_range0;
                self.guess_jump[az] = 1.0;
                continue;
            }
            let mut jump = 1usize;
            while jump < r && out.phase_fit.get(az, r - jump).is_none() {
                jump += 1;
            }
            let anchor = if jump < r {
                *out.phase_fit.get(az, r - jump)
            } else {
                None
            };
            match anchor {
                Some(phase) if r >= self.r_min + jump => {
                    self.guess_phase[az] = phase + jump as f64 * self.slope_in_range[az];
                    self.guess_jump[az] = jump as f64;
                }
                _ => {
                    let back = r as f64 - self.r_min as f64;
                    self.guess_phase[az] =
                        expected_phase_range0 + back * self.slope_in_range[az];
                    self.guess_jump[az] = back.max(1.0);
                }
            }
        }
    }

    /// Raw (non-de-rotated) pulse-pair slope over a doubled window; adopted
    /// with damping only when it is consistent and within 60° of the sweep
    /// average.
    fn raw_slope_fallback(
        &mut self,
        field: &PhaseField<'_>,
        az2: usize,
        r: usize,
        sa: usize,
        sr: usize,
        range_slope: f64,
    ) {
        let ng = self.geom.num_gates;
        let two_sa = 2 * sa;
        let two_sr = 2 * sr;
        let mut raw_slope = Iq::ZERO;
        let mut window_sum = Iq::ZERO;
        for dr in -(two_sr as isize)..=(two_sr as isize) {
            let gate_idx = r as isize + dr;
            if gate_idx < self.r_min as isize || gate_idx >= ng as isize {
                continue;
            }
            let old = window_sum;
            window_sum = Iq::ZERO;
            for daz in -(two_sa as isize)..=(two_sa as isize) {
                window_sum += *field.iq.get_wrapped(az2 as isize + daz, gate_idx as usize);
            }
            raw_slope += window_sum.conj_mul(old);
        }
        let consistency = raw_slope.norm();
        let cells = (2 * two_sa + 1) as f64;
        let bar = self.min_consistency * cells * cells * (2 * two_sr + 1) as f64;
        if consistency > bar {
            if let Some(slope) = raw_slope.phase_deg() {
                self.slope_in_range[az2] = slope;
                if (slope - range_slope).abs() < SLOPE_RAIL_DEG {
                    self.next_slope[az2] += 0.2 * (slope - self.next_slope[az2]);
                }
            }
        }
    }

    /// Convert the smoothed I/Q field to N / N-error.
    fn derive_n(&self, field: &PhaseField<'_>, out: &mut FitOutput) {
        let nb = self.geom.num_beams;
        let ng = self.geom.num_gates;
        let gate = self.geom.gate_spacing_m;
        // N-units per (degree of phase slope per gate): one full 360° wrap
        // over the two-way path corresponds to 1e6·λ/2 of optical path.
        let slope_to_n = 1.0e6 * self.geom.wavelength_m / (720.0 * gate);
        let edge_n = out.range_slope * slope_to_n + field.ref_n;
        let er_decorrel = (2.0 * gate / field.smooth_side_len_m).min(1.0);

        for az in 0..nb {
            *out.n.get_mut(az, 0) = edge_n;
            *out.n_error.get_mut(az, 0) = VERY_LARGE;
            for r in 1..ng - 1 {
                let s_prev = *out.smooth_iq.get(az, r - 1);
                let s_cur = *out.smooth_iq.get(az, r);
                let s_next = *out.smooth_iq.get(az, r + 1);
                let pair = s_cur.conj_mul(s_prev) + s_next.conj_mul(s_cur);
                let slope_deg = pair.phase_deg().unwrap_or(0.0);
                *out.n.get_mut(az, r) = slope_deg * slope_to_n + field.ref_n;
                let e_prev = *out.phase_error.get(az, r - 1);
                let e_cur = *out.phase_error.get(az, r);
                let e_next = *out.phase_error.get(az, r + 1);
                let err = er_decorrel
                    * ((e_prev * e_prev + e_cur * e_cur + e_next * e_next) / 6.0).sqrt()
                    * slope_to_n;
                *out.n_error.get_mut(az, r) = err.min(VERY_LARGE);
            }
            *out.n.get_mut(az, ng - 1) = edge_n;
            *out.n_error.get_mut(az, ng - 1) = VERY_LARGE;
        }
    }
}

/// Parabolic range weighting, `sqrt(2)·(1 − ((sr−dr)/(sr+0.5))²)`.
#[inline]
fn range_kernel(sr: usize, dr: usize) -> f64 {
    let x = (sr as f64 - dr as f64) / (sr as f64 + 0.5);
    SQRT_2 * (1.0 - x * x)
}

/// Parabolic azimuth weighting, same form as the range kernel.
#[inline]
fn azim_kernel(sa: usize, daz: usize) -> f64 {
    let x = (sa as f64 - daz as f64) / (sa as f64 + 0.5);
    SQRT_2 * (1.0 - x * x)
}

/// Error-weighted, range-weighted mean of a derived field; `None` when the
/// combined weight says essentially no cell was usable. Recomputed by the
/// scan processor after relaxation, which shifts the field.
pub(crate) fn weighted_mean_n(n: &PolarGrid<f64>, n_error: &PolarGrid<f64>) -> Option<f64> {
    let ng = n.num_gates();
    let mut value = 0.0;
    let mut weight = 0.0;
    for (k, (&nv, &ne)) in n.as_slice().iter().zip(n_error.as_slice()).enumerate() {
        let w = (k % ng) as f64 / ne;
        value += w * nv;
        weight += w;
    }
    let floor = (n.len() * ng) as f64 / VERY_LARGE;
    if weight < floor {
        None
    } else {
        Some(value / weight)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const BEAMS: usize = 360;
    const GATES: usize = 100;
    const R_MIN: usize = 4;
    const MIN_CONSISTENCY: f64 = 0.015;

    fn geom() -> GridGeometry {
        GridGeometry {
            num_beams: BEAMS,
            num_gates: GATES,
            gate_spacing_m: 150.0,
            wavelength_m: 0.1,
        }
    }

    fn fitter() -> PhaseFitter {
        PhaseFitter::new(geom(), R_MIN, MIN_CONSISTENCY)
    }

    /// Uniform-slope synthetic scan: phase = slope·r at unit quality beyond
    /// r_min, zero quality inside the blind zone.
    fn ramp_field(slope_deg_per_gate: f64) -> (PolarGrid<Iq>, PolarGrid<f64>) {
        let mut iq = PolarGrid::new(BEAMS, GATES, Iq::ZERO);
        let mut quality = PolarGrid::new(BEAMS, GATES, 0.0);
        for az in 0..BEAMS {
            for r in R_MIN..GATES {
                *iq.get_mut(az, r) = Iq::from_phase_deg(slope_deg_per_gate * r as f64);
                *quality.get_mut(az, r) = 1.0;
            }
        }
        (iq, quality)
    }

    // -----------------------------------------------------------------------
    // 1. Mean slope estimator recovers an injected slope
    // -----------------------------------------------------------------------
    #[test]
    fn test_mean_phase_slope_recovers_ramp() {
        let f = fitter();
        let (iq, _) = ramp_field(10.0);
        for window in [SlopeWindow::Initial, SlopeWindow::Average] {
            let s = f.mean_phase_slope(&iq, window).unwrap();
            assert!((s - 10.0).abs() < 0.01, "{window:?}: expected 10, got {s}");
        }
    }

    // -----------------------------------------------------------------------
    // 2. All-zero scan: degenerate slope fails the fit, sentinels untouched
    // -----------------------------------------------------------------------
    #[test]
    fn test_all_zero_scan_fails_cleanly() {
        let mut f = fitter();
        let iq = PolarGrid::new(BEAMS, GATES, Iq::ZERO);
        let quality = PolarGrid::new(BEAMS, GATES, 0.0);
        let field = PhaseField {
            iq: &iq,
            quality: &quality,
            smooth_side_len_m: 4000.0,
            ref_n: 300.0,
        };
        let mut out = FitOutput::new(&geom());
        let err = f.fit_phase_field(&field, &mut out);
        assert!(matches!(err, Err(RefractError::DegenerateSlope)));
        assert!(out.phase_fit.as_slice().iter().all(|p| p.is_none()));
        assert!(out.phase_error.as_slice().iter().all(|&e| e == VERY_LARGE));
    }

    // -----------------------------------------------------------------------
    // 3. End-to-end ramp: derived N matches the injected slope
    // -----------------------------------------------------------------------
    #[test]
    fn test_ramp_recovers_n() {
        let mut f = fitter();
        let slope = 10.0;
        let (iq, quality) = ramp_field(slope);
        let field = PhaseField {
            iq: &iq,
            quality: &quality,
            smooth_side_len_m: 4000.0,
            ref_n: 300.0,
        };
        let mut out = FitOutput::new(&geom());
        f.fit_phase_field(&field, &mut out).unwrap();

        let slope_to_n = 1.0e6 * 0.1 / (720.0 * 150.0);
        let expect = slope * slope_to_n + 300.0;
        let sr = (4000.0 / 2.0 / 150.0) as usize;
        for az in (0..BEAMS).step_by(45) {
            for r in (R_MIN + sr + 1)..(GATES - 1) {
                let n = *out.n.get(az, r);
                assert!(
                    (n - expect).abs() < 1.0,
                    "az {az} r {r}: N = {n}, expected {expect}"
                );
            }
        }
        let mean = out.mean_n.expect("mean should be defined");
        assert!((mean - expect).abs() < 2.0, "mean N = {mean}");
    }

    // -----------------------------------------------------------------------
    // 4. Slope railing: |slope − avg| ≤ 60 °/gate after the sweep
    // -----------------------------------------------------------------------
    #[test]
    fn test_slope_railing() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut f = fitter();
        // Ramp plus heavy phase noise and random dropouts.
        let (mut iq, mut quality) = ramp_field(15.0);
        for az in 0..BEAMS {
            for r in R_MIN..GATES {
                if rng.gen_bool(0.4) {
                    *iq.get_mut(az, r) = Iq::ZERO;
                    *quality.get_mut(az, r) = 0.0;
                } else {
                    let noise: f64 = rng.gen_range(-120.0..120.0);
                    *iq.get_mut(az, r) =
                        Iq::from_phase_deg(15.0 * r as f64 + noise).scale(0.6);
                    *quality.get_mut(az, r) = 0.6;
                }
            }
        }
        let field = PhaseField {
            iq: &iq,
            quality: &quality,
            smooth_side_len_m: 4000.0,
            ref_n: 300.0,
        };
        let mut out = FitOutput::new(&geom());
        f.fit_phase_field(&field, &mut out).unwrap();
        for (az, &s) in f.slopes().iter().enumerate() {
            assert!(
                (s - out.range_slope).abs() <= SLOPE_RAIL_DEG + 1e-9,
                "beam {az}: slope {s} escaped the rail around {}",
                out.range_slope
            );
        }
    }

    // -----------------------------------------------------------------------
    // 5. Sentinel propagation: a zero-quality sector stays unwritten
    // -----------------------------------------------------------------------
    #[test]
    fn test_zero_quality_sector_stays_invalid() {
        let mut f = fitter();
        let (mut iq, mut quality) = ramp_field(10.0);
        // Kill a 40-beam sector entirely.
        for az in 100..140 {
            for r in 0..GATES {
                *iq.get_mut(az, r) = Iq::ZERO;
                *quality.get_mut(az, r) = 0.0;
            }
        }
        let field = PhaseField {
            iq: &iq,
            quality: &quality,
            smooth_side_len_m: 4000.0,
            ref_n: 300.0,
        };
        let mut out = FitOutput::new(&geom());
        f.fit_phase_field(&field, &mut out).unwrap();
        // Deep inside the dead sector no azimuth window reaches live data at
        // far range, where the window is at most ±(num_beams/8 − 1) beams.
        for r in 60..GATES {
            assert!(
                out.phase_fit.get(120, r).is_none(),
                "dead-sector cell (120, {r}) was written"
            );
            assert_eq!(*out.phase_error.get(120, r), VERY_LARGE);
        }
    }

    // -----------------------------------------------------------------------
    // 6. Edge gates are forced to the slope-implied N with infinite error
    // -----------------------------------------------------------------------
    #[test]
    fn test_edge_gates_forced() {
        let mut f = fitter();
        let (iq, quality) = ramp_field(10.0);
        let field = PhaseField {
            iq: &iq,
            quality: &quality,
            smooth_side_len_m: 4000.0,
            ref_n: 300.0,
        };
        let mut out = FitOutput::new(&geom());
        f.fit_phase_field(&field, &mut out).unwrap();
        let slope_to_n = 1.0e6 * 0.1 / (720.0 * 150.0);
        let edge = out.range_slope * slope_to_n + 300.0;
        for az in [0, 90, 271] {
            assert!((out.n.get(az, 0) - edge).abs() < 1e-9);
            assert!((out.n.get(az, GATES - 1) - edge).abs() < 1e-9);
            assert_eq!(*out.n_error.get(az, 0), VERY_LARGE);
            assert_eq!(*out.n_error.get(az, GATES - 1), VERY_LARGE);
        }
    }

    // -----------------------------------------------------------------------
    // 7. Azimuth wrap: rotating the scan rotates the fit, including across 0°
    // -----------------------------------------------------------------------
    #[test]
    fn test_fit_rotation_equivariance() {
        // A quality pattern asymmetric in azimuth, fitted twice: once as-is
        // and once rotated by 90 beams. The accepted-cell pattern must
        // rotate with it, which fails if windows mishandle the 359°→0° seam.
        let run = |rot: usize| {
            let mut f = fitter();
            let mut iq = PolarGrid::new(BEAMS, GATES, Iq::ZERO);
            let mut quality = PolarGrid::new(BEAMS, GATES, 0.0);
            for az in 0..BEAMS {
                let src = (az + BEAMS - rot) % BEAMS;
                // Live data only on beams 300..360 of the unrotated pattern,
                // a sector that straddles north once rotated.
                if src >= 300 {
                    for r in R_MIN..GATES {
                        *iq.get_mut(az, r) = Iq::from_phase_deg(10.0 * r as f64);
                        *quality.get_mut(az, r) = 1.0;
                    }
                }
            }
            let field = PhaseField {
                iq: &iq,
                quality: &quality,
                smooth_side_len_m: 4000.0,
                ref_n: 300.0,
            };
            let mut out = FitOutput::new(&geom());
            f.fit_phase_field(&field, &mut out).unwrap();
            out
        };
        let base = run(0);
        let rotated = run(90);
        for az in 0..BEAMS {
            for r in (R_MIN..GATES).step_by(7) {
                let a = base.phase_fit.get(az, r).is_some();
                let b = rotated.phase_fit.get((az + 90) % BEAMS, r).is_some();
                assert_eq!(a, b, "acceptance mismatch at az {az}, r {r}");
            }
        }
    }
}
