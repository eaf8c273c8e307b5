//! Phase-constrained relaxation of the refractivity field
//!
//! The smoothed-phase fit leaves holes wherever no window cleared the
//! acceptance bar. This pass fills them by an iterative
//! "nudge-then-diffuse" scheme:
//!
//! - **Nudge**: walking out in range along each beam, the N field implies a
//!   cumulative phase. Wherever a fitted phase exists, the mismatch (wrapped
//!   to ±180° and dampened by an arctangent of mismatch over phase error, so
//!   uncertain fits pull weakly) is converted back to N and spread evenly
//!   over the gates since the previous fitted cell.
//! - **Diffuse**: every cell is averaged with its two range neighbours and a
//!   range-dependent azimuth kernel whose physical width stays roughly
//!   constant. Beyond the range where one beam exceeds the target width the
//!   kernel collapses to three entries, with `1/sqrt` side weights so
//!   diffusion still makes headway where beams are sparse.
//!
//! Data-rich regions therefore stay pinned to the phase measurements while
//! their values percolate into data-poor ones. The iteration count scales
//! with the square of the smoothing footprint in gates, bounded to
//! `[3, 1000]`; the mean absolute per-cell change of each pass is recorded
//! for diagnostics.

use tracing::{debug, trace};

use crate::config::GridGeometry;
use crate::phase_fit::FitOutput;

/// Absolute cap on relaxation iterations.
const MAX_ITERATIONS: usize = 1000;

/// Azimuth kernel width: 21 taps centred on the beam.
const KERNEL_TAPS: usize = 21;
const KERNEL_CENTER: usize = 10;

/// Iterative diffuser for one radar geometry.
///
/// The azimuth kernel depends only on the geometry, so it is built once;
/// the work array is reused across scans.
#[derive(Debug)]
pub struct RelaxationDiffuser {
    geom: GridGeometry,
    // Per-range azimuth kernel, KERNEL_TAPS entries per range, normalized to
    // sum 3, plus the first non-zero tap per range.
    kernel: Vec<f64>,
    first_tap: Vec<usize>,
    work: Vec<f64>,
    forcing_history: Vec<f64>,
}

impl RelaxationDiffuser {
    pub fn new(geom: GridGeometry) -> Self {
        let (kernel, first_tap) = build_kernel(&geom);
        Self {
            geom,
            kernel,
            first_tap,
            work: vec![0.0; geom.num_cells()],
            forcing_history: Vec::new(),
        }
    }

    /// Relax `out.n` in place against the fitted phases; returns the number
    /// of iterations run.
    pub fn relax(
        &mut self,
        out: &mut FitOutput,
        ref_n: f64,
        smooth_side_len_m: f64,
        r_min: usize,
    ) -> usize {
        let nb = self.geom.num_beams;
        let ng = self.geom.num_gates;
        let gate = self.geom.gate_spacing_m;
        let slope_to_n = 1.0e6 * self.geom.wavelength_m / (720.0 * gate);
        // Field-to-data stiffness; small values track the data loosely.
        let force_factor = (gate / smooth_side_len_m) * (gate / smooth_side_len_m);
        let half_len_gates = 0.5 * smooth_side_len_m / gate;
        let num_iterat =
            ((0.5 * half_len_gates * half_len_gates) as usize).clamp(3, MAX_ITERATIONS);
        debug!(num_iterat, "starting relaxation");

        self.forcing_history.clear();
        let n = out.n.as_mut_slice();
        let phase_fit = &out.phase_fit;
        let phase_error = &out.phase_error;
        // Phase the field implies at range zero, extrapolated back from the
        // first usable gate.
        let phase_origin = out.expected_phase_range0 - r_min as f64 * out.range_slope;

        for iterat in 0..num_iterat {
            self.work.copy_from_slice(n);

            // Nudge (skipped on the first pass so the diffusion gets one
            // clean smoothing of the raw field).
            if iterat >= 1 {
                for az in 0..nb {
                    let mut cur_phase = phase_origin;
                    let mut prev_r = 0usize;
                    for r in 1..ng {
                        let k = az * ng + r;
                        cur_phase += (n[k] - ref_n) / slope_to_n;
                        let Some(fitted) = *phase_fit.get(az, r) else {
                            continue;
                        };
                        let mut delta = wrap_centideg(fitted - cur_phase);
                        let err = phase_error.get(az, r).max(f64::EPSILON);
                        delta *= (delta.abs() * force_factor / err).atan()
                            / std::f64::consts::PI
                            * 2.0;
                        let nudge = delta * slope_to_n / (r - prev_r) as f64;
                        for back in 0..(r - prev_r) {
                            self.work[k - back] += nudge;
                        }
                        cur_phase += delta;
                        prev_r = r;
                    }
                }
            }

            // Diffuse.
            let mut forcing = 0.0;
            for az in 0..nb {
                for r in 0..ng {
                    let k = az * ng + r;
                    let mut count = 3.0;
                    let mut sum = 0.0;
                    if r != 0 {
                        sum = self.work[k - 1];
                        count += 1.0;
                    }
                    if r != ng - 1 {
                        sum += self.work[k + 1];
                        count += 1.0;
                    }
                    let first = self.first_tap[r];
                    for tap in first..=(KERNEL_TAPS - 1 - first) {
                        let az2 = phase_fit
                            .wrap_az(az as isize + tap as isize - KERNEL_CENTER as isize);
                        sum += self.kernel[KERNEL_TAPS * r + tap] * self.work[az2 * ng + r];
                    }
                    forcing += (sum / count - n[k]).abs();
                    n[k] = sum / count;
                }
            }

            forcing /= (nb * ng) as f64;
            trace!(iterat, forcing, "relaxation pass");
            self.forcing_history.push(forcing);
        }
        num_iterat
    }

    /// Mean absolute per-cell change of each pass of the last `relax` call.
    pub fn forcing_history(&self) -> &[f64] {
        &self.forcing_history
    }
}

/// Wrap a phase mismatch into `(-180, 180]` at 0.01° resolution.
fn wrap_centideg(delta_deg: f64) -> f64 {
    let mut d = ((100.0 * delta_deg) as i64).rem_euclid(36000) as f64 / 100.0;
    if d > 180.0 {
        d -= 360.0;
    }
    d
}

/// Range-dependent azimuth kernel, shaped so diffusion covers about the same
/// physical distance per pass in both directions.
fn build_kernel(geom: &GridGeometry) -> (Vec<f64>, Vec<usize>) {
    let ng = geom.num_gates;
    let mut kernel = vec![0.0; KERNEL_TAPS * ng];
    let mut first_tap = vec![0usize; ng];
    for r in 0..ng {
        let row = &mut kernel[KERNEL_TAPS * r..KERNEL_TAPS * (r + 1)];
        // Arc length of one beam step at this range, in gate units.
        let equiv_dist = (2 * r) as f64 * std::f64::consts::PI / geom.num_beams as f64;
        let mut total = -1.0;
        if equiv_dist < 1.0 {
            for tap in KERNEL_CENTER..KERNEL_TAPS {
                let offset = tap as f64 - KERNEL_CENTER as f64;
                if (offset + 0.5) * equiv_dist < 1.5 {
                    row[tap] = 1.0;
                    row[KERNEL_TAPS - 1 - tap] = 1.0;
                    total += 2.0;
                    first_tap[r] = KERNEL_TAPS - 1 - tap;
                } else if (offset - 0.5) * equiv_dist < 1.5 {
                    let w = (1.5 - (offset - 0.5) * equiv_dist) / equiv_dist;
                    row[tap] = w;
                    row[KERNEL_TAPS - 1 - tap] = w;
                    total += 2.0 * w;
                    first_tap[r] = KERNEL_TAPS - 1 - tap;
                }
            }
        } else {
            // One beam already spans the target width; keep a minimal kernel
            // with soft sides so sparse far-range data still spreads.
            row[KERNEL_CENTER] = 1.0;
            let side = 1.0 / equiv_dist.sqrt();
            row[KERNEL_CENTER + 1] = side;
            row[KERNEL_CENTER - 1] = side;
            total = 1.0 + 2.0 * side;
            first_tap[r] = KERNEL_CENTER - 1;
        }
        for w in row.iter_mut() {
            *w *= 3.0 / total;
        }
    }
    (kernel, first_tap)
}
