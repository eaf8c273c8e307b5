//! Core value types for refractivity processing
//!
//! This module defines the fundamental types used throughout the crate,
//! particularly the complex I/Q (In-phase/Quadrature) sample that carries a
//! single phase measurement.
//!
//! ## Understanding I/Q phase samples
//!
//! Ground-clutter phase is represented as a 2-D vector:
//! - **magnitude** encodes coherence (how much the underlying samples agree),
//! - **angle** encodes the phase itself, in degrees throughout this crate.
//!
//! A sample with `I = Q = 0` is the canonical "no data" marker: it carries no
//! angle and contributes nothing to any weighted vector sum, so missing data
//! falls out of the averaging algebra without special-casing.
//!
//! ```text
//!            Q (Quadrature)
//!            ^
//!            |     * (I=0.7, Q=0.7)
//!            |    /
//!            |   / magnitude = coherence
//!            |  /  angle = phase (deg)
//!            | /
//!   ---------+---------> I (In-phase)
//! ```

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Degrees-to-radians conversion factor.
pub const DEG_TO_RAD: f64 = PI / 180.0;

/// Sentinel written for undefined values at the serialization boundary.
///
/// Inside the crate undefined phase is `Option::None`; this constant only
/// appears when output fields are flattened for the file-I/O collaborator.
pub const INVALID: f64 = -9999.0;

/// Sentinel for deliberately infinite error (e.g. edge gates).
pub const VERY_LARGE: f64 = 9999.0;

/// Result type for refractivity processing operations.
pub type RefractResult<T> = Result<T, RefractError>;

/// Errors that can occur during refractivity processing.
///
/// Per-cell data insufficiency is *not* an error: such cells simply stay
/// `None` / [`VERY_LARGE`] and processing continues. These variants cover
/// scan-level failures only; the caller skips the scan and carries on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefractError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("grid shape mismatch: expected {expected} cells, got {actual}")]
    GridMismatch { expected: usize, actual: usize },

    #[error("degenerate phase slope: no coherent signal in the estimation window")]
    DegenerateSlope,
}

/// A single I/Q phase sample.
///
/// Thin wrapper over [`Complex64`] adding the degree-domain phase and
/// rotation operations the smoothing algebra needs. All angles are degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Iq(pub Complex64);

impl Iq {
    /// The "no data" marker.
    pub const ZERO: Iq = Iq(Complex64::new(0.0, 0.0));

    /// Create a sample from in-phase and quadrature components.
    pub fn new(i: f64, q: f64) -> Self {
        Iq(Complex64::new(i, q))
    }

    /// Unit-magnitude sample at the given phase angle in degrees.
    pub fn from_phase_deg(deg: f64) -> Self {
        let rad = deg * DEG_TO_RAD;
        Iq(Complex64::new(rad.cos(), rad.sin()))
    }

    /// In-phase component.
    #[inline]
    pub fn i(&self) -> f64 {
        self.0.re
    }

    /// Quadrature component.
    #[inline]
    pub fn q(&self) -> f64 {
        self.0.im
    }

    /// Vector magnitude (coherence).
    #[inline]
    pub fn norm(&self) -> f64 {
        self.0.norm()
    }

    /// Squared magnitude.
    #[inline]
    pub fn norm_sqr(&self) -> f64 {
        self.0.norm_sqr()
    }

    /// True for the exact zero vector.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.re == 0.0 && self.0.im == 0.0
    }

    /// Phase angle in degrees, or `None` for the zero vector.
    pub fn phase_deg(&self) -> Option<f64> {
        if self.is_zero() {
            None
        } else {
            Some(self.0.im.atan2(self.0.re) / DEG_TO_RAD)
        }
    }

    /// This sample times the conjugate of `other`.
    ///
    /// The result's angle is the phase difference `self − other`; its
    /// magnitude is the product of the two coherences.
    #[inline]
    pub fn conj_mul(&self, other: Iq) -> Iq {
        Iq(self.0 * other.0.conj())
    }

    /// Rotate by the given angle in degrees.
    pub fn rotate_deg(&self, deg: f64) -> Iq {
        let rad = deg * DEG_TO_RAD;
        Iq(self.0 * Complex64::new(rad.cos(), rad.sin()))
    }

    /// Scale both components.
    #[inline]
    pub fn scale(&self, factor: f64) -> Iq {
        Iq(self.0 * factor)
    }

    /// Rescale to the given magnitude. No-op on the zero vector, so missing
    /// data stays missing.
    pub fn with_norm(&self, target: f64) -> Iq {
        let n = self.norm();
        if n == 0.0 {
            *self
        } else {
            self.scale(target / n)
        }
    }
}

impl std::ops::Add for Iq {
    type Output = Iq;
    fn add(self, rhs: Iq) -> Iq {
        Iq(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Iq {
    fn add_assign(&mut self, rhs: Iq) {
        self.0 += rhs.0;
    }
}

/// Wrap an angle in degrees into `[-180, 180)` of a reference angle.
pub fn wrap_to_deg(mut angle: f64, reference: f64) -> f64 {
    while angle - reference < -180.0 {
        angle += 360.0;
    }
    while angle - reference >= 180.0 {
        angle -= 360.0;
    }
    angle
}
