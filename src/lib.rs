//! # Radar Refractivity Retrieval Core
//!
//! This crate retrieves near-surface atmospheric refractivity (N) from the
//! phase of ground-clutter radar echoes. The phase of a stationary target
//! shifts as the refractive index along the path changes, so the *range
//! derivative* of clutter phase maps directly to N, and the scan-to-scan
//! phase drift maps to its time derivative.
//!
//! ## Overview
//!
//! Clutter phase is noisy, aliases every 360°, and is only usable where the
//! target really is stationary, which is what makes the retrieval hard. The
//! pipeline:
//!
//! - **Quality estimation**: fuzzy per-cell weights from SNR plus spectrum
//!   width or CPA, applied as I/Q magnitudes so vector sums self-weight
//! - **Phase differencing**: scan-to-scan and scan-to-calibration products
//! - **Adaptive phase smoothing**: constant-physical-footprint windows,
//!   per-beam slope tracking with de-aliasing against an extrapolated guess
//! - **N derivation**: pulse-pair slope of the smoothed field, with errors
//! - **Relaxation** (optional): phase-constrained diffusion that percolates
//!   data-rich regions into data-poor ones
//!
//! ## Signal Flow
//!
//! ```text
//! raw I/Q ─► quality weighting ─► Δφ vs previous scan ─► smooth+fit ─► dN/dt
//!                              └► Δφ vs calibration  ─► smooth+fit ─► N
//!                                         (then optional relaxation + masking)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use refract_core::{
//!     CalibrationRef, GridGeometry, Iq, PolarGrid, RefractParams, ScanInput,
//!     ScanProcessor,
//! };
//!
//! let geom = GridGeometry {
//!     num_beams: 360,
//!     num_gates: 200,
//!     gate_spacing_m: 150.0,
//!     wavelength_m: 0.1,
//! };
//! let calib = CalibrationRef::new(
//!     &geom,
//!     PolarGrid::new(360, 200, Iq::new(1.0, 0.0)),
//!     PolarGrid::new(360, 200, 20.0),
//!     310.0,
//! )?;
//! let mut processor = ScanProcessor::new(geom, RefractParams::default(), calib)?;
//!
//! // One call per sweep; the first scan only primes the state.
//! let scan = ScanInput {
//!     iq: PolarGrid::new(360, 200, Iq::ZERO),
//!     snr: PolarGrid::new(360, 200, None),
//!     indicator: PolarGrid::new(360, 200, None),
//!     beam_valid: None,
//! };
//! if let Some(output) = processor.process_scan(scan)? {
//!     println!("mean N = {:?}", output.mean_n);
//! }
//! # Ok::<(), refract_core::RefractError>(())
//! ```

pub mod calib;
pub mod config;
pub mod phase_diff;
pub mod phase_fit;
pub mod polar_grid;
pub mod processor;
pub mod quality;
pub mod relax;
pub mod types;

pub use calib::CalibrationRef;
pub use config::{GridGeometry, QualitySource, RefractParams};
pub use phase_diff::{RefDiff, ScanDiff};
pub use phase_fit::{FitOutput, PhaseField, PhaseFitter};
pub use polar_grid::PolarGrid;
pub use processor::{ScanInput, ScanOutput, ScanProcessor};
pub use quality::{QualityEstimator, QualityFields};
pub use relax::RelaxationDiffuser;
pub use types::{Iq, RefractError, RefractResult, INVALID, VERY_LARGE};
