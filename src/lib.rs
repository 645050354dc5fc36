//! # jetflow
//!
//! Particle-level energy-flow matching between a reconstructed jet and its generator-level
//! counterpart. For every (reco, truth) jet pair, `jetflow` decides which particle pairs are
//! admissible, resolves conflicts between them, and fits a fractional transfer matrix whose entry
//! $`(i, j)`$ is the share of truth particle $`j`$'s transverse momentum attributed to
//! reconstructed particle $`i`$.
//!
//! The pipeline is driven by a [`Matcher`](crate::matcher::Matcher):
//!
//! 1. assign resolutions to the reconstructed particles ([`uncertainty`]),
//! 2. collect admissible truth candidates per reco particle ([`filter`], [`prefit`],
//!    [`recovery`]) and resolve conflicts ([`refine`]),
//! 3. build a chi-square loss over the ambiguous entries ([`loss`]) and minimize it with a
//!    bounded optimizer ([`optimizer`]),
//! 4. refine the fit by greedily dropping particles and clipping negligible entries.
//!
//! ```ignore
//! use jetflow::{data::{Jet, Particle}, matcher::Matcher, MatchingConfig};
//!
//! let reco = Jet::new(vec![Particle::new(50.0, 0.1, 0.2, 211, 1)]);
//! let truth = Jet::new(vec![Particle::new(52.0, 0.1, 0.21, 211, 1)]);
//! let matcher = Matcher::fit(&reco, &truth, &MatchingConfig::default())?;
//! println!("{}", matcher.ptrans());
//! ```
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Particle and jet containers.
pub mod data;
/// Candidate admissibility checks between reconstructed and truth particles.
pub mod filter;
/// Jet-level pairing and batch processing of jet pairs.
pub mod jets;
/// The chi-square objective minimized by the [`Matcher`](crate::matcher::Matcher).
pub mod loss;
/// The matching state machine.
pub mod matcher;
/// Bounded parameter minimization.
pub mod optimizer;
/// Per-particle candidate selection strategies.
pub mod prefit;
/// Recovery of truth particles the detector reconstructs under a different flavor.
pub mod recovery;
/// Conflict resolution between overlapping candidate lists.
pub mod refine;
/// Detector resolution models.
pub mod uncertainty;
/// Utility functions, enums, and traits
pub mod utils;

pub use crate::data::{Jet, Particle};
pub use crate::matcher::{MatchResult, Matcher};
pub use crate::utils::enums::Flavor;

/// A floating-point number type (defaults to [`f64`], see `f32` feature).
#[cfg(not(feature = "f32"))]
pub type Float = f64;

/// A floating-point number type (defaults to [`f64`], see `f32` feature).
#[cfg(feature = "f32")]
pub type Float = f32;

/// The mathematical constant $`\pi`$.
#[cfg(not(feature = "f32"))]
pub const PI: Float = std::f64::consts::PI;

/// The mathematical constant $`\pi`$.
#[cfg(feature = "f32")]
pub const PI: Float = std::f32::consts::PI;

/// Every tunable piece of a [`Matcher`](crate::matcher::Matcher), gathered in one place.
///
/// The defaults follow a CMS-like detector and are meant as a reasonable starting point rather
/// than a calibrated setup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Resolution model applied to reconstructed particles.
    pub uncertainty: uncertainty::UncertaintyConfig,
    /// Per-flavor admissibility checks.
    pub filter: filter::FilterConfig,
    /// Per-flavor candidate selection strategies.
    pub prefit: prefit::PrefitConfig,
    /// Conflict resolution applied after prefitting.
    pub refiner: refine::RefinerStrategy,
    /// Penalty for reconstructed particles without any truth counterpart.
    pub pileup: loss::PileupConfig,
    /// Lost-particle recovery.
    pub recovery: recovery::RecoveryConfig,
    /// Post-fit refinement.
    pub refit: matcher::RefitConfig,
    /// Options forwarded to the optimizer.
    pub minimizer: optimizer::MinimizerOptions,
}

/// The error type used by all `jetflow` internal methods
#[derive(Error, Debug)]
pub enum FlowError {
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// A binned table whose length does not match the number of regions it is binned in.
    #[error("Table \"{table}\" has {found} entries but {expected} were expected!")]
    TableSizeMismatch {
        /// Name of the offending table
        table: String,
        /// Number of regions implied by the boundaries
        expected: usize,
        /// Number of entries supplied
        found: usize,
    },
    /// A per-flavor ensemble built from the wrong number of members.
    #[error("A per-flavor ensemble needs {expected} members but {found} were given!")]
    EnsembleShape {
        /// Number of flavors
        expected: usize,
        /// Number of members supplied
        found: usize,
    },
    /// A pseudorapidity outside every region of a binned table.
    #[error("|eta| = {eta} lies outside every region of \"{table}\"!")]
    EtaOutOfRange {
        /// The offending pseudorapidity
        eta: Float,
        /// Name of the table being looked up
        table: String,
    },
    /// A particle whose (pdgid, charge) pair does not correspond to any known flavor.
    #[error("Unknown particle flavor (pdgid = {pdgid}, charge = {charge})!")]
    UnknownFlavor {
        /// Absolute particle-type code
        pdgid: u32,
        /// Electric charge
        charge: i32,
    },
    /// A [`Matcher`](crate::matcher::Matcher) step invoked out of order.
    #[error("Cannot enter state \"{to}\" from state \"{from}\"!")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },
    /// A [`Matcher`](crate::matcher::Matcher) output requested before the step producing it.
    #[error("\"{operation}\" is unavailable in state \"{state}\"!")]
    NotReady {
        /// Requested operation
        operation: String,
        /// Current state
        state: String,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

/// A [`Result`] type alias for [`FlowError`]s.
pub type FlowResult<T> = Result<T, FlowError>;
