//! # Interpolation
//!
//! Computes concrete attribute values from interpolator specification strings
//! and the current (real or virtual) simulation time.
//!
//! A specification is a string of the form `kind(payload)`. Strings that do
//! not carry a recognized kind pass through unchanged as literals. Instances
//! are memoized per exact specification string so stateful kinds (random
//! walks, scripted attributes) keep their continuity across repeated
//! resolutions within one simulation run.

pub mod date_increment;
pub mod error;
pub mod multiline;
pub mod resolver;
pub mod script;
pub mod spec;
pub mod text_rotation;
pub mod timeseries;

pub use error::ValueError;
pub use resolver::{ResolutionContext, Resolver};
pub use script::AttributeLookup;
pub use spec::InterpolatorKind;

/// Current version of the interpolation crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of decimal hours in one interpolation cycle
pub const HOURS_PER_CYCLE: f64 = 24.0;

/// Seconds per decimal hour
pub const SECONDS_PER_HOUR: f64 = 3600.0;
