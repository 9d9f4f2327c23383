//!
//! Maestro Configuration - component configuration queries
//!
//! This crate implements the configuration key format shared between the
//! control plane and its companion tools:
//!
//! ```text
//! <component>/<RUNTYPE>/<rolename>/<entry>[@<timestamp>]
//! ```
//!
//! The grammar is an external contract: keys are rendered canonically with
//! `@` before the timestamp, or raw with `/`, and both renderings must
//! round-trip through [`Query`] without loss.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Error types
pub mod error;

/// Query parsing and rendering
pub mod query;

/// Run type enumeration
pub mod run_type;

pub use error::QueryError;
pub use query::{Query, CONFIG_COMPONENTS_PATH, SEPARATOR};
pub use run_type::RunType;
