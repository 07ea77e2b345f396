//! # Ember Core
//!
//! Shared vocabulary for the ember execution engine.
//!
//! This crate holds the types every layer agrees on but none owns:
//!
//! - **Values**: a minimal dynamic value classification for type speculation
//! - **Options**: the engine configuration surface and the name filter
//! - **Errors**: the compile-failure taxonomy and the failure-action policy
//! - **Cancellation**: the cooperative token handed to compiler backends

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod options;
pub mod value;

pub use cancel::CancellationToken;
pub use error::{AssumptionInvalid, CompileError, FailureAction};
pub use options::{CompileFilter, EngineOptions};
pub use value::{Value, ValueKind};

/// Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
