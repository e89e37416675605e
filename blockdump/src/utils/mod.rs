//! Utility modules shared across the crate.

pub mod errors;
pub mod ids;
pub mod logger;

pub use errors::{EngineError, ErrorKind, RemoteError, Result};
