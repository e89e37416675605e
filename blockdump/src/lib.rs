//! Blockdump Library
//!
//! Dumps a remote page's block tree to a self-contained directory and
//! migrates such a dump under a new remote parent. Both run as jobs of a
//! bounded [`JobManager`](jobs::JobManager).

pub mod config;
pub mod dump;
pub mod history;
pub mod jobs;
pub mod migrate;
pub mod model;
pub mod progress;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use jobs::{Job, JobEvent, JobKind, JobManager, JobSettings, JobState};
pub use remote::{HttpClient, RemoteClient, RetryPolicy, RetryingClient};
pub use store::DumpStore;
pub use utils::errors::{EngineError, ErrorKind, RemoteError, Result};
