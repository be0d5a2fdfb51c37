//! # Durable Log
//!
//! Subscriber setup shared by the durable crates, their examples and their
//! tests. Library crates only emit events through `tracing`; installing a
//! subscriber is the application's call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! fn main() -> durable_log::LogResult<()> {
//!     // DURABLE_LOG / RUST_LOG decide the filter
//!     durable_log::auto_init()?;
//!
//!     durable_log::info!(size = 4096, "mapping created");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod builder;
mod config;

pub use builder::LoggerBuilder;
pub use config::{Config, DisplayConfig, ENV_FILTER, ENV_FORMAT, Format};

// Re-export tracing macros
pub use tracing::{debug, error, info, trace, warn};

/// Result type for logger operations
pub type LogResult<T> = Result<T, LogError>;

/// Error type for logger operations
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Filter parsing error
    #[error("Invalid filter: {0}")]
    Filter(String),

    /// A global subscriber was installed earlier
    #[error("Logger already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Auto-detect and initialize the best logging configuration
pub fn auto_init() -> LogResult<()> {
    if std::env::var(ENV_FILTER).is_ok() || std::env::var("RUST_LOG").is_ok() {
        init_with(Config::from_env())
    } else if cfg!(debug_assertions) {
        init_with(Config::development())
    } else {
        init_with(Config::production())
    }
}

/// Initialize with default configuration
pub fn init() -> LogResult<()> {
    init_with(Config::default())
}

/// Initialize with custom configuration
pub fn init_with(config: Config) -> LogResult<()> {
    LoggerBuilder::from_config(config).build()
}

/// Initialize for tests; a second call is a no-op
///
/// # Panics
///
/// Panics if the test filter is rejected.
pub fn init_test() {
    if let Err(err) = tolerate_installed(init_with(Config::test())) {
        panic!("test logging setup failed: {err}");
    }
}

// Every test calls init_test; all but the first see AlreadyInitialized.
fn tolerate_installed(result: LogResult<()>) -> LogResult<()> {
    match result {
        Err(LogError::AlreadyInitialized(_)) => Ok(()),
        other => other,
    }
}
