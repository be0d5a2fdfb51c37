//! Logger builder implementation

use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, DisplayConfig, Format};
use crate::{LogError, LogResult};

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Apply display options to a fmt layer and install it.
/// Timestamps change the layer type, so both branches are spelled out.
macro_rules! install_fmt_layer {
    ($registry:expr, $layer:expr, $display:expr) => {{
        let display: &DisplayConfig = $display;
        let layer = $layer
            .with_ansi(display.colors)
            .with_target(display.target)
            .with_file(display.source)
            .with_line_number(display.source)
            .with_thread_ids(display.thread_ids);
        if display.time {
            $registry.with(layer).try_init()
        } else {
            $registry.with(layer.without_time()).try_init()
        }
    }};
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Access the configuration the builder will install
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Filter string cannot be parsed
    /// - A global subscriber is already installed
    pub fn build(self) -> LogResult<()> {
        let filter = EnvFilter::try_new(&self.config.level)
            .map_err(|e| LogError::Filter(format!("{}: {}", self.config.level, e)))?;

        let registry = Registry::default().with(filter);
        let display = &self.config.display;

        let installed = match self.config.format {
            Format::Pretty => install_fmt_layer!(registry, fmt::layer().pretty(), display),
            Format::Compact => install_fmt_layer!(registry, fmt::layer().compact(), display),
            Format::Json => install_fmt_layer!(registry, fmt::layer().json(), display),
        };

        installed.map_err(|e| LogError::AlreadyInitialized(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_rejected_before_install() {
        let config = Config {
            level: "durable_pmem=[".to_string(),
            ..Config::test()
        };
        let err = LoggerBuilder::from_config(config).build().unwrap_err();
        assert!(matches!(err, LogError::Filter(_)));
    }
}
