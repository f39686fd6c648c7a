use std::sync::Once;

use env_logger::fmt::TimestampPrecision;

/// Filter used when neither the config nor `RUST_LOG` names one.
///
/// Other crates stay at `warn`; this crate and the demo report wraps, ring
/// creation and long fence waits at `info` and above.
pub const DEFAULT_FILTER: &str = "warn,tessera_gpu=info,tessera_demo=info";

/// Logger configuration.
///
/// `env_filter` follows the `env_logger` filter syntax, e.g.
/// "tessera_gpu::sync=debug" to trace every fence wait.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,
    pub write_style: env_logger::WriteStyle,

    /// Timestamp precision; `None` drops timestamps (deterministic test output).
    pub timestamps: Option<TimestampPrecision>,

    /// Prefix lines with the module path, which names the layer (ring, sync, ...).
    pub module_path: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            env_filter: None,
            write_style: env_logger::WriteStyle::Auto,
            timestamps: Some(TimestampPrecision::Millis),
            module_path: true,
        }
    }
}

impl LoggingConfig {
    /// Config with an explicit filter, ignoring `RUST_LOG`.
    pub fn with_filter(filter: impl Into<String>) -> Self {
        Self {
            env_filter: Some(filter.into()),
            ..Self::default()
        }
    }

    /// Filter this config resolves to.
    ///
    /// Precedence: `env_filter`, then `RUST_LOG`, then [`DEFAULT_FILTER`].
    pub fn resolved_filter(&self) -> String {
        self.env_filter
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_owned())
    }

    fn builder(&self) -> env_logger::Builder {
        let mut builder = env_logger::Builder::new();
        builder
            .parse_filters(&self.resolved_filter())
            .write_style(self.write_style)
            .format_timestamp(self.timestamps)
            .format_module_path(self.module_path);
        builder
    }
}

static INIT: Once = Once::new();

/// Installs the global logger on first call; later calls are ignored.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        // A test harness may already have installed a logger.
        if config.builder().try_init().is_err() {
            return;
        }
        log::debug!("logging initialized ({})", config.resolved_filter());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::LevelFilter;

    #[test]
    fn explicit_filter_wins() {
        let config = LoggingConfig::with_filter("tessera_gpu=trace");
        assert_eq!(config.resolved_filter(), "tessera_gpu=trace");
        assert_eq!(config.builder().build().filter(), LevelFilter::Trace);
    }

    #[test]
    fn default_filter_caps_at_info() {
        let config = LoggingConfig::with_filter(DEFAULT_FILTER);
        assert_eq!(config.builder().build().filter(), LevelFilter::Info);
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_logging(LoggingConfig {
            timestamps: None,
            ..LoggingConfig::with_filter("tessera_gpu=debug")
        });
        init_logging(LoggingConfig::default());
        log::debug!("still logging");
    }
}
