//! Tracing subscriber setup shared by the service binaries
//!
//! The subscriber is installed before configuration is loaded so that the
//! loader's own messages are emitted. The configured level is applied
//! afterwards through a reload handle unless `RUST_LOG` is set.

use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::error::{Error, Result};

/// Level used until the configuration has been read
pub const STARTUP_LEVEL: &str = "info";

/// Build filter directives that apply `level` to each of `targets`
pub fn filter_directives(targets: &[&str], level: &str) -> String {
    targets
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Handle to the installed filter
pub struct LogFilter {
    handle: reload::Handle<EnvFilter, Registry>,
    targets: Vec<String>,
    from_env: bool,
}

impl LogFilter {
    fn new(handle: reload::Handle<EnvFilter, Registry>, targets: &[&str], from_env: bool) -> Self {
        Self {
            handle,
            targets: targets.iter().map(|t| t.to_string()).collect(),
            from_env,
        }
    }

    /// Switch to the configured level; a `RUST_LOG` filter is left alone
    pub fn apply_level(&self, level: &str) -> Result<()> {
        if self.from_env {
            return Ok(());
        }
        let targets: Vec<&str> = self.targets.iter().map(String::as_str).collect();
        let filter = EnvFilter::try_new(filter_directives(&targets, level))
            .map_err(|e| Error::Config(format!("Invalid log level {:?}: {}", level, e)))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Config(format!("Failed to apply log level: {}", e)))
    }
}

/// Install the global subscriber for `targets` at the startup level
pub fn init(targets: &[&str]) -> LogFilter {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (
            EnvFilter::new(filter_directives(targets, STARTUP_LEVEL)),
            false,
        ),
    };
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    LogFilter::new(handle, targets, from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives() {
        assert_eq!(
            filter_directives(&["skymark_relay", "skymark_common"], "debug"),
            "skymark_relay=debug,skymark_common=debug"
        );
    }

    #[test]
    fn test_apply_level_reloads_filter() {
        let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        let log_filter = LogFilter::new(handle.clone(), &["skymark_scorer"], false);

        log_filter.apply_level("warn").unwrap();
        let current = handle.with_current(|f| f.to_string()).unwrap();
        assert_eq!(current, "skymark_scorer=warn");

        assert!(matches!(
            log_filter.apply_level("not a level!"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_env_filter_is_kept() {
        let (_layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("trace"));
        let log_filter = LogFilter::new(handle.clone(), &["skymark_scorer"], true);

        log_filter.apply_level("error").unwrap();
        let current = handle.with_current(|f| f.to_string()).unwrap();
        assert_eq!(current, "trace");
    }
}
