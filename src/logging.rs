//! Tracing subscriber setup
//!
//! Embedders call [`init`] once at startup. `RUST_LOG` takes precedence over
//! the configured filter so a deployment can be made chattier without
//! editing its config file.

use tracing_subscriber::EnvFilter;

use crate::runtime::LogConfig;

/// Install the global tracing subscriber described by `config`
///
/// Returns `false` when a global subscriber was already installed, in which
/// case the existing one is kept.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        tracing::debug!(filter = %config.filter, json = config.json, "logging initialized");
    }
    installed
}

