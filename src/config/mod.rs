//! Configuration loading.
//!
//! Values come from an optional `config/default` file, overridden by
//! `RELAYMQ_`-prefixed environment variables using `__` as the section
//! separator (`RELAYMQ_BROKER__DEFAULT_PREFETCH=10`). Anything unset falls back
//! to `Settings::default()`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LogSettings, ServerSettings, Settings};

pub const ENV_PREFIX: &str = "RELAYMQ";

/// Read `config/default` and the `RELAYMQ_*` environment, then fill every
/// unset key from `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let partial: PartialSettings = builder.build()?.try_deserialize()?;
    Ok(partial.resolve())
}
