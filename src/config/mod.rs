//! Layered configuration.
//!
//! Values come from an optional config file and from `MQBROKER__*`
//! environment variables (e.g. `MQBROKER__SERVER__PORT=1888`). Anything left
//! unset falls back to `Settings::default()`.

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    AuthSettings, BrokerSettings, LogSettings, PersistenceSettings, ServerSettings, Settings,
};

const ENV_PREFIX: &str = "MQBROKER";
const ENV_SEPARATOR: &str = "__";

/// Loads the configuration from `config/default` (any supported format) and
/// environment variables, merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load(File::with_name("config/default").required(false))
}

/// Loads the configuration from an explicit file, which must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    load(File::from(path.as_ref()).required(true))
}

fn load<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
