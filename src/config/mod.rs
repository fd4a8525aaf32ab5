//! The `config` module loads node settings.
//!
//! Sources, later ones winning:
//! - built-in defaults (`Settings::default()`)
//! - an optional `config/default.{toml,yaml,json}` file
//! - environment variables prefixed `CLUSTERMQ`, sections separated by `__`
//!   (for example `CLUSTERMQ__NODE__PORT=7700`)

mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    ClusterSettings, DestinationSettings, LoggingSettings, NodeSettings, PartialSettings,
    PersistenceSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// and merges it over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit file path (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("CLUSTERMQ")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("cluster.peers")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::default().merge(partial))
}

#[cfg(test)]
mod tests;
