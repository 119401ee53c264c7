mod settings;

use config::{Config, Environment, File};

use settings::PartialSettings;

use crate::utils::error::Result;

pub use settings::{
    AmqpSettings, ConsumerSettings, ExchangeSettings, LoggingSettings, Settings,
};

/// Prefix for environment overrides, e.g. `PERIL_AMQP__URL`.
pub const ENV_PREFIX: &str = "PERIL";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct with every section filled in
pub fn load_config() -> Result<Settings> {
    load_config_from("config/default")
}

/// Same as `load_config` but reads the optional file at `path` (extension
/// inferred by the `config` crate).
pub fn load_config_from(path: &str) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}

#[cfg(test)]
mod tests;
