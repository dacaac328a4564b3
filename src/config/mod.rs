//! Configuration loading.
//!
//! Values come from, lowest priority first: built-in defaults, an optional
//! `config/default.{toml,yaml,json}` file, and `PUBSUB__SECTION__KEY`
//! environment variables.

mod settings;

use config::{Config, Environment, File};

use crate::utils::Result;

pub use settings::{BrokerSettings, LoggingSettings, PartialSettings, ServerSettings, Settings};

/// Loads the configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings> {
    load_config_from("config/default")
}

/// Same as [`load_config`], reading the file layer from `path` (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("PUBSUB")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = partial.merge_onto(Settings::default());
    settings.broker.validate()?;
    Ok(settings)
}
