//! Layered client configuration: file, then `GROVE_` environment, then flags.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use grove_client::ClientConfig;
use std::path::Path;

/// Values given on the command line; they win over every other source.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub full_fetch: bool,
}

/// Builds the client configuration.
///
/// Environment keys nest with `__`, e.g. `GROVE_IDENTITY__EMAIL`.
pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<ClientConfig> {
    let mut builder = Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder = builder
        .add_source(
            Environment::with_prefix("GROVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("endpoint", overrides.endpoint.clone())?
        .set_override_option("identity.name", overrides.name.clone())?
        .set_override_option("identity.email", overrides.email.clone())?;
    if overrides.full_fetch {
        builder = builder.set_override("partial_fetch", false)?;
    }

    let config: ClientConfig = builder
        .build()
        .context("reading configuration")?
        .try_deserialize()
        .context("invalid configuration (is an endpoint set?)")?;
    Ok(config)
}
