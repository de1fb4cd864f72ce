use std::path::Path;

use config::{Config, Environment, File};
use ociclient::client::DEFAULT_UPLOAD_CHUNK_SIZE;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Settings shared by both commands. Command line flags are applied on top.
#[derive(Debug, Clone, Deserialize)]
pub struct CharonConfig {
    /// Registry host, optionally with a scheme and port
    pub registry: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub upload_chunk_size: usize,
}

impl CharonConfig {
    /// Layered load: defaults, then the system and local config files, then
    /// `extra_file`, then `DOCKER_CHARON_*` environment variables.
    pub fn load(extra_file: Option<&Path>) -> Result<Self> {
        Self::load_with_env(extra_file, environment())
    }

    fn load_with_env(extra_file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("insecure", false)?
            .set_default("upload_chunk_size", DEFAULT_UPLOAD_CHUNK_SIZE as u64)?
            .add_source(File::with_name("/etc/docker-charon/config").required(false))
            .add_source(File::with_name("config/default").required(false));

        if let Some(path) = extra_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        if config.upload_chunk_size == 0 {
            return Err(Error::Config("upload_chunk_size must not be 0".into()));
        }
        Ok(config)
    }

    pub fn registry(&self) -> Result<&str> {
        self.registry
            .as_deref()
            .filter(|registry| !registry.is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "no registry given, use --registry or set DOCKER_CHARON_REGISTRY".into(),
                )
            })
    }

    /// Credentials, when both halves are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

// single underscores separate the prefix, double ones nest
fn environment() -> Environment {
    Environment::with_prefix("DOCKER_CHARON")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
