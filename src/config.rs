//! Configuration loader and validator for immo-watch.
use crate::model::{ListingSource, NewSource, ValidationError};
use crate::registry::{RegisteredSource, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid source {name:?}: {source}")]
    SourceField {
        name: String,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid source: {0}")]
    Source(#[from] RegistryError),
    #[error("Duplicate source name {0:?}")]
    DuplicateSource(String),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    /// Sources inserted at startup when no source with the same name exists.
    #[serde(default)]
    pub sources: Vec<NewSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/immo-watch.db", self.app.resolved_data_dir())
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let mut names = HashSet::new();
    for src in &cfg.sources {
        src.validate().map_err(|source| ConfigError::SourceField {
            name: src.name.clone(),
            source,
        })?;
        if !names.insert(src.name.as_str()) {
            return Err(ConfigError::DuplicateSource(src.name.clone()));
        }
        // Same checks the registry applies when loading from the database.
        RegisteredSource::compile(ListingSource {
            id: 0,
            name: src.name.clone(),
            host_regex: src.host_regex.clone(),
            order_query_string: src.order_query_string.clone(),
        })?;
    }
    Ok(())
}

/// Example YAML used by `immo-watch init` and the tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

sources:
  - name: "ExampleSite"
    host_regex: "^https://www\\.example\\.com/"
    order_query_string: "sort=date_desc"
  - name: "OtherSite"
    host_regex: "^https://annonces\\.other\\.test/"
    order_query_string: "tri=publication"
"#
}
