//! Startup configuration. Precedence, highest first: CLI flags, `SPARROW_*`
//! environment variables, the supplied file, built-in defaults.

use std::env;
use std::path::Path;

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use sparrow_api::ApiConfig;
use sparrow_commons::utils::logging::LogConfig;
use tracing::warn;

use crate::cli::RunArgs;
use crate::loader::LoaderConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartupConfig {
    pub api: ApiConfig,
    pub loader: LoaderConfig,
    pub log: LogConfig,
}

impl StartupConfig {
    /// Read the file when given, fall back to defaults when not.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        if let Ok(address) = env::var("SPARROW_API_ADDRESS") {
            match address.parse() {
                Ok(address) => self.api.address = address,
                Err(e) => warn!(%address, error = %e, "ignoring invalid SPARROW_API_ADDRESS"),
            }
        }
        if let Ok(level) = env::var("SPARROW_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(path) = env::var("SPARROW_LOADER_FILE_PATH") {
            self.loader.file.path = path.into();
        }
        if let Ok(url) = env::var("SPARROW_LOADER_HTTP_URL") {
            self.loader.http.url = url;
        }
        if let Ok(token) = env::var("SPARROW_LOADER_HTTP_TOKEN") {
            self.loader.http.token = token;
        }
    }

    pub fn apply_flags(&mut self, args: &RunArgs) {
        if let Some(address) = args.api_address {
            self.api.address = address;
        }
        if let Some(level) = &args.log_level {
            self.log.level = level.clone();
        }
    }
}
