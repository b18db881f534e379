//! Startup surface: exactly the bootstrap URL, the group id, and the
//! optional log level and tick period. Everything else arrives from
//! bootstrap and the config bus.

use anyhow::{Context, Result};
use figment::{providers::Env, Figment};
use serde::Deserialize;
use validator::Validate;

/// Loaded from `CONSUS_EDGE__*` environment variables; the first CLI
/// argument, when present, overrides the bootstrap URL.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartupConfig {
    #[validate(url)]
    pub bootstrap_url: String,

    #[validate(length(min = 1))]
    pub group_id: String,

    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub tick_seconds: Option<u64>,
}

impl StartupConfig {
    pub fn load(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut config: StartupConfig = Figment::new()
            .merge(Env::prefixed("CONSUS_EDGE__").split("__"))
            .extract()
            .context("startup configuration is incomplete; set CONSUS_EDGE__BOOTSTRAP_URL and CONSUS_EDGE__GROUP_ID")?;

        if let Some(url) = args.next() {
            config.bootstrap_url = url;
        }

        config
            .validate()
            .context("startup configuration validation failed")?;
        Ok(config)
    }
}
