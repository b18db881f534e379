//! Bootstrap HTTP client.
//!
//! `/edge/init` seeds the whole edge state once at startup and its failure
//! is fatal; the validate endpoints back operator-initiated sanity checks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::fieldbus::registers::RegisterDescriptor;
use crate::state::{EdgeBatteryConfig, EdgeTask, Settings};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial edge state document.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeInit {
    pub settings: Settings,
    #[serde(default)]
    pub tasks: Vec<EdgeTask>,
    pub battery_configs: HashMap<String, EdgeBatteryConfig>,
    pub register_map: Vec<RegisterDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

pub struct BootstrapClient {
    http: reqwest::Client,
    base: String,
}

impl BootstrapClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(BOOTSTRAP_TIMEOUT)
            .build()
            .context("failed to build bootstrap HTTP client")?;
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Ok(Self { http, base })
    }

    pub async fn fetch_init(&self) -> Result<EdgeInit> {
        let url = format!("{}/edge/init", self.base);
        self.http
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("bootstrap request failed: {url}"))?
            .json::<EdgeInit>()
            .await
            .context("bootstrap init document is malformed")
    }

    pub async fn validate_state(&self) -> Result<ValidationReport> {
        self.fetch_validation("validate-state").await
    }

    pub async fn validate_modbus(&self) -> Result<ValidationReport> {
        self.fetch_validation("validate-modbus").await
    }

    async fn fetch_validation(&self, endpoint: &str) -> Result<ValidationReport> {
        let url = format!("{}/edge/{}", self.base, endpoint);
        self.http
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("validation request failed: {url}"))?
            .json::<ValidationReport>()
            .await
            .context("validation report is malformed")
    }
}
