use std::path::Path;

use anyhow::{anyhow, Context, Result};
use compliance_kernel_core::PipelineConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENDPOINT_TIMEOUT_MS: u64 = 2_000;

/// Everything the facade needs beyond the database path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub pipeline: PipelineConfig,
    pub phrasing: Option<EndpointConfig>,
    pub embedding: Option<EndpointConfig>,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RolloutConfig {
    /// Share of rollout keys, in percent, that get hybrid concept matching.
    pub hybrid_percent: u8,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_ENDPOINT_TIMEOUT_MS
}

impl KernelConfig {
    /// Load configuration from an optional YAML file. A missing path yields defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the document is not valid YAML or fails validation.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw).context("failed to parse YAML config")?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when any section holds an out-of-range value.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate().map_err(|err| anyhow!("{err}"))?;
        if self.rollout.hybrid_percent > 100 {
            return Err(anyhow!("rollout.hybrid_percent MUST be in [0, 100]"));
        }
        for (name, endpoint) in [("phrasing", &self.phrasing), ("embedding", &self.embedding)] {
            if let Some(endpoint) = endpoint {
                if endpoint.url.trim().is_empty() {
                    return Err(anyhow!("{name}.url MUST NOT be empty"));
                }
                if endpoint.timeout_ms == 0 {
                    return Err(anyhow!("{name}.timeout_ms MUST be at least 1"));
                }
            }
        }
        Ok(())
    }
}
