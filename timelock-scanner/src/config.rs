// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scanner configuration
//!
//! Loaded from a YAML file. `${VAR}` placeholders are replaced with environment
//! variables before parsing, and every field has a default so an empty file is
//! a valid configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::store::ChainInfo;

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 14 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub scanner: ScanConfig,
    #[serde(default)]
    pub refresher: RefresherConfig,
    // Static chain list. When empty, chains come from the `support_chains` table.
    #[serde(default)]
    pub chains: Vec<ChainInfo>,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl ScannerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scanner config file: {:?}", path))?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let contents = substitute_env_vars(contents)?;
        // serde_yaml rejects an empty document, treat it as "all defaults".
        let config: ScannerConfig = if contents.trim().is_empty() {
            ScannerConfig::default()
        } else {
            serde_yaml::from_str(&contents).context("Failed to parse scanner config YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scanner.batch_size == 0 {
            bail!("scanner.batch_size must be greater than zero");
        }
        if self.refresher.batch_size == 0 {
            bail!("refresher.batch_size must be greater than zero");
        }
        // Both feed `tokio::time::interval`, which rejects a zero period.
        if self.refresher.interval_secs == 0 {
            bail!("refresher.interval_secs must be greater than zero");
        }
        if self.scanner.health_check_interval_secs == 0 {
            bail!("scanner.health_check_interval_secs must be greater than zero");
        }
        if self.rpc.max_retry_delay_ms == 0 {
            bail!("rpc.max_retry_delay_ms must be greater than zero");
        }
        if self.rpc.max_concurrent_requests == 0 {
            bail!("rpc.max_concurrent_requests must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.rpc.randomization_factor) {
            bail!("rpc.randomization_factor must be within [0, 1]");
        }
        Ok(())
    }
}

fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .context("Failed to compile env placeholder pattern")?;

    // Unset variables keep their placeholder.
    let substituted = re.replace_all(content, |caps: &Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| {
            tracing::warn!("[Config] ${{{}}} is not set, left as is", &caps[1]);
            caps[0].to_string()
        })
    });
    Ok(substituted.into_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    // Substituted for `{API_KEY}` in chain rpc url templates.
    #[serde(default)]
    pub provider_key: String,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub randomization_factor: f64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_dial_timeout_secs() -> u64 {
    10
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_max_concurrent_requests() -> usize {
    4
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            provider_key: String::new(),
            dial_timeout_secs: default_dial_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            randomization_factor: 0.0,
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl RpcConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,
    #[serde(default = "default_slow_interval_secs")]
    pub slow_interval_secs: u64,
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,
    // Lag (in blocks) above which the scanner keeps polling on the fast interval.
    #[serde(default = "default_far_behind_threshold")]
    pub far_behind_threshold: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_scanner_stop_timeout_secs")]
    pub scanner_stop_timeout_secs: u64,
    #[serde(default = "default_background_stop_timeout_secs")]
    pub background_stop_timeout_secs: u64,
    #[serde(default)]
    pub include_testnets: bool,
    // Fail the whole block range when a single log cannot be resolved.
    #[serde(default)]
    pub strict_log_processing: bool,
    #[serde(default = "default_log_concurrency")]
    pub log_concurrency: usize,
    // First block to scan for chains without stored progress, keyed by chain id.
    #[serde(default)]
    pub start_blocks: HashMap<u64, u64>,
}

fn default_batch_size() -> u64 {
    100
}

fn default_confirmations() -> u64 {
    12
}

fn default_fast_interval_ms() -> u64 {
    1_000
}

fn default_slow_interval_secs() -> u64 {
    15
}

fn default_error_cooldown_secs() -> u64 {
    30
}

fn default_far_behind_threshold() -> u64 {
    100
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_scanner_stop_timeout_secs() -> u64 {
    30
}

fn default_background_stop_timeout_secs() -> u64 {
    10
}

fn default_log_concurrency() -> usize {
    4
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            confirmations: default_confirmations(),
            fast_interval_ms: default_fast_interval_ms(),
            slow_interval_secs: default_slow_interval_secs(),
            error_cooldown_secs: default_error_cooldown_secs(),
            far_behind_threshold: default_far_behind_threshold(),
            health_check_interval_secs: default_health_check_interval_secs(),
            scanner_stop_timeout_secs: default_scanner_stop_timeout_secs(),
            background_stop_timeout_secs: default_background_stop_timeout_secs(),
            include_testnets: false,
            strict_log_processing: false,
            log_concurrency: default_log_concurrency(),
            start_blocks: HashMap::new(),
        }
    }
}

impl ScanConfig {
    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_secs(self.slow_interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn scanner_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.scanner_stop_timeout_secs)
    }

    pub fn background_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.background_stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherConfig {
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_refresh_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_grace_period_secs")]
    pub default_grace_period_secs: u64,
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_refresh_batch_size() -> i64 {
    100
}

fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval_secs(),
            batch_size: default_refresh_batch_size(),
            default_grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl RefresherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub webhooks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}
