//! Configuration loading.
//!
//! TOML-backed settings for the recovery core. Every field has a default, so
//! an empty file (or no file at all) yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteadfastConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for SteadfastConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_timeout_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            enabled: default_enabled(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 3 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_recovery_timeout_ms() -> u64 { 30_000 }
fn default_enabled() -> bool { true }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30_000 }

impl SteadfastConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                toml::from_str(&content).context("Failed to parse config")?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.success_threshold == 0 {
            anyhow::bail!("circuit_breaker.success_threshold must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("retry.backoff_multiplier must be at least 1.0");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            anyhow::bail!("retry.max_delay_ms must not be below retry.initial_delay_ms");
        }
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            success_threshold: self.circuit_breaker.success_threshold,
            timeout: Duration::from_millis(self.circuit_breaker.timeout_ms),
            recovery_timeout: Duration::from_millis(self.circuit_breaker.recovery_timeout_ms),
            enabled: self.circuit_breaker.enabled,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay_ms: self.retry.initial_delay_ms,
            backoff_multiplier: self.retry.backoff_multiplier,
            max_delay_ms: self.retry.max_delay_ms,
        }
    }
}
