// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Runtime configuration.
//!
//! Every guard takes explicit numbers; the defaults here are the values
//! the bundled binary chooses when no configuration file is given.
//!
//! ```
//! use wallet_ledger::LedgerConfig;
//!
//! let config = LedgerConfig::from_json(r#"{
//!     "store": { "lock_timeout_ms": 250 },
//!     "guards": {
//!         "rate_limit": { "limit": 10, "window_ms": 60000 },
//!         "circuit_breaker": { "failure_threshold": 5, "reset_timeout_ms": 30000, "half_open_max": 1 }
//!     },
//!     "outbox": { "aggregate_type": "wallet" }
//! }"#).unwrap();
//! assert_eq!(config.guards.rate_limit.limit, 10);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub guards: GuardConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl LedgerConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate_limit = &self.guards.rate_limit;
        if rate_limit.limit == 0 || rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.limit and rate_limit.window_ms must be positive".into(),
            ));
        }
        let breaker = &self.guards.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.half_open_max == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.failure_threshold and circuit_breaker.half_open_max must be positive"
                    .into(),
            ));
        }
        if self.outbox.aggregate_type.trim().is_empty() {
            return Err(ConfigError::Invalid("outbox.aggregate_type is empty".into()));
        }
        Ok(())
    }
}

/// Account store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Longest a command waits for an account row lock.
    pub lock_timeout_ms: u64,
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: usize,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 60,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max: u32,
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Aggregate type stamped on every draft.
    pub aggregate_type: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            aggregate_type: "wallet".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = LedgerConfig::from_json(r#"{ "store": { "lock_timeout_ms": 100 } }"#).unwrap();
        assert_eq!(config.store.lock_timeout(), Duration::from_millis(100));
        assert_eq!(config.guards, GuardConfig::default());
        assert_eq!(config.outbox.aggregate_type, "wallet");
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let result = LedgerConfig::from_json(
            r#"{ "guards": { "rate_limit": { "limit": 0, "window_ms": 1000 } } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_half_open_quota_is_rejected() {
        let result = LedgerConfig::from_json(
            r#"{ "guards": { "circuit_breaker": { "failure_threshold": 2, "reset_timeout_ms": 10, "half_open_max": 0 } } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            LedgerConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }
}
