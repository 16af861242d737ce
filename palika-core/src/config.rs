//! Configuration types
//!
//! [`RealtimeConfig`] can be built three ways: `Default`, a TOML file
//! ([`RealtimeConfig::from_path`]) or environment variables
//! ([`RealtimeConfig::from_env`]). Every path should be followed by
//! [`RealtimeConfig::validate`].

use crate::{ConfigError, PalikaError, PalikaResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Backoff policy for opening (and reopening) change-feed channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Delay before the second attempt, in milliseconds.
    pub initial_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Random jitter added on top of each delay, in milliseconds.
    pub jitter_ms: u64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 200,
            max_ms: 10_000,
            multiplier: 2.0,
            jitter_ms: 50,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = (self.initial_ms as f64) * self.multiplier.powi(exponent);
        let capped = if base.is_finite() {
            (base as u64).min(self.max_ms)
        } else {
            self.max_ms
        };
        Duration::from_millis(jittered(capped, self.jitter_ms))
    }
}

fn jittered(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}

/// What happens to invalidations that arrive while a refetch is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Fold them into the in-flight refetch. A burst costs one query while it
    /// lands; the result stays stale and the next read refetches it.
    Absorb,
    /// Run one more refetch once the in-flight one completes.
    #[default]
    Trailing,
}

impl FromStr for CoalescePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "absorb" => Ok(Self::Absorb),
            "trailing" => Ok(Self::Trailing),
            other => Err(ConfigError::InvalidValue {
                field: "cache.coalesce".to_string(),
                value: other.to_string(),
                reason: "expected 'absorb' or 'trailing'".to_string(),
            }),
        }
    }
}

/// Query cache policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CachePolicyConfig {
    #[serde(default)]
    pub coalesce: CoalescePolicy,
}

/// Master configuration for the realtime core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub cache: CachePolicyConfig,
}

impl RealtimeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> PalikaResult<Self> {
        toml::from_str(contents).map_err(|e| {
            PalikaError::Config(ConfigError::Parse {
                reason: e.to_string(),
            })
        })
    }

    /// Read and parse a TOML file.
    pub fn from_path(path: &Path) -> PalikaResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PalikaError::Config(ConfigError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        Self::from_toml_str(&contents)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `PALIKA_RECONNECT_INITIAL_MS` (default: 200)
    /// - `PALIKA_RECONNECT_MAX_MS` (default: 10000)
    /// - `PALIKA_RECONNECT_MULTIPLIER` (default: 2.0)
    /// - `PALIKA_RECONNECT_JITTER_MS` (default: 50)
    /// - `PALIKA_RECONNECT_MAX_ATTEMPTS` (default: 5)
    /// - `PALIKA_CACHE_COALESCE`: "absorb" or "trailing" (default: trailing)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = ReconnectConfig::default();

        Self {
            reconnect: ReconnectConfig {
                initial_ms: env_parse("PALIKA_RECONNECT_INITIAL_MS")
                    .unwrap_or(defaults.initial_ms),
                max_ms: env_parse("PALIKA_RECONNECT_MAX_MS").unwrap_or(defaults.max_ms),
                multiplier: env_parse("PALIKA_RECONNECT_MULTIPLIER")
                    .unwrap_or(defaults.multiplier),
                jitter_ms: env_parse("PALIKA_RECONNECT_JITTER_MS").unwrap_or(defaults.jitter_ms),
                max_attempts: env_parse("PALIKA_RECONNECT_MAX_ATTEMPTS")
                    .unwrap_or(defaults.max_attempts),
            },
            cache: CachePolicyConfig {
                coalesce: env_parse("PALIKA_CACHE_COALESCE").unwrap_or_default(),
            },
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - reconnect.initial_ms > 0
    /// - reconnect.max_ms >= reconnect.initial_ms
    /// - reconnect.multiplier >= 1.0 and finite
    /// - reconnect.max_attempts > 0
    pub fn validate(&self) -> PalikaResult<()> {
        let reconnect = &self.reconnect;

        if reconnect.initial_ms == 0 {
            return Err(invalid(
                "reconnect.initial_ms",
                reconnect.initial_ms.to_string(),
                "must be > 0",
            ));
        }

        if reconnect.max_ms < reconnect.initial_ms {
            return Err(invalid(
                "reconnect.max_ms",
                reconnect.max_ms.to_string(),
                "must be >= reconnect.initial_ms",
            ));
        }

        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return Err(invalid(
                "reconnect.multiplier",
                reconnect.multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }

        if reconnect.max_attempts == 0 {
            return Err(invalid(
                "reconnect.max_attempts",
                reconnect.max_attempts.to_string(),
                "must be > 0",
            ));
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn invalid(field: &str, value: String, reason: &str) -> PalikaError {
    PalikaError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(RealtimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial_uses_defaults() {
        let config = RealtimeConfig::from_toml_str(
            r#"
            [cache]
            coalesce = "absorb"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.coalesce, CoalescePolicy::Absorb);
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let config = RealtimeConfig::from_toml_str(
            r#"
            [reconnect]
            initial_ms = 100
            max_ms = 1000
            multiplier = 1.5
            jitter_ms = 0
            max_attempts = 3

            [cache]
            coalesce = "absorb"
            "#,
        )
        .unwrap();
        assert_eq!(config.reconnect.initial_ms, 100);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_rejects_unknown_fields() {
        let result = RealtimeConfig::from_toml_str(
            r#"
            [reconnect]
            initial = 100
            "#,
        );
        assert!(matches!(
            result,
            Err(PalikaError::Config(ConfigError::Parse { .. }))
        ));
    }

    #[test]
    fn test_validate_rejects_max_below_initial() {
        let mut config = RealtimeConfig::default();
        config.reconnect.initial_ms = 500;
        config.reconnect.max_ms = 100;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(PalikaError::Config(ConfigError::InvalidValue { field, .. })) if field == "reconnect.max_ms"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = RealtimeConfig::default();
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let reconnect = ReconnectConfig {
            initial_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts: 10,
        };
        assert_eq!(reconnect.delay_for(1), Duration::from_millis(100));
        assert_eq!(reconnect.delay_for(2), Duration::from_millis(200));
        assert_eq!(reconnect.delay_for(3), Duration::from_millis(400));
        assert_eq!(reconnect.delay_for(9), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_jitter_is_bounded() {
        let reconnect = ReconnectConfig {
            initial_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            jitter_ms: 25,
            max_attempts: 10,
        };
        let delay = reconnect.delay_for(1);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(125));
    }

    #[test]
    fn test_coalesce_policy_from_str() {
        assert_eq!("Trailing".parse::<CoalescePolicy>().unwrap(), CoalescePolicy::Trailing);
        assert_eq!(" absorb ".parse::<CoalescePolicy>().unwrap(), CoalescePolicy::Absorb);
        assert!("eager".parse::<CoalescePolicy>().is_err());
    }
}
