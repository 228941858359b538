use std::str::FromStr;

use serde::Serialize;

use crate::error::{QueueError, Result};
use crate::scheduler::RetryPolicy;
use crate::store::Store;

/// Operator-tunable retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKey {
    MaxRetries,
    BackoffBase,
}

impl PolicyKey {
    pub const ALL: [PolicyKey; 2] = [PolicyKey::MaxRetries, PolicyKey::BackoffBase];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKey::MaxRetries => "max-retries",
            PolicyKey::BackoffBase => "backoff-base",
        }
    }

    pub fn default_value(&self) -> u32 {
        let defaults = RetryPolicy::default();
        match self {
            PolicyKey::MaxRetries => defaults.max_retries,
            PolicyKey::BackoffBase => defaults.backoff_base,
        }
    }

    fn min_value(&self) -> i64 {
        match self {
            PolicyKey::MaxRetries => 0,
            PolicyKey::BackoffBase => 1,
        }
    }

    /// Parse and range-check a raw value for this key.
    pub fn validate(&self, value: &str) -> Result<u32> {
        let invalid = |reason: String| QueueError::InvalidConfigValue {
            key: self.as_str().to_string(),
            value: value.to_string(),
            reason,
        };

        let parsed: i64 = value
            .trim()
            .parse()
            .map_err(|_| invalid("must be an integer".to_string()))?;

        if parsed < self.min_value() {
            return Err(invalid(format!("must be >= {}", self.min_value())));
        }

        u32::try_from(parsed).map_err(|_| invalid(format!("must be <= {}", u32::MAX)))
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "max-retries" => Ok(PolicyKey::MaxRetries),
            "backoff-base" => Ok(PolicyKey::BackoffBase),
            other => Err(QueueError::InvalidConfigKey(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub key: PolicyKey,
    pub value: u32,
    /// True when nothing is stored and the built-in default applies.
    pub is_default: bool,
}

/// Read/write access to the `config` table.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    store: Store,
}

impl ConfigStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Validate then persist. Nothing is written when validation fails.
    pub async fn set(&self, key: &str, value: &str) -> Result<ConfigEntry> {
        let key: PolicyKey = key.parse()?;
        let value = key.validate(value)?;

        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key.as_str())
        .bind(value.to_string())
        .execute(self.store.pool())
        .await?;

        tracing::info!(key = %key, value, "Config updated");

        Ok(ConfigEntry {
            key,
            value,
            is_default: false,
        })
    }

    pub async fn get(&self, key: PolicyKey) -> Result<ConfigEntry> {
        let stored: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?1")
            .bind(key.as_str())
            .fetch_optional(self.store.pool())
            .await?;

        let entry = match stored {
            None => ConfigEntry {
                key,
                value: key.default_value(),
                is_default: true,
            },
            Some(raw) => match key.validate(&raw) {
                Ok(value) => ConfigEntry {
                    key,
                    value,
                    is_default: false,
                },
                Err(e) => {
                    // Only reachable if the row was written around `set`.
                    tracing::warn!(key = %key, error = %e, "Ignoring stored config value, using default");
                    ConfigEntry {
                        key,
                        value: key.default_value(),
                        is_default: true,
                    }
                }
            },
        };

        Ok(entry)
    }

    pub async fn entries(&self) -> Result<Vec<ConfigEntry>> {
        let mut entries = Vec::with_capacity(PolicyKey::ALL.len());
        for key in PolicyKey::ALL {
            entries.push(self.get(key).await?);
        }
        Ok(entries)
    }

    /// Current policy, read fresh from the store on every call.
    pub async fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            max_retries: self.get(PolicyKey::MaxRetries).await?.value,
            backoff_base: self.get(PolicyKey::BackoffBase).await?.value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_only() {
        assert_eq!("max-retries".parse::<PolicyKey>().unwrap(), PolicyKey::MaxRetries);
        assert_eq!("backoff-base".parse::<PolicyKey>().unwrap(), PolicyKey::BackoffBase);
        assert!(matches!(
            "retries".parse::<PolicyKey>(),
            Err(QueueError::InvalidConfigKey(k)) if k == "retries"
        ));
    }

    #[test]
    fn validates_ranges_per_key() {
        assert_eq!(PolicyKey::MaxRetries.validate("0").unwrap(), 0);
        assert_eq!(PolicyKey::MaxRetries.validate(" 7 ").unwrap(), 7);
        assert!(PolicyKey::MaxRetries.validate("-1").is_err());
        assert!(PolicyKey::MaxRetries.validate("three").is_err());
        assert!(PolicyKey::MaxRetries.validate("1.5").is_err());
        assert!(PolicyKey::MaxRetries.validate("4294967296").is_err());

        assert_eq!(PolicyKey::BackoffBase.validate("1").unwrap(), 1);
        assert!(PolicyKey::BackoffBase.validate("0").is_err());
    }

    #[test]
    fn defaults_match_retry_policy() {
        assert_eq!(PolicyKey::MaxRetries.default_value(), 3);
        assert_eq!(PolicyKey::BackoffBase.default_value(), 2);
    }
}
