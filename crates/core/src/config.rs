use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `ADAPTIVE_ENGINE__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub agent: QLearningConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Arm selection policy used when the caller does not pick one per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    EpsilonGreedy,
    Ucb1,
    #[default]
    ThompsonSampling,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::EpsilonGreedy => "epsilon_greedy",
            SelectionPolicy::Ucb1 => "ucb1",
            SelectionPolicy::ThompsonSampling => "thompson_sampling",
        }
    }
}

/// When learning state is written back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Write a snapshot after every mutation.
    #[default]
    EveryUpdate,
    /// Write once `max_pending` mutations have accumulated since the last flush.
    Batched { max_pending: u32 },
    /// Only write on an explicit `persist`/`flush`.
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub policy: SelectionPolicy,
    #[serde(default = "default_bandit_key")]
    pub store_key: String,
    #[serde(default)]
    pub persist: PersistPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QLearningConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_discount_factor")]
    pub discount_factor: f64,
    #[serde(default = "default_epsilon")]
    pub exploration_rate: f64,
    #[serde(default = "default_q_table_key")]
    pub store_key: String,
    #[serde(default)]
    pub persist: PersistPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

// Default functions
fn default_epsilon() -> f64 {
    0.1
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_discount_factor() -> f64 {
    0.95
}
fn default_bandit_key() -> String {
    "bandit:stats".to_string()
}
fn default_q_table_key() -> String {
    "rl:q_table".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            policy: SelectionPolicy::default(),
            store_key: default_bandit_key(),
            persist: PersistPolicy::default(),
        }
    }
}

impl Default for QLearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            discount_factor: default_discount_factor(),
            exploration_rate: default_epsilon(),
            store_key: default_q_table_key(),
            persist: PersistPolicy::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file overlaid with environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("ADAPTIVE_ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = AppConfig::default();
        assert_eq!(config.bandit.epsilon, 0.1);
        assert_eq!(config.agent.learning_rate, 0.1);
        assert_eq!(config.agent.discount_factor, 0.95);
        assert_eq!(config.agent.exploration_rate, 0.1);
        assert_eq!(config.bandit.persist, PersistPolicy::EveryUpdate);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"bandit": {"policy": "ucb1", "persist": {"mode": "batched", "max_pending": 25}}}"#,
        )
        .unwrap();
        assert_eq!(config.bandit.policy, SelectionPolicy::Ucb1);
        assert_eq!(
            config.bandit.persist,
            PersistPolicy::Batched { max_pending: 25 }
        );
        assert_eq!(config.bandit.store_key, "bandit:stats");
        assert_eq!(config.agent.store_key, "rl:q_table");
    }
}
