//! Multi-Armed Bandit selector — Thompson Sampling, UCB1, Epsilon-Greedy
//! over a fixed set of arms, with per-arm reward statistics persisted
//! through a [`StateStore`].

use crate::persistence::{
    malformed, read_snapshot, serialize_finite, LoadOutcome, PersistGate, Snapshot,
};
use crate::sampling;
use adaptive_core::config::{BanditConfig, SelectionPolicy};
use adaptive_core::{EngineError, EngineResult};
use adaptive_store::StateStore;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One alternative under evaluation. The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm<P = serde_json::Value> {
    pub id: String,
    pub name: String,
    pub payload: P,
}

impl<P> Arm<P> {
    pub fn new(id: impl Into<String>, name: impl Into<String>, payload: P) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload,
        }
    }
}

/// Pull/reward statistics for one arm. `avg_reward` and `confidence` are
/// always derived from `pulls` and `rewards`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "StatisticsRecord")]
pub struct ArmStatistics {
    pulls: u64,
    #[serde(serialize_with = "serialize_finite")]
    rewards: f64,
    #[serde(serialize_with = "serialize_finite")]
    avg_reward: f64,
    #[serde(serialize_with = "serialize_finite")]
    confidence: f64,
}

#[derive(Deserialize)]
struct StatisticsRecord {
    pulls: u64,
    rewards: f64,
}

impl TryFrom<StatisticsRecord> for ArmStatistics {
    type Error = String;

    fn try_from(record: StatisticsRecord) -> Result<Self, Self::Error> {
        if !record.rewards.is_finite() {
            return Err(format!("non-finite reward total {}", record.rewards));
        }
        if record.pulls == 0 && record.rewards != 0.0 {
            return Err(format!("reward total {} recorded without pulls", record.rewards));
        }
        Ok(Self::from_totals(record.pulls, record.rewards))
    }
}

impl ArmStatistics {
    fn from_totals(pulls: u64, rewards: f64) -> Self {
        let avg_reward = if pulls > 0 {
            rewards / pulls as f64
        } else {
            0.0
        };
        Self {
            pulls,
            rewards,
            avg_reward,
            confidence: sampling::wilson_lower_bound(avg_reward, pulls),
        }
    }

    /// Statistics after one more pull, `None` if the reward total would
    /// leave the finite range.
    fn recorded(&self, reward: f64) -> Option<Self> {
        let rewards = self.rewards + reward;
        rewards
            .is_finite()
            .then(|| Self::from_totals(self.pulls + 1, rewards))
    }

    pub fn pulls(&self) -> u64 {
        self.pulls
    }

    pub fn rewards(&self) -> f64 {
        self.rewards
    }

    pub fn avg_reward(&self) -> f64 {
        self.avg_reward
    }

    /// Wilson score lower bound on the reward rate (95%).
    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

/// The current leader and its statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct BestArm<'a, P> {
    pub arm: &'a Arm<P>,
    pub statistics: ArmStatistics,
}

/// Per-arm summary for dashboards and the operator CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmReport {
    pub arm_id: String,
    pub name: String,
    pub pulls: u64,
    pub avg_reward: f64,
    pub confidence: f64,
    pub traffic_share: f64,
    pub is_leader: bool,
}

pub struct BanditSelector<P = serde_json::Value> {
    arms: Vec<Arm<P>>,
    index: HashMap<String, usize>,
    stats: RwLock<Vec<ArmStatistics>>,
    config: BanditConfig,
    rng: Mutex<StdRng>,
    store: Arc<dyn StateStore>,
    gate: PersistGate,
}

impl<P> BanditSelector<P> {
    /// Build a selector with all-zero statistics. Does not read the store.
    pub fn new(
        arms: Vec<Arm<P>>,
        config: BanditConfig,
        store: Arc<dyn StateStore>,
    ) -> EngineResult<Self> {
        if arms.is_empty() {
            return Err(EngineError::NoArms);
        }
        if !(0.0..=1.0).contains(&config.epsilon) {
            return Err(EngineError::InvalidParameter(format!(
                "epsilon must be within [0, 1], got {}",
                config.epsilon
            )));
        }

        let mut index = HashMap::with_capacity(arms.len());
        for (i, arm) in arms.iter().enumerate() {
            if index.insert(arm.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateArm(arm.id.clone()));
            }
        }

        let gate = PersistGate::new(config.persist)?;
        info!(
            arms = arms.len(),
            policy = config.policy.as_str(),
            epsilon = config.epsilon,
            key = %config.store_key,
            "Bandit selector initialized"
        );

        Ok(Self {
            stats: RwLock::new(vec![ArmStatistics::default(); arms.len()]),
            arms,
            index,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            store,
            gate,
        })
    }

    /// Build a selector and restore its statistics from the store.
    /// An unreachable store or missing snapshot yields a cold start;
    /// a malformed snapshot is an error.
    pub fn restore(
        arms: Vec<Arm<P>>,
        config: BanditConfig,
        store: Arc<dyn StateStore>,
    ) -> EngineResult<Self> {
        let selector = Self::new(arms, config, store)?;
        selector.load()?;
        Ok(selector)
    }

    /// Reseed the selection RNG for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn arms(&self) -> &[Arm<P>] {
        &self.arms
    }

    pub fn config(&self) -> &BanditConfig {
        &self.config
    }

    /// Select with the policy named in the configuration.
    pub fn select_arm_configured(&self) -> &Arm<P> {
        self.select_arm(self.config.policy)
    }

    pub fn select_arm(&self, policy: SelectionPolicy) -> &Arm<P> {
        match policy {
            SelectionPolicy::EpsilonGreedy => self.select_arm_epsilon_greedy(),
            SelectionPolicy::Ucb1 => self.select_arm_ucb(),
            SelectionPolicy::ThompsonSampling => self.select_arm_thompson_sampling(),
        }
    }

    pub fn select_arm_epsilon_greedy(&self) -> &Arm<P> {
        let explored = {
            let mut rng = self.rng.lock();
            if sampling::explore(&mut *rng, self.config.epsilon) {
                Some(sampling::uniform_index(&mut *rng, self.arms.len()))
            } else {
                None
            }
        };
        let idx = explored.unwrap_or_else(|| self.best_index());
        self.chosen(SelectionPolicy::EpsilonGreedy, idx)
    }

    pub fn select_arm_ucb(&self) -> &Arm<P> {
        let idx = {
            let stats = self.stats.read();
            let total_pulls: u64 = stats.iter().map(|s| s.pulls).sum();

            if total_pulls == 0 {
                0
            } else if let Some(untried) = stats.iter().position(|s| s.pulls == 0) {
                untried
            } else {
                let log_total = (total_pulls as f64).ln();
                sampling::argmax_first(stats.iter().map(|s| {
                    s.avg_reward + (2.0 * log_total / s.pulls as f64).sqrt()
                }))
                .unwrap_or(0)
            }
        };
        self.chosen(SelectionPolicy::Ucb1, idx)
    }

    pub fn select_arm_thompson_sampling(&self) -> &Arm<P> {
        let posteriors: Vec<(f64, f64)> = self
            .stats
            .read()
            .iter()
            .map(|s| (s.rewards + 1.0, s.pulls as f64 - s.rewards + 1.0))
            .collect();

        let samples: Vec<f64> = {
            let mut rng = self.rng.lock();
            posteriors
                .iter()
                .map(|&(alpha, beta)| sampling::sample_beta(&mut *rng, alpha, beta))
                .collect()
        };

        let idx = sampling::argmax_first(samples).unwrap_or(0);
        self.chosen(SelectionPolicy::ThompsonSampling, idx)
    }

    fn chosen(&self, policy: SelectionPolicy, idx: usize) -> &Arm<P> {
        let arm = &self.arms[idx];
        metrics::counter!("bandit.select", "policy" => policy.as_str()).increment(1);
        debug!(arm_id = %arm.id, policy = policy.as_str(), "Arm selected");
        arm
    }

    fn best_index(&self) -> usize {
        let stats = self.stats.read();
        sampling::argmax_first(stats.iter().map(|s| s.avg_reward)).unwrap_or(0)
    }

    /// Record an observed reward for `arm_id`.
    ///
    /// Fails with `UnknownArm` before touching any statistics. A `Persist`
    /// error means the update was applied in memory but not written.
    pub fn update(&self, arm_id: &str, reward: f64) -> EngineResult<()> {
        let idx = *self
            .index
            .get(arm_id)
            .ok_or_else(|| EngineError::UnknownArm(arm_id.to_string()))?;
        if !reward.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "reward must be finite, got {reward}"
            )));
        }

        let updated = {
            let mut stats = self.stats.write();
            let updated = stats[idx].recorded(reward).ok_or_else(|| {
                EngineError::InvalidParameter(format!(
                    "reward {reward} overflows the reward total of arm {arm_id}"
                ))
            })?;
            stats[idx] = updated;
            updated
        };

        metrics::counter!("bandit.update").increment(1);
        debug!(
            arm_id = arm_id,
            reward = reward,
            pulls = updated.pulls,
            avg_reward = updated.avg_reward,
            confidence = updated.confidence,
            "Arm statistics updated"
        );

        if self.gate.record_mutation() {
            self.persist()
                .map_err(|e| EngineError::Persist(e.to_string()))?;
        }
        Ok(())
    }

    /// Snapshot of every arm's statistics keyed by arm id.
    pub fn get_statistics(&self) -> HashMap<String, ArmStatistics> {
        let stats = self.stats.read();
        self.arms
            .iter()
            .zip(stats.iter())
            .map(|(arm, s)| (arm.id.clone(), *s))
            .collect()
    }

    pub fn statistics(&self, arm_id: &str) -> Option<ArmStatistics> {
        let idx = *self.index.get(arm_id)?;
        Some(self.stats.read()[idx])
    }

    /// The arm with the highest average reward (first on ties).
    pub fn get_best_arm(&self) -> BestArm<'_, P> {
        let stats = self.stats.read();
        let idx = sampling::argmax_first(stats.iter().map(|s| s.avg_reward)).unwrap_or(0);
        BestArm {
            arm: &self.arms[idx],
            statistics: stats[idx],
        }
    }

    pub fn total_pulls(&self) -> u64 {
        self.stats.read().iter().map(|s| s.pulls).sum()
    }

    pub fn report(&self) -> Vec<ArmReport> {
        let stats = self.stats.read().clone();
        let total: u64 = stats.iter().map(|s| s.pulls).sum();
        let leader = sampling::argmax_first(stats.iter().map(|s| s.avg_reward)).unwrap_or(0);

        self.arms
            .iter()
            .zip(stats.iter())
            .enumerate()
            .map(|(i, (arm, s))| ArmReport {
                arm_id: arm.id.clone(),
                name: arm.name.clone(),
                pulls: s.pulls,
                avg_reward: s.avg_reward,
                confidence: s.confidence,
                traffic_share: if total > 0 {
                    s.pulls as f64 / total as f64
                } else {
                    1.0 / self.arms.len() as f64
                },
                is_leader: i == leader && total > 0,
            })
            .collect()
    }

    /// Updates applied since the last successful write.
    pub fn pending_writes(&self) -> u32 {
        self.gate.pending()
    }

    /// Write the full statistics snapshot to the store.
    pub fn persist(&self) -> EngineResult<()> {
        self.gate
            .write(self.store.as_ref(), &self.config.store_key, || {
                let entries: Vec<(String, ArmStatistics)> = {
                    let stats = self.stats.read();
                    self.arms
                        .iter()
                        .zip(stats.iter())
                        .map(|(arm, s)| (arm.id.clone(), *s))
                        .collect()
                };
                Snapshot::new(entries).encode()
            })
    }

    /// Persist only if updates are pending. Returns whether a write happened.
    pub fn flush(&self) -> EngineResult<bool> {
        if self.gate.pending() == 0 {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Replace the in-memory statistics with the stored snapshot.
    ///
    /// Arms absent from the snapshot start at zero; snapshot entries for
    /// arm ids this selector does not know are dropped. An empty key resets
    /// every arm to zero. An unreachable store leaves statistics as they are.
    pub fn load(&self) -> EngineResult<LoadOutcome> {
        let raw = match read_snapshot(self.store.as_ref(), &self.config.store_key) {
            Ok(raw) => raw,
            Err(LoadOutcome::Empty) => {
                *self.stats.write() = vec![ArmStatistics::default(); self.arms.len()];
                return Ok(LoadOutcome::Empty);
            }
            Err(outcome) => return Ok(outcome),
        };
        let snapshot = Snapshot::<(String, ArmStatistics)>::decode(&raw)?;

        let mut restored = vec![ArmStatistics::default(); self.arms.len()];
        let mut seen = HashSet::new();
        let mut entries = 0;
        for (arm_id, stats) in snapshot.entries {
            if !seen.insert(arm_id.clone()) {
                return Err(malformed(format!("arm {arm_id} appears twice in snapshot")));
            }
            match self.index.get(&arm_id) {
                Some(&idx) => {
                    restored[idx] = stats;
                    entries += 1;
                }
                None => warn!(arm_id = %arm_id, "Dropping persisted statistics for unknown arm"),
            }
        }

        *self.stats.write() = restored;
        info!(
            key = %self.config.store_key,
            entries = entries,
            saved_at = %snapshot.saved_at,
            "Bandit statistics restored"
        );
        Ok(LoadOutcome::Restored { entries })
    }
}
