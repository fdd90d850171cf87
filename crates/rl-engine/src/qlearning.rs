//! Tabular Q-learning agent with epsilon-greedy action selection.
//!
//! The Q-table maps a state hash to per-action value estimates. Missing
//! entries read as 0. The table is written back to the store after each
//! `learn` (or in batches, per the configured persist policy).

use crate::persistence::{malformed, read_snapshot, LoadOutcome, PersistGate, Snapshot};
use crate::sampling;
use adaptive_core::config::QLearningConfig;
use adaptive_core::{EngineError, EngineResult};
use adaptive_store::StateStore;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment state. Only `hash` is used for table lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub features: BTreeMap<String, f64>,
    pub hash: String,
}

impl State {
    pub fn new(hash: impl Into<String>, features: BTreeMap<String, f64>) -> Self {
        Self {
            features,
            hash: hash.into(),
        }
    }

    /// Derive the hash from the features as `key=value` pairs in key order.
    pub fn from_features(features: BTreeMap<String, f64>) -> Self {
        let hash = features
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|");
        Self { features, hash }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action<P = serde_json::Value> {
    pub id: String,
    pub params: P,
}

impl<P> Action<P> {
    pub fn new(id: impl Into<String>, params: P) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }
}

/// One observed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience<P = serde_json::Value> {
    pub state: State,
    pub action: Action<P>,
    pub reward: f64,
    pub next_state: State,
}

type QTableEntries = Vec<(String, Vec<(String, f64)>)>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QTable {
    rows: HashMap<String, HashMap<String, f64>>,
}

impl QTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, state_hash: &str, action_id: &str) -> f64 {
        self.rows
            .get(state_hash)
            .and_then(|row| row.get(action_id))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set(&mut self, state_hash: &str, action_id: &str, value: f64) {
        self.rows
            .entry(state_hash.to_string())
            .or_default()
            .insert(action_id.to_string(), value);
    }

    /// Largest recorded value for the state, 0 when nothing is recorded.
    pub fn max_value(&self, state_hash: &str) -> f64 {
        self.rows
            .get(state_hash)
            .and_then(|row| row.values().copied().reduce(f64::max))
            .unwrap_or(0.0)
    }

    pub fn row(&self, state_hash: &str) -> Option<&HashMap<String, f64>> {
        self.rows.get(state_hash)
    }

    pub fn state_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of recorded (state, action) pairs.
    pub fn len(&self) -> usize {
        self.rows.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.values().all(HashMap::is_empty)
    }

    /// Sorted snapshot entries. Fails on values JSON cannot represent.
    fn to_entries(&self) -> EngineResult<QTableEntries> {
        let mut entries = Vec::with_capacity(self.rows.len());
        for (state, row) in &self.rows {
            let mut actions = Vec::with_capacity(row.len());
            for (action, &value) in row {
                if !value.is_finite() {
                    return Err(EngineError::Serialization(serde::ser::Error::custom(
                        format!("cannot persist non-finite Q({state}, {action}) = {value}"),
                    )));
                }
                actions.push((action.clone(), value));
            }
            actions.sort_by(|a: &(String, f64), b| a.0.cmp(&b.0));
            entries.push((state.clone(), actions));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn from_entries(entries: QTableEntries) -> EngineResult<Self> {
        let mut rows = HashMap::with_capacity(entries.len());
        for (state, actions) in entries {
            let mut row = HashMap::with_capacity(actions.len());
            for (action, value) in actions {
                if row.insert(action.clone(), value).is_some() {
                    return Err(malformed(format!(
                        "action {action} appears twice for state {state}"
                    )));
                }
            }
            if rows.contains_key(&state) {
                return Err(malformed(format!("state {state} appears twice in snapshot")));
            }
            rows.insert(state, row);
        }
        Ok(Self { rows })
    }
}

pub struct QLearningAgent {
    config: QLearningConfig,
    table: RwLock<QTable>,
    rng: Mutex<StdRng>,
    store: Arc<dyn StateStore>,
    gate: PersistGate,
}

impl QLearningAgent {
    /// Build an agent and load its Q-table from the store.
    ///
    /// A missing snapshot or unreachable store yields an empty table; a
    /// malformed snapshot is an error.
    pub fn new(config: QLearningConfig, store: Arc<dyn StateStore>) -> EngineResult<Self> {
        validate(&config)?;
        let gate = PersistGate::new(config.persist)?;

        info!(
            learning_rate = config.learning_rate,
            discount_factor = config.discount_factor,
            exploration_rate = config.exploration_rate,
            key = %config.store_key,
            "Q-learning agent initialized"
        );

        let agent = Self {
            config,
            table: RwLock::new(QTable::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            store,
            gate,
        };
        agent.load()?;
        Ok(agent)
    }

    /// Reseed the exploration RNG for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &QLearningConfig {
        &self.config
    }

    pub fn set_exploration_rate(&mut self, epsilon: f64) -> EngineResult<()> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(EngineError::InvalidParameter(format!(
                "exploration_rate must be within [0, 1], got {epsilon}"
            )));
        }
        self.config.exploration_rate = epsilon;
        Ok(())
    }

    /// Pick an action for `state` from the caller-supplied candidates.
    pub fn choose_action<'a, P>(
        &self,
        state: &State,
        possible_actions: &'a [Action<P>],
    ) -> EngineResult<&'a Action<P>> {
        if possible_actions.is_empty() {
            return Err(EngineError::EmptyActionSet);
        }

        let explored = {
            let mut rng = self.rng.lock();
            if sampling::explore(&mut *rng, self.config.exploration_rate) {
                Some(sampling::uniform_index(&mut *rng, possible_actions.len()))
            } else {
                None
            }
        };

        let (idx, mode) = match explored {
            Some(idx) => (idx, "explore"),
            None => {
                let table = self.table.read();
                let idx = sampling::argmax_first(
                    possible_actions
                        .iter()
                        .map(|a| table.get(&state.hash, &a.id)),
                )
                .unwrap_or(0);
                (idx, "exploit")
            }
        };

        let action = &possible_actions[idx];
        metrics::counter!("rl.choose", "mode" => mode).increment(1);
        debug!(state = %state.hash, action = %action.id, mode = mode, "Action chosen");
        Ok(action)
    }

    /// Apply the Q-learning update for one transition and return the new
    /// value of `Q(state, action)`.
    pub fn learn<P>(&self, experience: &Experience<P>) -> EngineResult<f64> {
        if !experience.reward.is_finite() {
            return Err(EngineError::InvalidParameter(format!(
                "reward must be finite, got {}",
                experience.reward
            )));
        }
        let state = &experience.state.hash;
        let action = &experience.action.id;

        let (previous, updated) = {
            let mut table = self.table.write();
            let current = table.get(state, action);
            let future = table.max_value(&experience.next_state.hash);
            let target = experience.reward + self.config.discount_factor * future;
            let updated = current + self.config.learning_rate * (target - current);
            if !updated.is_finite() {
                return Err(EngineError::InvalidParameter(format!(
                    "update of Q({state}, {action}) overflows: reward {}",
                    experience.reward
                )));
            }
            table.set(state, action, updated);
            (current, updated)
        };

        metrics::counter!("rl.learn").increment(1);
        debug!(
            state = %state,
            action = %action,
            reward = experience.reward,
            previous = previous,
            updated = updated,
            "Q-value updated"
        );

        if self.gate.record_mutation() {
            self.persist()
                .map_err(|e| EngineError::Persist(e.to_string()))?;
        }
        Ok(updated)
    }

    /// Best recorded value for the state, 0 if the state is unseen.
    pub fn get_state_value(&self, state: &State) -> f64 {
        self.table.read().max_value(&state.hash)
    }

    pub fn q_value(&self, state: &State, action_id: &str) -> f64 {
        self.table.read().get(&state.hash, action_id)
    }

    pub fn table(&self) -> QTable {
        self.table.read().clone()
    }

    pub fn state_count(&self) -> usize {
        self.table.read().state_count()
    }

    pub fn pending_writes(&self) -> u32 {
        self.gate.pending()
    }

    /// Write the full Q-table snapshot to the store.
    pub fn persist(&self) -> EngineResult<()> {
        self.gate
            .write(self.store.as_ref(), &self.config.store_key, || {
                let entries = self.table.read().to_entries()?;
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

    /// Replace the in-memory table with the stored snapshot.
    ///
    /// An empty key clears the table. An unreachable store leaves it as is.
    pub fn load(&self) -> EngineResult<LoadOutcome> {
        let raw = match read_snapshot(self.store.as_ref(), &self.config.store_key) {
            Ok(raw) => raw,
            Err(LoadOutcome::Empty) => {
                *self.table.write() = QTable::new();
                return Ok(LoadOutcome::Empty);
            }
            Err(outcome) => return Ok(outcome),
        };
        let snapshot = Snapshot::<(String, Vec<(String, f64)>)>::decode(&raw)?;
        let table = QTable::from_entries(snapshot.entries)?;
        let entries = table.state_count();

        *self.table.write() = table;
        info!(
            key = %self.config.store_key,
            states = entries,
            saved_at = %snapshot.saved_at,
            "Q-table restored"
        );
        Ok(LoadOutcome::Restored { entries })
    }
}

fn validate(config: &QLearningConfig) -> EngineResult<()> {
    if !(config.learning_rate > 0.0 && config.learning_rate <= 1.0) {
        return Err(EngineError::InvalidParameter(format!(
            "learning_rate must be within (0, 1], got {}",
            config.learning_rate
        )));
    }
    if !(0.0..=1.0).contains(&config.discount_factor) {
        return Err(EngineError::InvalidParameter(format!(
            "discount_factor must be within [0, 1], got {}",
            config.discount_factor
        )));
    }
    if !(0.0..=1.0).contains(&config.exploration_rate) {
        return Err(EngineError::InvalidParameter(format!(
            "exploration_rate must be within [0, 1], got {}",
            config.exploration_rate
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_core::config::PersistPolicy;
    use adaptive_store::MemoryStore;

    fn state(hash: &str) -> State {
        State::new(hash, BTreeMap::new())
    }

    fn actions(ids: &[&str]) -> Vec<Action> {
        ids.iter()
            .map(|id| Action::new(*id, serde_json::Value::Null))
            .collect()
    }

    fn experience(s: &str, a: &str, reward: f64, next: &str) -> Experience {
        Experience {
            state: state(s),
            action: Action::new(a, serde_json::Value::Null),
            reward,
            next_state: state(next),
        }
    }

    fn agent(config: QLearningConfig) -> QLearningAgent {
        QLearningAgent::new(config, Arc::new(MemoryStore::new()))
            .unwrap()
            .with_seed(5)
    }

    #[test]
    fn test_unseen_state_is_neutral() {
        let agent = agent(QLearningConfig::default());
        assert_eq!(agent.get_state_value(&state("s0")), 0.0);
        assert_eq!(agent.q_value(&state("s0"), "a"), 0.0);
        assert_eq!(agent.state_count(), 0);
    }

    #[test]
    fn test_learn_applies_td_update() {
        let agent = agent(QLearningConfig {
            learning_rate: 0.5,
            discount_factor: 0.9,
            ..QLearningConfig::default()
        });

        // Unknown next state contributes 0: Q = 0 + 0.5 * (1 - 0).
        let q = agent.learn(&experience("s0", "a", 1.0, "s1")).unwrap();
        assert_eq!(q, 0.5);

        // Seed s1 with a value, then bootstrap from it.
        agent.learn(&experience("s1", "b", 2.0, "s9")).unwrap(); // Q(s1,b) = 1.0
        let q = agent.learn(&experience("s0", "a", 1.0, "s1")).unwrap();
        // 0.5 + 0.5 * (1 + 0.9 * 1.0 - 0.5) = 1.2
        assert!((q - 1.2).abs() < 1e-12);
        assert!((agent.q_value(&state("s0"), "a") - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_negative_future_is_not_clamped_to_zero() {
        let agent = agent(QLearningConfig {
            learning_rate: 1.0,
            discount_factor: 1.0,
            ..QLearningConfig::default()
        });
        agent.learn(&experience("s1", "x", -4.0, "end")).unwrap();
        assert_eq!(agent.get_state_value(&state("s1")), -4.0);

        let q = agent.learn(&experience("s0", "a", 0.0, "s1")).unwrap();
        assert_eq!(q, -4.0);
    }

    #[test]
    fn test_choose_action_rejects_empty_set() {
        let agent = agent(QLearningConfig::default());
        let none: Vec<Action> = Vec::new();
        assert!(matches!(
            agent.choose_action(&state("s0"), &none),
            Err(EngineError::EmptyActionSet)
        ));
    }

    #[test]
    fn test_greedy_choice_uses_table_and_first_on_ties() {
        let mut agent = agent(QLearningConfig::default());
        agent.set_exploration_rate(0.0).unwrap();
        let candidates = actions(&["left", "right", "stay"]);

        assert_eq!(agent.choose_action(&state("s0"), &candidates).unwrap().id, "left");

        agent.learn(&experience("s0", "stay", 1.0, "s0")).unwrap();
        for _ in 0..50 {
            assert_eq!(agent.choose_action(&state("s0"), &candidates).unwrap().id, "stay");
        }
    }

    #[test]
    fn test_states_with_same_hash_share_a_row() {
        let agent = agent(QLearningConfig::default());
        let mut features = BTreeMap::new();
        features.insert("demand".to_string(), 3.0);
        features.insert("hour".to_string(), 14.0);

        let a = State::from_features(features.clone());
        let b = State::from_features(features);
        assert_eq!(a.hash, "demand=3|hour=14");

        agent
            .learn(&Experience {
                state: a,
                action: Action::new("discount", serde_json::Value::Null),
                reward: 1.0,
                next_state: state("end"),
            })
            .unwrap();
        assert!(agent.q_value(&b, "discount") > 0.0);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        for config in [
            QLearningConfig {
                learning_rate: 0.0,
                ..QLearningConfig::default()
            },
            QLearningConfig {
                discount_factor: 1.5,
                ..QLearningConfig::default()
            },
            QLearningConfig {
                exploration_rate: -0.1,
                ..QLearningConfig::default()
            },
        ] {
            assert!(matches!(
                QLearningAgent::new(config, store.clone()),
                Err(EngineError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_learn_persists_every_update_by_default() {
        let store = Arc::new(MemoryStore::new());
        let agent = QLearningAgent::new(QLearningConfig::default(), store.clone()).unwrap();
        agent.learn(&experience("s0", "a", 1.0, "s1")).unwrap();

        let raw = store.get("rl:q_table").unwrap().unwrap();
        let snapshot = Snapshot::<(String, Vec<(String, f64)>)>::decode(&raw).unwrap();
        assert_eq!(snapshot.entries, vec![("s0".to_string(), vec![("a".to_string(), 0.1)])]);
    }

    #[test]
    fn test_malformed_snapshot_fails_construction() {
        let store = Arc::new(MemoryStore::new());
        store.set("rl:q_table", r#"{"version": 1, "entries": "nope"}"#).unwrap();
        assert!(matches!(
            QLearningAgent::new(QLearningConfig::default(), store),
            Err(EngineError::Serialization(_))
        ));
    }

    #[test]
    fn test_table_entries_are_sorted() {
        let mut table = QTable::new();
        table.set("s2", "b", 1.0);
        table.set("s1", "z", 2.0);
        table.set("s1", "a", 3.0);
        assert_eq!(table.len(), 3);

        let entries = table.to_entries().unwrap();
        assert_eq!(entries[0].0, "s1");
        assert_eq!(entries[0].1[0].0, "a");
        assert_eq!(QTable::from_entries(entries).unwrap(), table);
    }

    #[test]
    fn test_overflowing_update_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let config = QLearningConfig {
            learning_rate: 1.0,
            discount_factor: 1.0,
            ..QLearningConfig::default()
        };
        let agent = QLearningAgent::new(config.clone(), store.clone()).unwrap();

        assert_eq!(agent.learn(&experience("s0", "a", f64::MAX, "s0")).unwrap(), f64::MAX);
        let err = agent.learn(&experience("s0", "a", f64::MAX, "s0")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
        assert_eq!(agent.q_value(&state("s0"), "a"), f64::MAX);

        let reloaded = QLearningAgent::new(config, store).unwrap();
        assert_eq!(reloaded.table(), agent.table());
    }

    #[test]
    fn test_non_finite_table_refuses_to_serialize() {
        let mut table = QTable::new();
        table.set("s0", "a", f64::NAN);
        assert!(matches!(table.to_entries(), Err(EngineError::Serialization(_))));
    }

    #[test]
    fn test_duplicate_rows_in_snapshot_are_rejected() {
        let twice_state = vec![
            ("s0".to_string(), vec![("a".to_string(), 1.0)]),
            ("s0".to_string(), vec![("b".to_string(), 2.0)]),
        ];
        assert!(matches!(
            QTable::from_entries(twice_state),
            Err(EngineError::Serialization(_))
        ));

        let twice_action = vec![(
            "s0".to_string(),
            vec![("a".to_string(), 1.0), ("a".to_string(), 2.0)],
        )];
        assert!(QTable::from_entries(twice_action).is_err());

        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "rl:q_table",
                r#"{"version":1,"saved_at":"2024-05-01T00:00:00Z","entries":[["s0",[["a",1.0]]],["s0",[["a",2.0]]]]}"#,
            )
            .unwrap();
        assert!(matches!(
            QLearningAgent::new(QLearningConfig::default(), store),
            Err(EngineError::Serialization(_))
        ));
    }

    #[test]
    fn test_load_of_empty_key_clears_table() {
        let config = QLearningConfig {
            persist: PersistPolicy::Manual,
            ..QLearningConfig::default()
        };
        let agent = agent(config);
        agent.learn(&experience("s0", "a", 1.0, "s1")).unwrap();
        assert_eq!(agent.state_count(), 1);

        assert_eq!(agent.load().unwrap(), LoadOutcome::Empty);
        assert_eq!(agent.state_count(), 0);
        assert_eq!(agent.q_value(&state("s0"), "a"), 0.0);
    }
}
