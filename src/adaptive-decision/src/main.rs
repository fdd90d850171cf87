//! Adaptive Decision — operator CLI for the bandit selector and Q-learning agent.
//!
//! Runs policies against simulated environments using the configured state
//! store, and dumps persisted snapshots for inspection.

use adaptive_core::config::{AppConfig, SelectionPolicy, StoreBackend};
use adaptive_core::EngineError;
use adaptive_rl_engine::{Action, Arm, BanditSelector, Experience, QLearningAgent, State};
use adaptive_store::{open_store, StateStore};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "adaptive-decision")]
#[command(about = "Exploration/exploitation engine: bandit selection and tabular Q-learning")]
#[command(version)]
struct Cli {
    /// Optional TOML config file (environment variables take precedence)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL for the state store (switches the backend to Redis)
    #[arg(long, global = true, env = "ADAPTIVE_ENGINE__STORE__REDIS_URL")]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate Bernoulli arms and print the resulting arm report
    Bandit {
        /// True reward rate of each simulated arm
        #[arg(long, value_delimiter = ',', required = true)]
        rates: Vec<f64>,
        #[arg(long, default_value_t = 10_000)]
        rounds: u64,
        /// Selection policy (overrides config)
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Train the agent on a chain environment and print its greedy policy
    Agent {
        #[arg(long, default_value_t = 500)]
        episodes: u32,
        #[arg(long, default_value_t = 20)]
        steps: u32,
        /// Number of states in the chain
        #[arg(long, default_value_t = 5)]
        states: u32,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print the snapshot stored under the configured key
    Inspect {
        #[arg(value_enum)]
        target: Target,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    EpsilonGreedy,
    Ucb1,
    Thompson,
}

impl From<PolicyArg> for SelectionPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::EpsilonGreedy => SelectionPolicy::EpsilonGreedy,
            PolicyArg::Ucb1 => SelectionPolicy::Ucb1,
            PolicyArg::Thompson => SelectionPolicy::ThompsonSampling,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Target {
    Bandit,
    Agent,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adaptive_decision=info,adaptive_rl_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(url) = cli.redis_url {
        config.store.backend = StoreBackend::Redis;
        config.store.redis_url = url;
    }

    info!(
        backend = ?config.store.backend,
        policy = config.bandit.policy.as_str(),
        "Configuration loaded"
    );

    let store = open_store(&config.store).context("opening state store")?;

    match cli.command {
        Command::Bandit {
            rates,
            rounds,
            policy,
            seed,
        } => run_bandit(config, store, rates, rounds, policy, seed),
        Command::Agent {
            episodes,
            steps,
            states,
            seed,
        } => run_agent(config, store, episodes, steps, states, seed),
        Command::Inspect { target } => {
            let key = match target {
                Target::Bandit => &config.bandit.store_key,
                Target::Agent => &config.agent.store_key,
            };
            match store.get(key)? {
                Some(raw) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&raw).context("stored snapshot is not valid JSON")?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                None => info!(key = %key, "No snapshot stored"),
            }
            Ok(())
        }
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn run_bandit(
    mut config: AppConfig,
    store: Arc<dyn StateStore>,
    rates: Vec<f64>,
    rounds: u64,
    policy: Option<PolicyArg>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        rates.iter().all(|r| (0.0..=1.0).contains(r)),
        "arm rates must be within [0, 1]"
    );
    if let Some(policy) = policy {
        config.bandit.policy = policy.into();
    }
    let arms: Vec<Arm<f64>> = rates
        .iter()
        .enumerate()
        .map(|(i, &rate)| Arm::new(format!("arm-{i}"), format!("Arm {i} (p={rate})"), rate))
        .collect();

    let mut selector = BanditSelector::restore(arms, config.bandit.clone(), store)?;
    if let Some(seed) = seed {
        selector = selector.with_seed(seed);
    }
    let mut env = rng_from(seed.map(|s| s.wrapping_add(1)));

    let mut total_reward = 0.0;
    for _ in 0..rounds {
        let arm = selector.select_arm_configured();
        let reward = if env.gen_bool(arm.payload.clamp(0.0, 1.0)) {
            1.0
        } else {
            0.0
        };
        total_reward += reward;

        match selector.update(&arm.id, reward) {
            Ok(()) => {}
            Err(EngineError::Persist(e)) => warn!(error = %e, "Statistics not persisted"),
            Err(e) => return Err(e.into()),
        }
    }
    selector.flush()?;

    let best_rate = rates.iter().copied().fold(0.0, f64::max);
    let regret = best_rate * rounds as f64 - total_reward;
    let best = selector.get_best_arm();
    info!(
        policy = config.bandit.policy.as_str(),
        rounds = rounds,
        total_reward = total_reward,
        regret = regret,
        leader = %best.arm.id,
        "Bandit simulation complete"
    );

    println!("{}", serde_json::to_string_pretty(&selector.report())?);
    Ok(())
}

/// Chain environment: "advance" moves one state along the chain and pays 10
/// when wrapping from the last state back to the first; "hold" stays put and
/// pays 1.
fn chain_step(position: u32, states: u32, action: &str) -> (f64, u32) {
    match action {
        "advance" if position + 1 >= states => (10.0, 0),
        "advance" => (0.0, position + 1),
        _ => (1.0, position),
    }
}

fn chain_state(position: u32) -> State {
    let mut features = BTreeMap::new();
    features.insert("position".to_string(), position as f64);
    State::from_features(features)
}

fn run_agent(
    config: AppConfig,
    store: Arc<dyn StateStore>,
    episodes: u32,
    steps: u32,
    states: u32,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    anyhow::ensure!(states > 0, "chain needs at least one state");

    let mut agent = QLearningAgent::new(config.agent.clone(), store)?;
    if let Some(seed) = seed {
        agent = agent.with_seed(seed);
    }
    let moves = vec![
        Action::new("hold", serde_json::Value::Null),
        Action::new("advance", serde_json::Value::Null),
    ];

    let mut total_reward = 0.0;
    for _ in 0..episodes {
        let mut position = 0;
        for _ in 0..steps {
            let state = chain_state(position);
            let action = agent.choose_action(&state, &moves)?;
            let (reward, next) = chain_step(position, states, &action.id);
            total_reward += reward;

            let experience = Experience {
                state,
                action: action.clone(),
                reward,
                next_state: chain_state(next),
            };
            match agent.learn(&experience) {
                Ok(_) => {}
                Err(EngineError::Persist(e)) => warn!(error = %e, "Q-table not persisted"),
                Err(e) => return Err(e.into()),
            }
            position = next;
        }
    }
    agent.flush()?;

    info!(
        episodes = episodes,
        steps = steps,
        total_reward = total_reward,
        states_learned = agent.state_count(),
        "Agent training complete"
    );

    agent.set_exploration_rate(0.0)?;
    let policy: BTreeMap<u32, serde_json::Value> = (0..states)
        .map(|position| {
            let state = chain_state(position);
            let action = agent.choose_action(&state, &moves).map(|a| a.id.clone());
            let entry = serde_json::json!({
                "action": action.unwrap_or_default(),
                "value": agent.get_state_value(&state),
            });
            (position, entry)
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&policy)?);
    Ok(())
}
