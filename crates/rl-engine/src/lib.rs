//! Adaptive decision engine — multi-armed bandits (Thompson Sampling, UCB1,
//! Epsilon-Greedy) and a tabular Q-learning agent, both persisting their
//! learning state through a pluggable [`adaptive_store::StateStore`].

pub mod bandits;
pub mod persistence;
pub mod qlearning;
pub mod sampling;

pub use bandits::{Arm, ArmReport, ArmStatistics, BanditSelector, BestArm};
pub use persistence::{LoadOutcome, PersistGate, Snapshot};
pub use qlearning::{Action, Experience, QLearningAgent, QTable, State};
