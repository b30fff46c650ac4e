//! Double DQN agent that learns to play snake.
//!
//! The game ([`engine`]) is encoded into 24 features ([`features`]), fed to a
//! fully-connected Q-network ([`nn`]) trained with Adam ([`optimizer`]) from an
//! experience-replay memory ([`replay`]). [`agent`] ties these together and
//! [`trainer`] runs episodes with checkpointing ([`checkpoint`]).

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod nn;
pub mod optimizer;
pub mod replay;
pub mod trainer;

pub use agent::{AgentState, DQNAgent, LearnStats};
pub use config::Config;
pub use engine::{Action, Environment, SnakeEngine, Step};
pub use error::{Result, SnakeError};
pub use replay::{ReplayMemory, Transition};
pub use trainer::{evaluate, EpisodeRecord, MetricsSink, Trainer};
