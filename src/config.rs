use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnakeError};

/// Board geometry and episode timeout.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub width: i32,
    pub height: i32,
    /// Steps allowed without eating before the episode is cut off.
    /// `None` means `width * height * 2`.
    pub max_steps_without_food: Option<u32>,
    pub seed: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            max_steps_without_food: None,
            seed: 7,
        }
    }
}

impl EnvConfig {
    pub fn timeout(&self) -> u32 {
        self.max_steps_without_food
            .unwrap_or((self.width * self.height * 2) as u32)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub survival: f64,
    pub closer: f64,
    pub farther: f64,
    pub food_base: f64,
    pub food_length_exponent: f64,
    pub collision: f64,
    pub timeout: f64,
    /// Applied while the head sits on a border cell. Off by default.
    pub edge_penalty: f64,
    /// Applied once steps-since-food exceeds `stall_fraction` of the timeout. Off by default.
    pub stall_penalty: f64,
    pub stall_fraction: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            survival: 1.0,
            closer: 5.0,
            farther: -3.0,
            food_base: 100.0,
            food_length_exponent: 1.5,
            collision: -100.0,
            timeout: -50.0,
            edge_penalty: 0.0,
            stall_penalty: 0.0,
            stall_fraction: 0.7,
        }
    }
}

/// Hyperparameters of the Double DQN agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub gamma: f32,
    pub epsilon_start: f32,
    pub epsilon_min: f32,
    pub epsilon_decay: f32,
    pub tau: f32,
    pub batch_size: usize,
    pub memory_capacity: usize,
    pub learning_rate: f32,
    pub max_grad_norm: f32,
    pub dropout: f32,
    /// Learn once every `train_every` environment steps.
    pub train_every: u64,
    pub seed: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            epsilon_start: 1.0,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            tau: 0.005,
            batch_size: 64,
            memory_capacity: 50_000,
            learning_rate: 0.001,
            max_grad_norm: 1.0,
            dropout: 0.2,
            train_every: 1,
            seed: 42,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub episodes: u64,
    pub checkpoint_every: u64,
    pub log_every: u64,
    pub save_dir: PathBuf,
    /// Restore from `save_dir/checkpoint.json` when it exists.
    pub resume: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            episodes: 2_000,
            checkpoint_every: 50,
            log_every: 20,
            save_dir: PathBuf::from("models"),
            resume: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env: EnvConfig,
    pub rewards: RewardConfig,
    pub agent: AgentConfig,
    pub train: TrainConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let env = &self.env;
        if env.width < 5 || env.height < 5 {
            return Err(SnakeError::Config(format!(
                "grid must be at least 5x5, got {}x{}",
                env.width, env.height
            )));
        }
        if env.timeout() == 0 {
            return Err(SnakeError::Config(
                "max_steps_without_food must be positive".into(),
            ));
        }

        let agent = &self.agent;
        if !(0.0..=1.0).contains(&agent.gamma) {
            return Err(SnakeError::Config(format!(
                "gamma must be in [0, 1], got {}",
                agent.gamma
            )));
        }
        if !(agent.tau > 0.0 && agent.tau <= 1.0) {
            return Err(SnakeError::Config(format!(
                "tau must be in (0, 1], got {}",
                agent.tau
            )));
        }
        if !(0.0..=1.0).contains(&agent.epsilon_min)
            || agent.epsilon_start < agent.epsilon_min
            || agent.epsilon_start > 1.0
        {
            return Err(SnakeError::Config(format!(
                "epsilon schedule {} -> {} is invalid",
                agent.epsilon_start, agent.epsilon_min
            )));
        }
        if !(agent.epsilon_decay > 0.0 && agent.epsilon_decay <= 1.0) {
            return Err(SnakeError::Config(format!(
                "epsilon_decay must be in (0, 1], got {}",
                agent.epsilon_decay
            )));
        }
        if !(0.0..1.0).contains(&agent.dropout) {
            return Err(SnakeError::Config(format!(
                "dropout must be in [0, 1), got {}",
                agent.dropout
            )));
        }
        if agent.batch_size == 0 || agent.batch_size > agent.memory_capacity {
            return Err(SnakeError::Config(format!(
                "batch_size {} must be in 1..={}",
                agent.batch_size, agent.memory_capacity
            )));
        }
        if agent.learning_rate <= 0.0 || agent.max_grad_norm <= 0.0 {
            return Err(SnakeError::Config(
                "learning_rate and max_grad_norm must be positive".into(),
            ));
        }
        if agent.train_every == 0 {
            return Err(SnakeError::Config("train_every must be positive".into()));
        }

        if self.train.checkpoint_every == 0 || self.train.log_every == 0 {
            return Err(SnakeError::Config(
                "checkpoint_every and log_every must be positive".into(),
            ));
        }
        Ok(())
    }
}
