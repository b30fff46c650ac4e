use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AgentConfig;
use crate::engine::{Action, ACTION_COUNT};
use crate::error::{Result, SnakeError};
use crate::nn::{Network, OUTPUT_SIZE};
use crate::optimizer::{Adam, AdamConfig};
use crate::replay::{ReplayMemory, Transition};

/// Everything needed to resume training, minus the replay memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentState {
    pub network: Network,
    pub target_network: Network,
    pub optimizer: Adam,
    pub epsilon: f32,
    /// Completed episodes.
    pub episode: u64,
    pub learn_steps: u64,
}

impl AgentState {
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.target_network.validate()?;
        self.optimizer.validate(&self.network)?;
        if !self.network.is_finite() || !self.target_network.is_finite() {
            return Err(SnakeError::Config(
                "stored parameters contain non-finite values".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(SnakeError::Config(format!(
                "stored epsilon {} out of range",
                self.epsilon
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LearnStats {
    pub loss: f32,
    /// Mean online Q of the actions actually taken in the batch.
    pub mean_q: f32,
    pub grad_norm: f32,
}

fn argmax(q: &[f32; OUTPUT_SIZE]) -> usize {
    q.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

pub struct DQNAgent {
    pub network: Network,
    pub target_network: Network,
    optimizer: Adam,
    memory: ReplayMemory,
    config: AgentConfig,
    pub epsilon: f32,
    episode: u64,
    step_count: u64,
    learn_steps: u64,
    rng: StdRng,
}

impl DQNAgent {
    pub fn new(config: AgentConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(config, rng)
    }

    pub fn with_rng(config: AgentConfig, mut rng: StdRng) -> Self {
        let network = Network::new(config.dropout, &mut rng);
        let target_network = network.clone();
        let optimizer = Adam::new(&network, Self::adam_config(&config));
        DQNAgent {
            network,
            target_network,
            optimizer,
            memory: ReplayMemory::new(config.memory_capacity),
            epsilon: config.epsilon_start,
            config,
            episode: 0,
            step_count: 0,
            learn_steps: 0,
            rng,
        }
    }

    /// Rebuilds an agent from a checkpoint. The generator is reseeded from
    /// `config.seed + episode`, so a resumed run is reproducible.
    pub fn from_state(config: AgentConfig, state: AgentState) -> Result<Self> {
        state.validate()?;
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(state.episode));
        Ok(DQNAgent {
            network: state.network,
            target_network: state.target_network,
            optimizer: state.optimizer,
            memory: ReplayMemory::new(config.memory_capacity),
            epsilon: state.epsilon,
            config,
            episode: state.episode,
            step_count: 0,
            learn_steps: state.learn_steps,
            rng,
        })
    }

    pub fn state(&self) -> AgentState {
        AgentState {
            network: self.network.clone(),
            target_network: self.target_network.clone(),
            optimizer: self.optimizer.clone(),
            epsilon: self.epsilon,
            episode: self.episode,
            learn_steps: self.learn_steps,
        }
    }

    fn adam_config(config: &AgentConfig) -> AdamConfig {
        AdamConfig {
            lr: config.learning_rate,
            max_grad_norm: config.max_grad_norm,
            ..AdamConfig::default()
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn learn_steps(&self) -> u64 {
        self.learn_steps
    }

    pub fn memory(&self) -> &ReplayMemory {
        &self.memory
    }

    pub fn buffer_len(&self) -> usize {
        self.memory.len()
    }

    /// Epsilon-greedy over the online network.
    pub fn act(&mut self, features: &[f32]) -> Action {
        if self.rng.gen::<f32>() < self.epsilon {
            Action::ALL[self.rng.gen_range(0..ACTION_COUNT)]
        } else {
            self.act_greedy(features)
        }
    }

    pub fn act_greedy(&self, features: &[f32]) -> Action {
        let q = self.network.forward(features);
        Action::ALL[argmax(&q)]
    }

    pub fn q_values(&self, features: &[f32]) -> [f32; OUTPUT_SIZE] {
        self.network.forward(features)
    }

    pub fn remember(&mut self, transition: Transition) {
        self.memory.push(transition);
    }

    /// Counts an environment step and learns every `train_every` steps.
    pub fn step_and_train(&mut self) -> Result<Option<LearnStats>> {
        self.step_count += 1;
        if self.step_count % self.config.train_every != 0 {
            return Ok(None);
        }
        self.learn()
    }

    /// One Double-DQN update followed by a soft target update.
    ///
    /// Returns `Ok(None)` without touching any parameters while the replay
    /// memory holds less than one batch.
    pub fn learn(&mut self) -> Result<Option<LearnStats>> {
        let batch = match self.memory.sample(self.config.batch_size, &mut self.rng) {
            Ok(batch) => batch,
            Err(SnakeError::InsufficientData { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let bs = batch.len();
        let gamma = self.config.gamma;

        let states: Vec<&[f32]> = batch.iter().map(|t| t.state.as_slice()).collect();
        let next_states: Vec<&[f32]> = batch.iter().map(|t| t.next_state.as_slice()).collect();

        // Online network picks the next action, target network scores it.
        let next_online = self.network.predict_batch(&next_states);
        let next_target = self.target_network.predict_batch(&next_states);
        let targets: Vec<f32> = batch
            .iter()
            .enumerate()
            .map(|(i, t)| {
                if t.done {
                    t.reward as f32
                } else {
                    t.reward as f32 + gamma * next_target[i][argmax(&next_online[i])]
                }
            })
            .collect();

        let pass = self.network.forward_train(&states, &mut self.rng);
        let output = pass.output();
        let mut d_output = vec![0.0f32; bs * OUTPUT_SIZE];
        let mut loss = 0.0f32;
        let mut q_sum = 0.0f32;
        for (i, t) in batch.iter().enumerate() {
            let idx = i * OUTPUT_SIZE + t.action;
            let err = output[idx] - targets[i];
            loss += err * err;
            q_sum += output[idx];
            d_output[idx] = 2.0 * err;
        }
        loss /= bs as f32;

        let grads = self.network.backward(&pass, &d_output);
        let grad_norm = self.optimizer.step(&mut self.network, &grads);
        self.target_network =
            Network::soft_merge(&self.network, &self.target_network, self.config.tau);
        self.learn_steps += 1;

        let step = self.learn_steps;
        if !loss.is_finite() {
            return Err(SnakeError::NumericalInstability { step, what: "loss" });
        }
        if !self.network.is_finite() {
            return Err(SnakeError::NumericalInstability {
                step,
                what: "online parameters",
            });
        }
        if !self.target_network.is_finite() {
            return Err(SnakeError::NumericalInstability {
                step,
                what: "target parameters",
            });
        }

        if step % 1_000 == 0 {
            debug!(step, loss, grad_norm, "learning step");
        }

        Ok(Some(LearnStats {
            loss,
            mean_q: q_sum / bs as f32,
            grad_norm,
        }))
    }

    /// Decays epsilon and advances the episode counter.
    pub fn end_episode(&mut self) {
        self.decay_epsilon();
        self.episode += 1;
    }

    fn decay_epsilon(&mut self) {
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
    }
}
