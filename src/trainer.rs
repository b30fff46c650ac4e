use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::DQNAgent;
use crate::checkpoint::{
    load_checkpoint_if_exists, read_json, save_checkpoint, write_json_atomic, Checkpoint,
    BEST_MODEL_FILE, CHECKPOINT_FILE, FINAL_MODEL_FILE, TRAINING_LOG_FILE,
};
use crate::config::{AgentConfig, TrainConfig};
use crate::engine::Environment;
use crate::error::Result;
use crate::replay::Transition;

const ROLLING_WINDOW: usize = 100;

/// Per-episode metrics handed to plotting and logging collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// 1-based.
    pub episode: u64,
    pub score: i64,
    pub total_reward: f64,
    pub length: u64,
    /// Epsilon after the end-of-episode decay.
    pub epsilon: f32,
    /// Zero when no learning step ran during the episode.
    pub average_loss: f32,
    pub average_q: f32,
}

pub trait MetricsSink {
    fn record(&mut self, record: &EpisodeRecord) -> Result<()>;
}

impl MetricsSink for Vec<EpisodeRecord> {
    fn record(&mut self, record: &EpisodeRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Appends one JSON object per line, flushed after every episode.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonLinesSink {
            writer: BufWriter::new(file),
        })
    }

    /// Opens `path` for a run that continues after `completed` episodes,
    /// first dropping records the run is about to replay.
    pub fn resume(path: &Path, completed: u64) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            let mut kept = String::with_capacity(text.len());
            let mut dropped = 0usize;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<EpisodeRecord>(line) {
                    Ok(record) if record.episode <= completed => {
                        kept.push_str(line);
                        kept.push('\n');
                    }
                    _ => dropped += 1,
                }
            }
            if dropped > 0 {
                fs::write(path, kept)?;
                info!(dropped, completed, "Trimmed episode log {:?}", path);
            }
        }
        Self::open(path)
    }
}

impl MetricsSink for JsonLinesSink {
    fn record(&mut self, record: &EpisodeRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingLog {
    pub records: Vec<EpisodeRecord>,
    pub best_score: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSummary {
    /// Episodes run by this call.
    pub episodes_run: u64,
    /// Episodes completed over the agent's lifetime.
    pub episodes_completed: u64,
    pub best_score: Option<i64>,
    pub stopped: bool,
}

pub struct Trainer<E: Environment> {
    config: TrainConfig,
    env: E,
    agent: DQNAgent,
    best_score: Option<i64>,
    history: Vec<EpisodeRecord>,
    recent_scores: VecDeque<i64>,
    stop: Arc<AtomicBool>,
}

impl<E: Environment> Trainer<E> {
    pub fn new(config: TrainConfig, env: E, agent: DQNAgent) -> Self {
        Trainer {
            config,
            env,
            agent,
            best_score: None,
            history: Vec::new(),
            recent_scores: VecDeque::with_capacity(ROLLING_WINDOW),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Restores from `save_dir/checkpoint.json` when resuming is enabled and a
    /// checkpoint exists; otherwise starts a fresh agent. The best score is the
    /// higher of the checkpoint's and `best_model.json`'s. A checkpoint that
    /// fails to load is an error, never a silent restart.
    pub fn resume(config: TrainConfig, agent_config: AgentConfig, env: E) -> Result<Self> {
        let path = config.save_dir.join(CHECKPOINT_FILE);
        let stored = if config.resume {
            load_checkpoint_if_exists(&path)?
        } else {
            None
        };

        // best_model.json can be newer than the last checkpoint.
        let best_saved = if config.resume {
            load_checkpoint_if_exists(&config.save_dir.join(BEST_MODEL_FILE))?
                .and_then(|best| best.best_score)
        } else {
            None
        };

        let Some(checkpoint) = stored else {
            let mut trainer = Self::new(config, env, DQNAgent::new(agent_config));
            trainer.best_score = best_saved;
            return Ok(trainer);
        };

        let best_score = checkpoint.best_score.max(best_saved);
        let agent = DQNAgent::from_state(agent_config, checkpoint.agent)?;
        info!(
            episode = agent.episode(),
            epsilon = agent.epsilon,
            best_score = ?best_score,
            "Resuming from {:?}",
            path
        );

        let mut trainer = Self::new(config, env, agent);
        trainer.best_score = best_score;
        trainer.restore_history();
        Ok(trainer)
    }

    fn restore_history(&mut self) {
        let path = self.config.save_dir.join(TRAINING_LOG_FILE);
        if !path.exists() {
            return;
        }
        match read_json::<TrainingLog>(&path) {
            Ok(log) => {
                let done = self.agent.episode();
                self.history = log
                    .records
                    .into_iter()
                    .filter(|r| r.episode <= done)
                    .collect();
                let start = self.history.len().saturating_sub(ROLLING_WINDOW);
                self.recent_scores = self.history[start..].iter().map(|r| r.score).collect();
            }
            Err(e) => warn!("Ignoring unreadable training log {:?}: {}", path, e),
        }
    }

    /// Set to request a stop; honoured between episodes.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn agent(&self) -> &DQNAgent {
        &self.agent
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn best_score(&self) -> Option<i64> {
        self.best_score
    }

    pub fn history(&self) -> &[EpisodeRecord] {
        &self.history
    }

    /// Plays one episode to termination, learning along the way.
    pub fn run_episode(&mut self) -> Result<EpisodeRecord> {
        let mut state = self.env.reset();
        let mut total_reward = 0.0;
        let mut length = 0u64;
        let mut loss_sum = 0.0f32;
        let mut q_sum = 0.0f32;
        let mut learn_count = 0u32;

        loop {
            let action = self.agent.act(&state);
            let step = self.env.step(action);

            self.agent.remember(Transition {
                state,
                action: action.index(),
                reward: step.reward,
                next_state: step.features.clone(),
                done: step.done,
            });

            if let Some(stats) = self.agent.step_and_train()? {
                loss_sum += stats.loss;
                q_sum += stats.mean_q;
                learn_count += 1;
            }

            total_reward += step.reward;
            length += 1;
            state = step.features;

            if step.done {
                break;
            }
        }

        self.agent.end_episode();
        let score = self.env.score();

        let (average_loss, average_q) = if learn_count > 0 {
            (loss_sum / learn_count as f32, q_sum / learn_count as f32)
        } else {
            (0.0, 0.0)
        };

        Ok(EpisodeRecord {
            episode: self.agent.episode(),
            score,
            total_reward,
            length,
            epsilon: self.agent.epsilon,
            average_loss,
            average_q,
        })
    }

    /// Trains until `config.episodes` episodes are complete or a stop is requested.
    pub fn run(&mut self, sink: &mut dyn MetricsSink) -> Result<TrainingSummary> {
        fs::create_dir_all(&self.config.save_dir)?;
        let start = Instant::now();
        let first_episode = self.agent.episode();
        let mut stopped = false;

        info!(
            from = first_episode + 1,
            to = self.config.episodes,
            save_dir = ?self.config.save_dir,
            "Training Double DQN"
        );

        while self.agent.episode() < self.config.episodes {
            if self.stop.load(Ordering::SeqCst) {
                info!(episode = self.agent.episode(), "Stop requested");
                stopped = true;
                break;
            }

            let record = self.run_episode()?;
            let episode = record.episode;
            sink.record(&record)?;

            self.recent_scores.push_back(record.score);
            if self.recent_scores.len() > ROLLING_WINDOW {
                self.recent_scores.pop_front();
            }

            if self.best_score.map_or(true, |best| record.score > best) {
                self.best_score = Some(record.score);
                self.save_model(BEST_MODEL_FILE)?;
            }

            if episode % self.config.log_every == 0 || episode == first_episode + 1 {
                let avg = self.recent_scores.iter().sum::<i64>() as f64
                    / self.recent_scores.len() as f64;
                info!(
                    episode,
                    score = record.score,
                    max = self.best_score.unwrap_or(0),
                    avg = %format!("{avg:.2}"),
                    steps = record.length,
                    epsilon = %format!("{:.3}", record.epsilon),
                    loss = %format!("{:.4}", record.average_loss),
                    q = %format!("{:.2}", record.average_q),
                    buffer = self.agent.buffer_len(),
                    elapsed_s = start.elapsed().as_secs(),
                    "episode"
                );
            }

            self.history.push(record);

            if episode % self.config.checkpoint_every == 0 {
                self.checkpoint()?;
                info!(episode, "Checkpoint saved");
            }
        }

        self.checkpoint()?;
        self.save_model(FINAL_MODEL_FILE)?;
        info!(
            episodes = self.agent.episode(),
            best_score = ?self.best_score,
            elapsed = ?start.elapsed(),
            "Training finished"
        );

        Ok(TrainingSummary {
            episodes_run: self.agent.episode() - first_episode,
            episodes_completed: self.agent.episode(),
            best_score: self.best_score,
            stopped,
        })
    }

    /// Persists agent state and the training log.
    pub fn checkpoint(&self) -> Result<()> {
        self.save_model(CHECKPOINT_FILE)?;
        let log = TrainingLog {
            records: self.history.clone(),
            best_score: self.best_score,
        };
        write_json_atomic(&self.config.save_dir.join(TRAINING_LOG_FILE), &log)
    }

    fn save_model(&self, file: &str) -> Result<()> {
        let checkpoint = Checkpoint::new(self.agent.state(), self.best_score);
        save_checkpoint(&self.config.save_dir.join(file), &checkpoint)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvalReport {
    pub scores: Vec<i64>,
    pub steps: Vec<u64>,
    pub rewards: Vec<f64>,
}

impl EvalReport {
    pub fn mean_score(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<i64>() as f64 / self.scores.len() as f64
    }

    pub fn std_score(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let mean = self.mean_score();
        let var = self
            .scores
            .iter()
            .map(|&s| (s as f64 - mean).powi(2))
            .sum::<f64>()
            / self.scores.len() as f64;
        var.sqrt()
    }

    pub fn best_score(&self) -> Option<i64> {
        self.scores.iter().copied().max()
    }

    pub fn mean_steps(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.steps.iter().sum::<u64>() as f64 / self.steps.len() as f64
    }
}

/// Plays `episodes` greedy episodes without learning.
pub fn evaluate<E: Environment>(agent: &DQNAgent, env: &mut E, episodes: u64) -> EvalReport {
    let mut report = EvalReport::default();

    for episode in 1..=episodes {
        let mut state = env.reset();
        let mut total_reward = 0.0;
        let mut steps = 0u64;
        loop {
            let step = env.step(agent.act_greedy(&state));
            total_reward += step.reward;
            steps += 1;
            state = step.features;
            if step.done {
                break;
            }
        }

        let score = env.score();
        info!(episode, score, steps, reward = total_reward, "evaluation episode");
        report.scores.push(score);
        report.steps.push(steps);
        report.rewards.push(total_reward);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, RewardConfig};
    use crate::checkpoint::load_checkpoint;
    use crate::engine::SnakeEngine;
    use tempfile::TempDir;

    fn small(dir: &Path, episodes: u64) -> (TrainConfig, AgentConfig, SnakeEngine) {
        let train = TrainConfig {
            episodes,
            checkpoint_every: 2,
            log_every: 1,
            save_dir: dir.to_path_buf(),
            resume: true,
        };
        let agent = AgentConfig {
            batch_size: 4,
            memory_capacity: 256,
            seed: 5,
            ..AgentConfig::default()
        };
        let env = EnvConfig {
            width: 8,
            height: 8,
            max_steps_without_food: Some(40),
            seed: 9,
        };
        let engine = SnakeEngine::new(&env, RewardConfig::default());
        (train, agent, engine)
    }

    #[test]
    fn episode_record_tracks_the_episode() {
        let dir = TempDir::new().unwrap();
        let (train, agent, engine) = small(dir.path(), 1);
        let mut trainer = Trainer::new(train, engine, DQNAgent::new(agent));

        let record = trainer.run_episode().unwrap();
        assert_eq!(record.episode, 1);
        assert!(record.length >= 1);
        assert_eq!(record.score, trainer.env().score());
        assert!((record.epsilon - 0.995).abs() < 1e-6);
        assert_eq!(trainer.agent().buffer_len() as u64, record.length);
    }

    #[test]
    fn run_writes_checkpoint_best_and_final() {
        let dir = TempDir::new().unwrap();
        let (train, agent, engine) = small(dir.path(), 3);
        let mut trainer = Trainer::new(train, engine, DQNAgent::new(agent));
        let mut records: Vec<EpisodeRecord> = Vec::new();

        let summary = trainer.run(&mut records).unwrap();

        assert_eq!(summary.episodes_run, 3);
        assert!(!summary.stopped);
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.episode).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for file in [CHECKPOINT_FILE, BEST_MODEL_FILE, FINAL_MODEL_FILE, TRAINING_LOG_FILE] {
            assert!(dir.path().join(file).exists(), "{file} missing");
        }
        assert_eq!(
            summary.best_score,
            records.iter().map(|r| r.score).max()
        );
    }

    #[test]
    fn stop_request_halts_before_next_episode() {
        let dir = TempDir::new().unwrap();
        let (train, agent, engine) = small(dir.path(), 10);
        let mut trainer = Trainer::new(train, engine, DQNAgent::new(agent));
        trainer.stop_handle().store(true, Ordering::SeqCst);

        let summary = trainer.run(&mut Vec::<EpisodeRecord>::new()).unwrap();
        assert!(summary.stopped);
        assert_eq!(summary.episodes_run, 0);
        assert!(dir.path().join(CHECKPOINT_FILE).exists());
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("episodes.jsonl");
        let record = EpisodeRecord {
            episode: 1,
            score: 2,
            total_reward: 3.5,
            length: 4,
            epsilon: 0.5,
            average_loss: 0.25,
            average_q: 1.0,
        };
        {
            let mut sink = JsonLinesSink::open(&path).unwrap();
            sink.record(&record).unwrap();
            sink.record(&record).unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: EpisodeRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, record);
    }

    fn record(episode: u64) -> EpisodeRecord {
        EpisodeRecord {
            episode,
            score: 0,
            total_reward: 0.0,
            length: 1,
            epsilon: 1.0,
            average_loss: 0.0,
            average_q: 0.0,
        }
    }

    #[test]
    fn jsonl_sink_resume_drops_replayed_episodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("episodes.jsonl");
        {
            let mut sink = JsonLinesSink::open(&path).unwrap();
            for episode in 1..=5 {
                sink.record(&record(episode)).unwrap();
            }
        }

        {
            let mut sink = JsonLinesSink::resume(&path, 3).unwrap();
            sink.record(&record(4)).unwrap();
        }

        let episodes: Vec<u64> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<EpisodeRecord>(l).unwrap().episode)
            .collect();
        assert_eq!(episodes, vec![1, 2, 3, 4]);
    }

    /// Every episode lasts one step and ends with the next scripted score.
    struct ScriptedGame {
        scores: Vec<i64>,
        played: usize,
        current: i64,
    }

    impl ScriptedGame {
        fn new(scores: Vec<i64>) -> Self {
            ScriptedGame {
                scores,
                played: 0,
                current: 0,
            }
        }
    }

    impl Environment for ScriptedGame {
        fn reset(&mut self) -> Vec<f32> {
            self.current = self.scores[self.played % self.scores.len()];
            self.played += 1;
            vec![0.0; crate::features::FEATURE_COUNT]
        }

        fn step(&mut self, _action: crate::engine::Action) -> crate::engine::Step {
            crate::engine::Step {
                features: vec![0.0; crate::features::FEATURE_COUNT],
                reward: self.current as f64,
                done: true,
                score: self.current,
            }
        }

        fn score(&self) -> i64 {
            self.current
        }
    }

    /// Fails when asked to record `episode`, as if the process died there.
    struct FailAt(u64);

    impl MetricsSink for FailAt {
        fn record(&mut self, record: &EpisodeRecord) -> Result<()> {
            if record.episode == self.0 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            Ok(())
        }
    }

    #[test]
    fn best_model_survives_crash_between_checkpoints() {
        let dir = TempDir::new().unwrap();
        let (train, agent, _) = small(dir.path(), 10);
        let best_path = dir.path().join(BEST_MODEL_FILE);

        // Checkpoint at episode 2 stores best 0; episode 3 scores 5; episode 4 dies.
        let mut first = Trainer::new(
            train.clone(),
            ScriptedGame::new(vec![0, 0, 5, 0]),
            DQNAgent::new(agent.clone()),
        );
        assert!(first.run(&mut FailAt(4)).is_err());
        assert_eq!(load_checkpoint(&best_path).unwrap().best_score, Some(5));

        let mut resumed = Trainer::resume(
            TrainConfig {
                episodes: 3,
                ..train
            },
            agent,
            ScriptedGame::new(vec![3]),
        )
        .unwrap();
        assert_eq!(resumed.agent().episode(), 2);
        assert_eq!(resumed.best_score(), Some(5));

        resumed.run(&mut Vec::<EpisodeRecord>::new()).unwrap();
        assert_eq!(resumed.best_score(), Some(5));
        assert_eq!(load_checkpoint(&best_path).unwrap().best_score, Some(5));
    }

    #[test]
    fn best_model_survives_crash_before_first_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (train, agent, _) = small(dir.path(), 10);
        let train = TrainConfig {
            checkpoint_every: 100,
            ..train
        };

        let mut first = Trainer::new(
            train.clone(),
            ScriptedGame::new(vec![4, 0]),
            DQNAgent::new(agent.clone()),
        );
        assert!(first.run(&mut FailAt(2)).is_err());
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());

        let resumed = Trainer::resume(train, agent, ScriptedGame::new(vec![1])).unwrap();
        assert_eq!(resumed.agent().episode(), 0);
        assert_eq!(resumed.best_score(), Some(4));
    }

    #[test]
    fn eval_report_statistics() {
        let report = EvalReport {
            scores: vec![1, 3],
            steps: vec![10, 30],
            rewards: vec![0.0, 0.0],
        };
        assert_eq!(report.mean_score(), 2.0);
        assert_eq!(report.std_score(), 1.0);
        assert_eq!(report.best_score(), Some(3));
        assert_eq!(report.mean_steps(), 20.0);
        assert_eq!(EvalReport::default().mean_score(), 0.0);
    }
}
