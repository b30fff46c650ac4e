//! Durable agent state.
//!
//! Every file is written to a sibling temp file, flushed and synced, then
//! renamed over the destination, so a reader never observes a partial write.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentState;
use crate::error::{Result, SnakeError};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const BEST_MODEL_FILE: &str = "best_model.json";
pub const FINAL_MODEL_FILE: &str = "final_model.json";
pub const TRAINING_LOG_FILE: &str = "training_log.json";

pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub agent: AgentState,
    /// Highest episode score seen so far.
    pub best_score: Option<i64>,
}

impl Checkpoint {
    pub fn new(agent: AgentState, best_score: Option<i64>) -> Self {
        Checkpoint {
            version: FORMAT_VERSION,
            agent,
            best_score,
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serializes `value` as JSON to `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path(path);
    let written = (|| -> Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path)?;
    debug!("Atomically wrote {:?}", path);
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    write_json_atomic(path, checkpoint)
}

/// Loads and validates a checkpoint. Any defect is reported as
/// [`SnakeError::Checkpoint`] naming the file.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let invalid = |reason: String| SnakeError::Checkpoint {
        path: path.to_path_buf(),
        reason,
    };

    let checkpoint: Checkpoint = read_json(path).map_err(|e| invalid(e.to_string()))?;
    if checkpoint.version != FORMAT_VERSION {
        return Err(invalid(format!(
            "format version {} (expected {FORMAT_VERSION})",
            checkpoint.version
        )));
    }
    checkpoint
        .agent
        .validate()
        .map_err(|e| invalid(e.to_string()))?;
    Ok(checkpoint)
}

/// `Ok(None)` when nothing is stored at `path`.
pub fn load_checkpoint_if_exists(path: &Path) -> Result<Option<Checkpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    load_checkpoint(path).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DQNAgent;
    use crate::config::AgentConfig;
    use tempfile::TempDir;

    fn agent() -> DQNAgent {
        DQNAgent::new(AgentConfig {
            memory_capacity: 16,
            batch_size: 4,
            ..AgentConfig::default()
        })
    }

    #[test]
    fn round_trip_preserves_parameters_exactly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let mut agent = agent();
        agent.epsilon = 0.37;

        save_checkpoint(&path, &Checkpoint::new(agent.state(), Some(12))).unwrap();
        let loaded = load_checkpoint(&path).unwrap();

        assert_eq!(loaded.best_score, Some(12));
        assert_eq!(loaded.agent.epsilon, 0.37);
        assert_eq!(loaded.agent.network.parameter_distance(&agent.network), 0.0);
        assert_eq!(
            loaded
                .agent
                .target_network
                .parameter_distance(&agent.target_network),
            0.0
        );
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let found = load_checkpoint_if_exists(&dir.path().join("nope.json")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        save_checkpoint(&path, &Checkpoint::new(agent().state(), None)).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(SnakeError::Checkpoint { .. })
        ));
    }

    #[test]
    fn missing_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let mut value = serde_json::to_value(Checkpoint::new(agent().state(), None)).unwrap();
        value["agent"]
            .as_object_mut()
            .unwrap()
            .remove("target_network");
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(SnakeError::Checkpoint { .. })
        ));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let mut checkpoint = Checkpoint::new(agent().state(), None);
        checkpoint.version = 99;
        write_json_atomic(&path, &checkpoint).unwrap();

        let err = load_checkpoint(&path).unwrap_err();
        assert!(err.to_string().contains("format version 99"));
    }
}
