use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use snake_dqn::checkpoint::{load_checkpoint, BEST_MODEL_FILE};
use snake_dqn::trainer::JsonLinesSink;
use snake_dqn::{evaluate, Config, DQNAgent, SnakeEngine, Trainer};

#[derive(Parser)]
#[command(name = "snake_dqn")]
#[command(version, about = "Double DQN snake trainer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file; missing fields take their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seed for both the agent and the game
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Grid width and height
    #[arg(long, global = true)]
    grid: Option<i32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train, resuming from the latest checkpoint in the save directory
    Train {
        #[arg(long)]
        episodes: Option<u64>,

        #[arg(long)]
        checkpoint_every: Option<u64>,

        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Ignore any existing checkpoint
        #[arg(long)]
        fresh: bool,
    },
    /// Play greedy episodes with a saved model
    Play {
        /// Defaults to the best model in the save directory
        #[arg(long)]
        model: Option<PathBuf>,

        #[arg(long, default_value = "10")]
        episodes: u64,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => Config::default(),
    };

    if let Some(seed) = cli.seed {
        config.agent.seed = seed;
        config.env.seed = seed.wrapping_add(1);
    }
    if let Some(grid) = cli.grid {
        config.env.width = grid;
        config.env.height = grid;
    }
    Ok(config)
}

/// First Ctrl-C asks the trainer to stop after the running episode; a second one exits.
fn stop_on_ctrl_c(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, stopping after the current episode (Ctrl-C again to abort)");
        stop.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Aborting without a final checkpoint");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Train {
            episodes,
            checkpoint_every,
            save_dir,
            fresh,
        } => {
            if let Some(n) = episodes {
                config.train.episodes = n;
            }
            if let Some(n) = checkpoint_every {
                config.train.checkpoint_every = n;
            }
            if let Some(dir) = save_dir {
                config.train.save_dir = dir;
            }
            if fresh {
                config.train.resume = false;
            }
            config.validate().context("Invalid configuration")?;

            info!(
                grid = %format!("{}x{}", config.env.width, config.env.height),
                timeout = config.env.timeout(),
                gamma = config.agent.gamma,
                tau = config.agent.tau,
                batch = config.agent.batch_size,
                "=== Snake Double DQN Trainer ==="
            );

            let engine = SnakeEngine::new(&config.env, config.rewards.clone());
            let mut trainer =
                Trainer::resume(config.train.clone(), config.agent.clone(), engine)
                    .context("Failed to restore training state")?;
            let mut sink = JsonLinesSink::resume(
                &config.train.save_dir.join("episodes.jsonl"),
                trainer.agent().episode(),
            )
            .context("Failed to open episode log")?;

            stop_on_ctrl_c(trainer.stop_handle());
            let summary = tokio::task::spawn_blocking(move || trainer.run(&mut sink))
                .await
                .context("Training thread panicked")?
                .context("Training aborted")?;
            info!(
                episodes = summary.episodes_completed,
                best_score = ?summary.best_score,
                stopped = summary.stopped,
                "Done"
            );
        }
        Commands::Play { model, episodes } => {
            config.validate().context("Invalid configuration")?;
            let path = model.unwrap_or_else(|| config.train.save_dir.join(BEST_MODEL_FILE));
            let checkpoint = load_checkpoint(&path)
                .with_context(|| format!("Could not load model from {:?}", path))?;
            let agent = DQNAgent::from_state(config.agent.clone(), checkpoint.agent)?;
            info!("Loaded model from {:?}", path);

            let mut engine = SnakeEngine::new(&config.env, config.rewards.clone());
            let report = evaluate(&agent, &mut engine, episodes);
            info!(
                average_score = %format!("{:.2} ± {:.2}", report.mean_score(), report.std_score()),
                best_score = ?report.best_score(),
                average_steps = %format!("{:.1}", report.mean_steps()),
                "Evaluation results"
            );
        }
    }

    Ok(())
}
