mod config;
mod experiments;
mod storage;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use experiments::env::EnvRegistry;
use experiments::hopper::{self, Domain};
use experiments::ppo::PpoConfig;
use experiments::transfer::{EpisodeEvaluator, PpoTrainer, TransferExperiment};
use experiments::tuning::{self, Direction, SamplerKind, Study, TuneSettings};
use storage::ArtifactStore;

#[derive(Parser)]
#[command(name = "hopper-transfer", about = "PPO sim-to-sim transfer experiments on a planar hopper")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on source, evaluate on source and target, then train and evaluate on target
    Transfer {
        /// Training budget per policy
        #[arg(long, default_value = "1000000")]
        timesteps: usize,

        /// Evaluation episodes per pair
        #[arg(long, default_value = "50")]
        eval_episodes: usize,

        /// Parallel environment copies during training
        #[arg(long, default_value = "4")]
        n_envs: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Where model_ppo_<variant>.json files are written
        #[arg(long, default_value = ".")]
        artifact_dir: PathBuf,

        /// JSON file overriding PPO defaults
        #[arg(long)]
        ppo_config: Option<PathBuf>,

        /// Log every PPO update at info level
        #[arg(long, default_value = "false")]
        verbose: bool,
    },

    /// Run a saved policy deterministically and log episode returns
    Replay {
        /// Variant the policy was trained on
        #[arg(long, value_enum, default_value = "source")]
        model: Domain,

        /// Variant to run it on
        #[arg(long, value_enum, default_value = "target")]
        env: Domain,

        #[arg(long, default_value = "1000")]
        steps: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        #[arg(long, default_value = ".")]
        artifact_dir: PathBuf,
    },

    /// Hyperparameter search over PPO settings on the source variant
    Tune {
        #[arg(long, default_value = "100")]
        trials: usize,

        /// Training budget per trial
        #[arg(long, default_value = "100000")]
        timesteps: usize,

        #[arg(long, default_value = "10")]
        eval_episodes: usize,

        #[arg(long, default_value = "4")]
        n_envs: usize,

        #[arg(long, value_enum, default_value = "random")]
        sampler: SamplerKind,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Write all trials and the best one as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut registry = EnvRegistry::new();
    hopper::register(&mut registry)?;

    match cli.command {
        Command::Transfer { timesteps, eval_episodes, n_envs, seed, artifact_dir, ppo_config, verbose } => {
            let cfg = config::Config { artifact_dir, seed, n_envs, verbose };
            let ppo = match &ppo_config {
                Some(path) => config::load_ppo_config(path)?,
                None => PpoConfig::default(),
            };
            tracing::info!(
                timesteps,
                eval_episodes,
                n_envs = cfg.n_envs,
                seed = cfg.seed,
                artifact_dir = %cfg.artifact_dir.display(),
                "Starting transfer experiment"
            );

            let experiment = TransferExperiment::hopper(&registry)?;
            let mut trainer = PpoTrainer {
                registry: &registry,
                config: ppo,
                total_timesteps: timesteps,
                n_envs: cfg.n_envs,
                seed: cfg.seed,
                verbose: cfg.verbose,
                store: Some(ArtifactStore::new(&cfg.artifact_dir)),
            };
            let mut evaluator = EpisodeEvaluator {
                registry: &registry,
                n_episodes: eval_episodes,
                deterministic: false,
                seed: cfg.seed,
            };
            experiment.run(&mut trainer, &mut evaluator)?;
        }

        Command::Replay { model, env, steps, seed, artifact_dir } => {
            let store = ArtifactStore::new(artifact_dir);
            experiments::replay::run(&registry, &store, model, env, steps, seed)?;
        }

        Command::Tune { trials, timesteps, eval_episodes, n_envs, sampler, seed, output } => {
            tracing::info!(trials, timesteps, eval_episodes, n_envs, sampler = ?sampler, seed, "Starting hyperparameter search");
            let settings = TuneSettings {
                total_timesteps: timesteps,
                n_eval_episodes: eval_episodes,
                n_envs,
                seed,
                ..TuneSettings::default()
            };
            let mut study = Study::new(Direction::Maximize, sampler.build(seed));
            study.optimize(tuning::ppo_objective(&registry, settings), trials)?;

            match study.best_trial() {
                Some(best) => {
                    println!("Best params: {}", serde_json::to_string(&best.params)?);
                    tracing::info!(trial = best.number, value = ?best.value, "Best trial");
                }
                None => tracing::warn!("No trial completed with a finite value"),
            }
            if let Some(path) = output {
                study.save_json(&path)?;
            }
        }
    }

    Ok(())
}
