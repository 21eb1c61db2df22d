// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands: `train`, `push` and `test`.
//
// Hyper-parameters live in a JSON config file (see
// TrainConfig); the flags here only override the paths and
// choose the kind of run.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::application::train_use_case::TrainConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a prototype network, then evaluate it on the test loader
    Train(TrainArgs),

    /// Project prototypes onto their nearest training patches
    Push(CheckpointArgs),

    /// Evaluate a saved checkpoint on the test loader
    Test(CheckpointArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// JSON file with hyper-parameters; missing fields use defaults
    #[arg(long)]
    pub config: Option<String>,

    /// Dataset root containing `annotations/`
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Run directory for checkpoints, prototypes and metrics.csv
    #[arg(long)]
    pub model_dir: Option<String>,

    /// Only train the last layer (after a push)
    #[arg(long, requires = "resume")]
    pub last_layer_only: bool,

    /// Checkpoint name under `{model_dir}/checkpoints` to start from
    #[arg(long)]
    pub resume: Option<String>,
}

impl TrainArgs {
    /// Config file (or defaults) with the path flags applied on top
    pub fn to_config(&self) -> Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(dir) = &self.model_dir {
            cfg.model_dir = dir.clone();
        }
        Ok(cfg)
    }
}

#[derive(Args, Debug)]
pub struct CheckpointArgs {
    /// Run directory the checkpoint was saved in
    #[arg(long)]
    pub model_dir: String,

    /// Checkpoint name, e.g. `nopush_best` or `push`
    #[arg(long)]
    pub checkpoint: String,
}
