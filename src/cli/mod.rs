// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with `clap`.
// All work is delegated to Layer 2 (application).
//
//   protoseg train [--config F] [--data-dir D] [--model-dir M]
//                  [--last-layer-only --resume NAME]
//   protoseg push  --model-dir M --checkpoint NAME
//   protoseg test  --model-dir M --checkpoint NAME

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{CheckpointArgs, Commands, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "protoseg",
    version = "0.1.0",
    about = "Train prototype-based (PPNet) patch classifiers on Cityscapes / SUN patches."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Push(args) => run_push(args),
            Commands::Test(args) => run_test(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let cfg = args.to_config()?;
    tracing::info!("Training on '{}', writing to '{}'", cfg.data_dir, cfg.model_dir);

    let use_case = TrainUseCase::new(cfg, args.last_layer_only, args.resume);
    let test = use_case.execute()?;

    println!("Training complete. Test accuracy: {:.2}%", test.accuracy() * 100.0);
    Ok(())
}

fn run_push(args: CheckpointArgs) -> Result<()> {
    use crate::application::push_use_case::{PushUseCase, PUSH_CHECKPOINT};

    let projections = PushUseCase::new(&args.model_dir, &args.checkpoint)?.execute()?;
    let pushed = projections.iter().filter(|p| p.sample_index.is_some()).count();

    println!(
        "Pushed {}/{} prototypes. Saved as '{}'.",
        pushed,
        projections.len(),
        PUSH_CHECKPOINT
    );
    Ok(())
}

fn run_test(args: CheckpointArgs) -> Result<()> {
    use crate::application::test_use_case::TestUseCase;

    let test = TestUseCase::new(&args.model_dir, &args.checkpoint)?.execute()?;
    println!(
        "Checkpoint '{}': accuracy {:.2}% over {} patches",
        args.checkpoint,
        test.accuracy() * 100.0,
        test.n_examples
    );
    Ok(())
}
