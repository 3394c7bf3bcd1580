mod common;
mod fit_volume;
mod score_volume;
mod stae_input;

use clap::{Parser, Subcommand};
use common::info;
use fit_volume::*;
use score_volume::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "STAE",
    long_about = "Spatio-Temporal AutoEncoder for abnormal event detection in video\n\
		  Frames or volumes are read from `.npy` files. \n\
		  Reconstruction error per frame is the anomaly signal."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a spatio-temporal autoencoder on regular video",
        long_about = "Train the autoencoder in the three stages: \n\
		      (1) Cut frames into sliding volumes of T frames\n\
		      (2) Minimize reconstruction + L2 loss with Adam\n\
		      (3) Checkpoint parameters and optimizer state.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Score frames by reconstruction error",
        long_about = "Compute per-frame reconstruction errors of a trained model\n\
		      and the regularity score 1 - (e - min) / (max - min).\n\
		      Low regularity marks abnormal frames.\n"
    )]
    Score(ScoreArgs),

    /// reconstruct volumes with a trained model
    Reconstruct(ReconstructArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            fit_volume_model(args)?;
        }
        Commands::Score(args) => {
            score_volumes(args)?;
        }
        Commands::Reconstruct(args) => {
            reconstruct_volumes(args)?;
        }
    }

    info!("Done");
    Ok(())
}
