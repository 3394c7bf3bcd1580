use crate::common::*;
use crate::stae_input::*;
use clap::Args;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        required = true,
        help = "Training frames (.npy)",
        long_help = "Training video as a `.npy` file.\n\
		     Either a frame stack (F, H, W) / (F, H, W, 1), cut into\n\
		     sliding volumes, or ready-made volumes (N, T, H, W, 1).\n\
		     8-bit pixels are scaled to [0, 1]."
    )]
    data_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Model directory",
        long_help = "Directory for checkpoints:\n\
		     - {out}/model.safetensors\n\
		     - {out}/config.json\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        short = 't',
        help = "Frames per volume [default: 10]",
        long_help = "Number of consecutive frames in each volume (T).\n\
		     Fixed for the lifetime of a model; with --warm-start\n\
		     it must match the saved model if given."
    )]
    tvol: Option<usize>,

    #[arg(
        long,
        default_value_t = 1,
        help = "Sliding window stride",
        long_help = "Offset between the first frames of consecutive volumes."
    )]
    stride: usize,

    #[arg(long, help = "Frame height [default: 227]")]
    height: Option<usize>,

    #[arg(long, help = "Frame width [default: 227]")]
    width: Option<usize>,

    #[arg(
        long,
        short = 'i',
        default_value_t = 10,
        help = "Number of training epochs",
        long_help = "Number of training epochs.\n\
		     Controls how many times the model is trained over the data."
    )]
    epochs: usize,

    #[arg(
        long,
        default_value_t = 8,
        help = "Minibatch size",
        long_help = "Minibatch size for training.\n\
		     Controls the number of volumes per training batch."
    )]
    minibatch_size: usize,

    #[arg(
        long,
        default_value_t = 1e-4,
        help = "Learning rate",
        long_help = "Learning rate for Adam.\n\
		     Controls the step size for parameter updates."
    )]
    learning_rate: f32,

    #[arg(
        long,
        default_value_t = 1e-4,
        help = "L2 regularization weight",
        long_help = "Weight of the L2 penalty on convolution kernels\n\
		     added to the reconstruction loss."
    )]
    lambd: f32,

    #[arg(
        long,
        default_value_t = 1,
        help = "Checkpoint interval (epochs)",
        long_help = "Save a checkpoint every this many epochs.\n\
		     The final model is always saved."
    )]
    save_every: usize,

    #[arg(
        long,
        short = 'w',
        help = "Warm start model directory",
        long_help = "Resume from a previous model directory.\n\
		     Its config.json decides the architecture."
    )]
    warm_start: Option<Box<str>>,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or meta, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    verbose: bool,
}

pub fn fit_volume_model(args: &TrainArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let out_dir = PathBuf::from(&*args.out);

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        lambd: args.lambd,
        num_epochs: args.epochs,
        device: make_device(&args.device, args.device_no)?,
        verbose: args.verbose,
        show_progress: true,
    };

    // 1. Build a new model or pick up a previous one
    let mut model = if let Some(dir) = args.warm_start.as_deref() {
        info!("Warm start from {}", dir);
        let model = Experiment::from_checkpoint(Path::new(dir), &train_config)?;
        check_warm_start(model.config(), args.tvol, args.height, args.width)?;
        model
    } else {
        let config = StaeConfig::new(args.tvol.unwrap_or(DEFAULT_TVOL)).with_frame_size(
            args.height.unwrap_or(HEIGHT),
            args.width.unwrap_or(WIDTH),
        );
        Experiment::with_config(config, &train_config)?
    };

    // 2. Cut the frames into volumes
    let mut data = read_volume_data(&args.data_file, model.config(), args.stride)?;

    // 3. Train, saving along the way
    let save_every = args.save_every.max(1);
    let loss_trace = model.train_volumes(&mut data, &train_config, |epoch, loss, model| {
        if (epoch + 1) % save_every == 0 {
            model.save_model(&out_dir)?;
            info!("[{}] loss: {}, saved to {}", epoch + 1, loss, out_dir.display());
        }
        Ok(())
    })?;

    model.save_model(&out_dir)?;

    if let Some(last) = loss_trace.last() {
        info!("Final loss after {} epochs: {}", loss_trace.len(), last);
    }
    Ok(())
}

/// Shape arguments given along with a warm start must agree with the
/// saved model
fn check_warm_start(
    config: &StaeConfig,
    tvol: Option<usize>,
    height: Option<usize>,
    width: Option<usize>,
) -> anyhow::Result<()> {
    for (arg, requested, saved) in [
        ("--tvol", tvol, config.tvol),
        ("--height", height, config.height),
        ("--width", width, config.width),
    ] {
        if let Some(requested) = requested {
            if requested != saved {
                anyhow::bail!(
                    "{} {} conflicts with the warm-start model ({})",
                    arg,
                    requested,
                    saved
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warm_start_shape_arguments() {
        let config = StaeConfig::new(8).with_frame_size(64, 48);
        assert!(check_warm_start(&config, None, None, None).is_ok());
        assert!(check_warm_start(&config, Some(8), Some(64), Some(48)).is_ok());
        assert!(check_warm_start(&config, Some(10), None, None).is_err());
        assert!(check_warm_start(&config, None, Some(227), None).is_err());
        assert!(check_warm_start(&config, None, None, Some(64)).is_err());
    }
}
