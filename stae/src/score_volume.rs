use crate::common::*;
use crate::stae_input::*;
use candle_core::Tensor;
use clap::Args;

#[derive(Args, Debug)]
pub struct ScoreArgs {
    #[arg(required = true, help = "Test frames (.npy)")]
    data_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Model directory",
        long_help = "Directory written by `stae train`."
    )]
    model: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.recon_errors.npy (volume x frame)\n\
		     - {out}.frame_errors.npy (frame)\n\
		     - {out}.regularity.npy (frame)\n\
		     Frames no window covers are NaN."
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 1, help = "Sliding window stride")]
    stride: usize,

    #[arg(long, default_value_t = 8, help = "Minibatch size")]
    minibatch_size: usize,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

#[derive(Args, Debug)]
pub struct ReconstructArgs {
    #[arg(required = true, help = "Frames (.npy)")]
    data_file: Box<str>,

    #[arg(long, short, required = true, help = "Model directory")]
    model: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output file",
        long_help = "Reconstructed volumes (N, T, H, W, 1) as `.npy`"
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 1, help = "Sliding window stride")]
    stride: usize,

    #[arg(long, default_value_t = 8, help = "Minibatch size")]
    minibatch_size: usize,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

fn load_model(
    model_dir: &str,
    minibatch_size: usize,
    device: &ComputeDevice,
    device_no: usize,
) -> anyhow::Result<Experiment> {
    let mut train_config = TrainConfig::new(0., minibatch_size, 0.);
    train_config.device = make_device(device, device_no)?;
    Experiment::from_checkpoint(Path::new(model_dir), &train_config)
}

pub fn score_volumes(args: &ScoreArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let model = load_model(&args.model, args.minibatch_size, &args.device, args.device_no)?;
    let data = read_volume_data(&args.data_file, model.config(), args.stride)?;

    let volume_errors = model.score_volumes(&data)?;
    // ready-made volumes do not overlap, whatever `--stride` says
    let per_frame = frame_errors(&volume_errors, data.stride());
    let regularity = regularity_scores(&per_frame);

    let uncovered = per_frame.iter().filter(|e| e.is_nan()).count();
    if uncovered > 0 {
        info!("{} frames fall between windows and are left as NaN", uncovered);
    }

    let dev = candle_core::Device::Cpu;
    let nvol = volume_errors.len();
    let tvol = model.config().tvol;
    let flat = volume_errors.into_iter().flatten().collect::<Vec<_>>();

    let outfile = args.out.to_string() + ".recon_errors.npy";
    Tensor::from_vec(flat, (nvol, tvol), &dev)?.write_npy(&outfile)?;
    info!("Wrote {}", outfile);

    let outfile = args.out.to_string() + ".frame_errors.npy";
    let nframes = per_frame.len();
    Tensor::from_vec(per_frame, nframes, &dev)?.write_npy(&outfile)?;
    info!("Wrote {}", outfile);

    let outfile = args.out.to_string() + ".regularity.npy";
    Tensor::from_vec(regularity, nframes, &dev)?.write_npy(&outfile)?;
    info!("Wrote {}", outfile);

    Ok(())
}

pub fn reconstruct_volumes(args: &ReconstructArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let model = load_model(&args.model, args.minibatch_size, &args.device, args.device_no)?;
    let data = read_volume_data(&args.data_file, model.config(), args.stride)?;

    let n = data.num_volumes();
    let mut chunks = vec![];
    for lb in (0..n).step_by(model.batch_size()) {
        let x = data.range_data(lb, lb + model.batch_size(), model.device())?;
        chunks.push(model.batch_reconstruct(&x)?.to_device(&candle_core::Device::Cpu)?);
    }
    let recon = Tensor::cat(&chunks, 0)?;
    recon.write_npy(&*args.out)?;
    info!("Wrote {:?} to {}", recon.dims(), args.out);
    Ok(())
}
