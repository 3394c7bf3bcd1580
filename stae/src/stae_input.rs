use crate::common::*;
use clap::ValueEnum;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

pub fn make_device(device: &ComputeDevice, device_no: usize) -> anyhow::Result<candle_core::Device> {
    Ok(match device {
        ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
        _ => candle_core::Device::Cpu,
    })
}

pub fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

/// Read volumes for a model configured by `config`
///
/// * `data_file` - `.npy` frames (F, H, W[, 1]) or volumes (N, T, H, W, 1)
/// * `stride` - offset between sliding windows over frames
pub fn read_volume_data(
    data_file: &str,
    config: &StaeConfig,
    stride: usize,
) -> anyhow::Result<VolumeData> {
    let data = VolumeData::from_npy(Path::new(data_file), config.tvol, stride)?;
    let expected = [config.height, config.width, config.channels];
    if data.tvol() != config.tvol || data.frame_dims() != expected {
        anyhow::bail!(
            "{}: volumes of {} x {:?} do not fit the model's {} x {:?}",
            data_file,
            data.tvol(),
            data.frame_dims(),
            config.tvol,
            expected
        );
    }
    info!(
        "Read {} volumes of {} frames (stride {}) from {}",
        data.num_volumes(),
        data.tvol(),
        data.stride(),
        data_file
    );
    Ok(data)
}
