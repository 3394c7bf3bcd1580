use crate::candle_batch_norm::BatchStatUpdate;
use crate::candle_checkpoint::{config_file, restore_checkpoint, save_checkpoint};
use crate::candle_data_loader::{DataLoader, VolumeData};
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::*;
use crate::candle_model_config::StaeConfig;
use crate::candle_model_traits::*;
use crate::candle_optimizer::{Adam, AdamConfig};
use crate::candle_param_store::ParamStore;
use crate::candle_spatial_decoder::SpatialDecoder;
use crate::candle_spatial_encoder::SpatialEncoder;
use crate::candle_temporal_stack::ConvLstmStack;

use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{debug, info};
use std::path::Path;

/// Everything one forward pass produces
pub struct ForwardOutput {
    /// (batch x T x H x W x C)
    pub recon: Tensor,
    /// (batch x T)
    pub per_frame_errors: Tensor,
    /// running-statistic updates, empty in inference mode
    pub stat_updates: Vec<BatchStatUpdate>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossValues {
    pub reconstruction: f32,
    pub regularization: f32,
    pub total: f32,
}

struct LossTensors {
    reconstruction: Tensor,
    regularization: Tensor,
    total: Tensor,
}

/// Spatio-temporal autoencoder with its parameters and optimizer.
///
/// volume -> spatial encoder (per frame) -> conv LSTM stack (over time)
/// -> spatial decoder (per frame) -> reconstruction
///
/// The experiment is the only owner of the parameter values; calls
/// are synchronous and must not overlap.
pub struct Experiment {
    config: StaeConfig,
    batch_size: usize,
    lambd: f64,
    device: Device,
    params: ParamStore,
    encoder: SpatialEncoder,
    temporal: ConvLstmStack,
    decoder: SpatialDecoder,
    optimizer: Adam,
}

impl Experiment {
    /// The fixed 227 x 227 architecture on CPU
    ///
    /// * `tvol` - frames per volume
    /// * `learning_rate` - Adam step size
    /// * `batch_size` - volumes per minibatch
    /// * `lambd` - weight of the L2 penalty
    pub fn new(tvol: usize, learning_rate: f32, batch_size: usize, lambd: f32) -> anyhow::Result<Self> {
        Self::with_config(
            StaeConfig::new(tvol),
            &TrainConfig::new(learning_rate, batch_size, lambd),
        )
    }

    pub fn with_config(config: StaeConfig, train_config: &TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;
        if train_config.batch_size == 0 {
            anyhow::bail!("batch size must be positive");
        }

        let device = train_config.device.clone();
        let params = ParamStore::new(DType::F32, &device);
        let root = params.root();

        let encoder = SpatialEncoder::new(&config, root.clone())?;
        let temporal = ConvLstmStack::from_config(&config, root.clone())?;
        let decoder = SpatialDecoder::new(&config, root)?;

        let optimizer = Adam::new(
            params.trainable()?,
            AdamConfig {
                learning_rate: train_config.learning_rate.into(),
                ..Default::default()
            },
        )?;

        info!(
            "built {}-frame autoencoder for {}x{}x{}: {:?} -> {:?} -> {:?}, {} parameters",
            config.tvol,
            config.height,
            config.width,
            config.channels,
            encoder.dim_obs(),
            encoder.dim_latent(),
            decoder.dim_obs(),
            params.num_elements()?
        );

        Ok(Self {
            config,
            batch_size: train_config.batch_size,
            lambd: train_config.lambd.into(),
            device,
            params,
            encoder,
            temporal,
            decoder,
            optimizer,
        })
    }

    /// Rebuild the model described by `{dir}/config.json` and load its
    /// checkpoint
    pub fn from_checkpoint(dir: &Path, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let config = StaeConfig::from_json(&config_file(dir))?;
        let mut ret = Self::with_config(config, train_config)?;
        ret.restore_model(dir)?;
        Ok(ret)
    }

    pub fn config(&self) -> &StaeConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Check the (T, H, W, C) part of the shape and move `x` to the
    /// model's device as `f32`
    fn prepare(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        let expected = [
            self.config.tvol,
            self.config.height,
            self.config.width,
            self.config.channels,
        ];
        match x.dims() {
            [b, rest @ ..] if *b > 0 && rest == &expected[..] => {}
            dims => anyhow::bail!(
                "expected (batch, {}, {}, {}, {}) volumes, got {:?}",
                expected[0],
                expected[1],
                expected[2],
                expected[3],
                dims
            ),
        }
        Ok(x.to_dtype(DType::F32)?.to_device(&self.device)?)
    }

    /// Run the whole pipeline on `x_bthwc`
    ///
    /// * `train` - batch statistics (and their updates) vs. running statistics
    pub fn forward_t(&self, x_bthwc: &Tensor, train: bool) -> anyhow::Result<ForwardOutput> {
        let x = self.prepare(x_bthwc)?;
        let (b, t, h, w, c) = x.dims5()?;

        // fold time into the batch axis
        let x_nchw = x
            .reshape((b * t, h, w, c))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let (z_nchw, stat_updates) = self.encoder.forward_t(&x_nchw, train)?;
        let (zc, zh, zw) = self.encoder.dim_latent();

        let z_btchw = z_nchw.reshape((b, t, zc, zh, zw))?;
        let ctx_btchw = self.temporal.forward_sequence(&z_btchw)?;
        let ctx_nchw = ctx_btchw.reshape((b * t, self.temporal.dim_output(), zh, zw))?;

        let y_nchw = self.decoder.forward(&ctx_nchw)?;
        let recon = y_nchw.permute((0, 2, 3, 1))?.reshape((b, t, h, w, c))?;
        let per_frame_errors = per_frame_squared_error(&x, &recon)?;

        Ok(ForwardOutput {
            recon,
            per_frame_errors,
            stat_updates,
        })
    }

    fn loss_tensors(&self, per_frame_errors: &Tensor) -> anyhow::Result<LossTensors> {
        let reconstruction = reconstruction_loss(per_frame_errors)?;
        let regularization = l2_penalty(&self.params.regularizable()?, &self.device)?;
        let total = reconstruction.add(&regularization.affine(self.lambd, 0.)?)?;
        Ok(LossTensors {
            reconstruction,
            regularization,
            total,
        })
    }

    /// Combined loss; nothing is updated
    pub fn get_loss(&self, x: &Tensor, is_training: bool) -> anyhow::Result<f32> {
        Ok(self.get_loss_terms(x, is_training)?.total)
    }

    /// Reconstruction, regularization and combined loss; nothing is updated
    pub fn get_loss_terms(&self, x: &Tensor, is_training: bool) -> anyhow::Result<LossValues> {
        let fwd = self.forward_t(x, is_training)?;
        let loss = self.loss_tensors(&fwd.per_frame_errors)?;
        Ok(LossValues {
            reconstruction: loss.reconstruction.to_scalar::<f32>()?,
            regularization: loss.regularization.to_scalar::<f32>()?,
            total: loss.total.to_scalar::<f32>()?,
        })
    }

    /// One Adam update. In training mode the batch-norm running
    /// statistics are moved after the parameters.
    pub fn step(&mut self, x: &Tensor, is_training: bool) -> anyhow::Result<()> {
        let fwd = self.forward_t(x, is_training)?;
        let loss = self.loss_tensors(&fwd.per_frame_errors)?;
        self.optimizer.backward_step(&loss.total)?;
        for update in fwd.stat_updates.iter() {
            update.apply()?;
        }
        Ok(())
    }

    /// Per-frame squared reconstruction errors (batch x T); nothing is updated
    pub fn get_recon_errors(&self, x: &Tensor, is_training: bool) -> anyhow::Result<Tensor> {
        Ok(self.forward_t(x, is_training)?.per_frame_errors)
    }

    /// A training step followed by an inference-mode loss evaluation
    pub fn batch_train(&mut self, x: &Tensor) -> anyhow::Result<f32> {
        self.step(x, true)?;
        self.get_loss(x, false)
    }

    /// Inference-mode reconstruction with the shape of `x`
    pub fn batch_reconstruct(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.forward_t(x, false)?.recon)
    }

    pub fn save_model(&self, path: &Path) -> anyhow::Result<()> {
        save_checkpoint(path, &self.params, &self.optimizer, &self.config)?;
        Ok(())
    }

    pub fn restore_model(&mut self, path: &Path) -> anyhow::Result<()> {
        restore_checkpoint(path, &self.params, &mut self.optimizer, &self.config)
    }

    /// Train over shuffled minibatches for `train_config.num_epochs`
    ///
    /// * `data` - data loader handing out `(B, T, H, W, C)` volumes
    /// * `on_epoch` - called with (epoch, mean loss, model) after each epoch
    ///
    /// # Returns the mean post-update loss of each epoch
    pub fn train_volumes<DataL, EpochFn>(
        &mut self,
        data: &mut DataL,
        train_config: &TrainConfig,
        mut on_epoch: EpochFn,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader,
        EpochFn: FnMut(usize, f32, &Self) -> anyhow::Result<()>,
    {
        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut loss_trace = vec![];

        for epoch in 0..train_config.num_epochs {
            data.shuffle_minibatch(self.batch_size)?;
            let num_minibatches = data.num_minibatch();
            if num_minibatches == 0 {
                anyhow::bail!("no minibatches to train on");
            }

            let mut loss_tot = 0f32;
            for b in 0..num_minibatches {
                let x = data.minibatch_data(b, &self.device)?;
                let loss = self.batch_train(&x)?;
                debug!("[{}] minibatch {} loss: {}", epoch + 1, b, loss);
                loss_tot += loss;
            }
            let loss_avg = loss_tot / num_minibatches as f32;
            loss_trace.push(loss_avg);
            pb.inc(1);

            if train_config.verbose {
                info!("[{}] loss: {}", epoch + 1, loss_avg);
            }
            on_epoch(epoch, loss_avg, self)?;
        }

        pb.finish_and_clear();
        Ok(loss_trace)
    }

    /// Inference-mode per-frame errors for every volume, in order
    pub fn score_volumes(&self, data: &VolumeData) -> anyhow::Result<Vec<Vec<f32>>> {
        let n = data.num_volumes();
        let mut ret = Vec::with_capacity(n);
        for lb in (0..n).step_by(self.batch_size) {
            let x = data.range_data(lb, lb + self.batch_size, &self.device)?;
            let errs = self.get_recon_errors(&x, false)?;
            ret.extend(errs.to_vec2::<f32>()?);
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_experiment() -> anyhow::Result<Experiment> {
        let config = StaeConfig::new(2).with_frame_size(45, 45);
        Experiment::with_config(config, &TrainConfig::new(1e-3, 2, 1e-4))
    }

    #[test]
    fn test_rejects_wrong_shapes() -> anyhow::Result<()> {
        let exp = small_experiment()?;
        let dev = Device::Cpu;
        for shape in [
            vec![1, 3, 45, 45, 1],
            vec![1, 2, 44, 45, 1],
            vec![1, 2, 45, 45, 3],
            vec![2, 45, 45, 1],
            vec![0, 2, 45, 45, 1],
        ] {
            let x = Tensor::zeros(shape.as_slice(), DType::F32, &dev)?;
            assert!(exp.get_loss(&x, false).is_err(), "{:?}", shape);
        }
        Ok(())
    }

    #[test]
    fn test_parameters_are_registered() -> anyhow::Result<()> {
        let exp = small_experiment()?;
        // 4 encoder kernels, 3 recurrent kernels, 1 decoder kernel
        assert_eq!(exp.params().regularizable()?.len(), 8);
        // kernels + biases + bn scale/shift
        assert_eq!(exp.optimizer().num_params(), 8 + 8 + 4 * 2);
        Ok(())
    }

    #[test]
    fn test_zero_batch_size_fails() {
        let config = StaeConfig::new(2).with_frame_size(45, 45);
        assert!(Experiment::with_config(config, &TrainConfig::new(1e-3, 0, 0.)).is_err());
    }
}
