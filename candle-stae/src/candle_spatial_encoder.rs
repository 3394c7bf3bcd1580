use crate::candle_aux_layers::*;
use crate::candle_batch_norm::BatchStatUpdate;
use crate::candle_model_config::StaeConfig;
use crate::candle_model_traits::SpatialEncoderT;
use crate::candle_param_store::ParamBuilder;
use candle_core::{Result, Tensor};

const ENCODER_BIAS_INIT: f64 = 0.01;

/// Four valid-padded conv -> batchnorm -> relu stages applied to
/// every frame on its own
pub struct SpatialEncoder {
    in_channels: usize,
    in_extent: (usize, usize),
    out_extent: (usize, usize),
    stages: StackLayers<ConvBnReluStage>,
}

impl SpatialEncoderT for SpatialEncoder {
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<(Tensor, Vec<BatchStatUpdate>)> {
        let (_, c, h, w) = x_nchw.dims4()?;
        if (c, h, w) != self.dim_obs() {
            candle_core::bail!(
                "encoder expects {:?} frames, got {:?}",
                self.dim_obs(),
                (c, h, w)
            );
        }
        self.stages.forward_t(x_nchw, train)
    }

    fn dim_obs(&self) -> (usize, usize, usize) {
        (self.in_channels, self.in_extent.0, self.in_extent.1)
    }

    fn dim_latent(&self) -> (usize, usize, usize) {
        let c = self
            .stages
            .layers()
            .last()
            .map(|s| s.conv().out_channels())
            .unwrap_or(self.in_channels);
        (c, self.out_extent.0, self.out_extent.1)
    }
}

impl SpatialEncoder {
    /// Will create a new spatial encoder with these variables:
    ///
    /// * `enc.conv.{j}.weight`, `enc.conv.{j}.bias`
    /// * `enc.conv.{j}.bn.{scale,shift,running_mean,running_var}`
    ///
    /// where {} is the stage index
    pub fn new(config: &StaeConfig, pb: ParamBuilder) -> Result<Self> {
        let out_extent = config.encoder_extent()?;

        let mut stages = StackLayers::<ConvBnReluStage>::new();
        let mut prev_dim = config.channels;
        for (j, stage) in config.encoder.iter().enumerate() {
            stages.push(conv_bn_relu(
                prev_dim,
                stage.out_channels,
                stage.kernel,
                stage.stride,
                ENCODER_BIAS_INIT,
                config.bn_eps,
                config.bn_decay,
                pb.pp(format!("enc.conv.{}", j)),
            )?);
            prev_dim = stage.out_channels;
        }

        Ok(Self {
            in_channels: config.channels,
            in_extent: (config.height, config.width),
            out_extent,
            stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_param_store::ParamStore;
    use candle_core::{DType, Device};

    #[test]
    fn test_encoder_output_shape() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let config = StaeConfig::new(2).with_frame_size(45, 45);
        let enc = SpatialEncoder::new(&config, store.root())?;
        assert_eq!(enc.dim_latent(), (32, 4, 4));

        let x = Tensor::rand(0f32, 1f32, (6, 1, 45, 45), &Device::Cpu)?;
        let (h, updates) = enc.forward_t(&x, true)?;
        assert_eq!(h.dims(), &[6, 32, 4, 4]);
        assert_eq!(updates.len(), 4);
        assert!(h.min_all()?.to_scalar::<f32>()? >= 0.);
        Ok(())
    }

    #[test]
    fn test_encoder_parameters() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let config = StaeConfig::new(2);
        SpatialEncoder::new(&config, store.root())?;
        // weight, bias, scale, shift, mean, var per stage
        assert_eq!(store.named_params()?.len(), 4 * 6);
        assert_eq!(store.regularizable()?.len(), 4);
        Ok(())
    }

    #[test]
    fn test_encoder_rejects_wrong_frames() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let config = StaeConfig::new(2).with_frame_size(45, 45);
        let enc = SpatialEncoder::new(&config, store.root())?;
        let x = Tensor::zeros((1, 1, 46, 45), DType::F32, &Device::Cpu)?;
        assert!(enc.forward_t(&x, false).is_err());
        Ok(())
    }
}
