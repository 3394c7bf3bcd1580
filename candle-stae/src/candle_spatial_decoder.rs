use crate::candle_aux_layers::{conv2d_bias, Conv2dBias};
use crate::candle_model_config::StaeConfig;
use crate::candle_model_traits::SpatialDecoderT;
use crate::candle_param_store::ParamBuilder;
use candle_core::{Device, Result, Tensor};
use candle_nn::Module;

const DECODER_BIAS_INIT: f64 = 0.01;

/// Source index of each output position for nearest-neighbour resizing
/// (no corner alignment): `min(floor(i * n_in / n_out), n_in - 1)`
pub fn nearest_indices(n_in: usize, n_out: usize) -> Vec<u32> {
    (0..n_out)
        .map(|i| ((i * n_in) / n_out).min(n_in.saturating_sub(1)) as u32)
        .collect()
}

/// Nearest-neighbour upsampling followed by a same-padded convolution.
/// Terminal layer: no normalization, no activation.
///
/// Resizing gathers rows and columns with `index_select`, which keeps
/// the whole path differentiable for non-integer scale factors.
pub struct SpatialDecoder {
    in_channels: usize,
    in_extent: (usize, usize),
    out_extent: (usize, usize),
    row_index: Tensor,
    col_index: Tensor,
    conv: Conv2dBias,
}

impl SpatialDecoder {
    /// Will create `dec.deconv.0.weight` and `dec.deconv.0.bias`
    pub fn new(config: &StaeConfig, pb: ParamBuilder) -> Result<Self> {
        let in_extent = config.encoder_extent()?;
        let out_extent = (config.height, config.width);
        let in_channels = config.temporal_channels();
        let device: &Device = pb.device();

        let rows = nearest_indices(in_extent.0, out_extent.0);
        let cols = nearest_indices(in_extent.1, out_extent.1);
        let row_index = Tensor::from_vec(rows, out_extent.0, device)?;
        let col_index = Tensor::from_vec(cols, out_extent.1, device)?;

        let conv = conv2d_bias(
            in_channels,
            config.channels,
            config.decoder_kernel,
            1,
            config.decoder_kernel / 2,
            DECODER_BIAS_INIT,
            pb.pp("dec.deconv.0"),
        )?;

        Ok(Self {
            in_channels,
            in_extent,
            out_extent,
            row_index,
            col_index,
            conv,
        })
    }

    pub fn upsample(&self, h_nchw: &Tensor) -> Result<Tensor> {
        h_nchw
            .index_select(&self.row_index, 2)?
            .index_select(&self.col_index, 3)
    }
}

impl SpatialDecoderT for SpatialDecoder {
    fn forward(&self, h_nchw: &Tensor) -> Result<Tensor> {
        let (_, c, h, w) = h_nchw.dims4()?;
        if (c, h, w) != self.dim_latent() {
            candle_core::bail!(
                "decoder expects {:?} maps, got {:?}",
                self.dim_latent(),
                (c, h, w)
            );
        }
        self.conv.forward(&self.upsample(h_nchw)?)
    }

    fn dim_obs(&self) -> (usize, usize, usize) {
        (self.conv.out_channels(), self.out_extent.0, self.out_extent.1)
    }

    fn dim_latent(&self) -> (usize, usize, usize) {
        (self.in_channels, self.in_extent.0, self.in_extent.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_param_store::ParamStore;
    use candle_core::{DType, Var};

    #[test]
    fn test_nearest_indices() {
        assert_eq!(nearest_indices(2, 4), vec![0, 0, 1, 1]);
        assert_eq!(nearest_indices(4, 9), vec![0, 0, 0, 1, 1, 2, 2, 3, 3]);
        let idx = nearest_indices(50, 227);
        assert_eq!(idx.len(), 227);
        assert_eq!(*idx.last().unwrap(), 49);
    }

    #[test]
    fn test_upsample_repeats_values() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let config = StaeConfig::new(2).with_frame_size(45, 45);
        let dec = SpatialDecoder::new(&config, store.root())?;

        let h = Tensor::arange(0f32, 16., &Device::Cpu)?
            .reshape((1, 1, 4, 4))?
            .repeat((1, 32, 1, 1))?;
        let up = dec.upsample(&h)?;
        assert_eq!(up.dims(), &[1, 32, 45, 45]);

        let corner = up.get(0)?.get(0)?.get(44)?.get(44)?.to_scalar::<f32>()?;
        assert_eq!(corner, 15.);
        let origin = up.get(0)?.get(0)?.get(0)?.get(0)?.to_scalar::<f32>()?;
        assert_eq!(origin, 0.);
        Ok(())
    }

    #[test]
    fn test_decoder_output_and_gradient() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let config = StaeConfig::new(2).with_frame_size(45, 45);
        let dec = SpatialDecoder::new(&config, store.root())?;
        assert_eq!(dec.dim_obs(), (1, 45, 45));

        let h = Var::randn(0f32, 1f32, (3, 32, 4, 4), &Device::Cpu)?;
        let y = dec.forward(h.as_tensor())?;
        assert_eq!(y.dims(), &[3, 1, 45, 45]);

        // gradients reach the input through a non-integer upscaling
        let grads = y.sqr()?.sum_all()?.backward()?;
        let g = grads.get(h.as_tensor()).expect("input gradient");
        assert_eq!(g.dims(), &[3, 32, 4, 4]);
        Ok(())
    }
}
