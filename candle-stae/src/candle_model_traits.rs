use crate::candle_batch_norm::BatchStatUpdate;
use candle_core::{Result, Tensor};

pub trait SpatialEncoderT {
    /// An encoder applied to every frame independently
    ///
    /// # Arguments
    /// * `x_nchw` - frames with time folded into the batch axis
    /// * `train` - whether to use batch statistics in batchnorm
    ///
    /// # Returns `(h_nchw, stat_updates)`
    /// * `h_nchw` - feature maps (n x c x h x w)
    /// * `stat_updates` - running-statistic updates (empty unless `train`)
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<(Tensor, Vec<BatchStatUpdate>)>;

    fn dim_obs(&self) -> (usize, usize, usize);

    fn dim_latent(&self) -> (usize, usize, usize);
}

pub trait TemporalModuleT {
    /// Consume a sequence of feature maps one time step at a time
    ///
    /// * `x_btchw` - (batch x time x channel x height x width)
    ///
    /// # Returns the top-layer hidden state at every step, stacked
    /// along the time axis
    fn forward_sequence(&self, x_btchw: &Tensor) -> Result<Tensor>;

    fn dim_input(&self) -> usize;

    fn dim_output(&self) -> usize;
}

pub trait SpatialDecoderT {
    /// A decoder that spits out reconstructed frames (n x c x H x W)
    fn forward(&self, h_nchw: &Tensor) -> Result<Tensor>;

    fn dim_obs(&self) -> (usize, usize, usize);

    fn dim_latent(&self) -> (usize, usize, usize);
}
