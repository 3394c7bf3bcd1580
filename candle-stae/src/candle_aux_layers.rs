use crate::candle_batch_norm::{batch_norm2d, BatchNorm2d, BatchStatUpdate};
use crate::candle_param_store::{xavier_conv2d, ParamBuilder, ParamRole};
use candle_core::{Result, Tensor};
use candle_nn::{Init, Module};

/// 2D convolution with one kernel and one bias, NCHW layout
#[derive(Clone, Debug)]
pub struct Conv2dBias {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    weight: Tensor,
    bias: Tensor,
}

impl Conv2dBias {
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// spatial extent after this convolution
    pub fn out_extent(&self, n: usize) -> usize {
        (n + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1
    }
}

/// Will create `weight` (out x in x k x k) and `bias` (out)
///
/// * `padding` - zero padding on each side (0 for valid, `k/2` for same)
/// * `bias_init` - constant initial bias
pub fn conv2d_bias(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    bias_init: f64,
    pb: ParamBuilder,
) -> Result<Conv2dBias> {
    let weight = pb.get(
        (out_channels, in_channels, kernel, kernel),
        "weight",
        xavier_conv2d(kernel, in_channels, out_channels),
        ParamRole::Kernel,
    )?;
    let bias = pb.get(
        out_channels,
        "bias",
        Init::Const(bias_init),
        ParamRole::Bias,
    )?;

    Ok(Conv2dBias {
        in_channels,
        out_channels,
        kernel,
        stride,
        padding,
        weight,
        bias,
    })
}

impl Module for Conv2dBias {
    fn forward(&self, x_nchw: &Tensor) -> Result<Tensor> {
        x_nchw
            .conv2d(&self.weight, self.padding, self.stride, 1, 1)?
            .broadcast_add(&self.bias.reshape((1, self.out_channels, 1, 1))?)
    }
}

/// A stage that may report batch-norm updates
pub trait StageT {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Option<BatchStatUpdate>)>;
}

/// conv -> bias -> batchnorm -> relu
#[derive(Clone, Debug)]
pub struct ConvBnReluStage {
    conv: Conv2dBias,
    bn: BatchNorm2d,
}

impl ConvBnReluStage {
    pub fn conv(&self) -> &Conv2dBias {
        &self.conv
    }
}

/// Will create `{pb}.weight`, `{pb}.bias` and `{pb}.bn.*`
#[allow(clippy::too_many_arguments)]
pub fn conv_bn_relu(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    bias_init: f64,
    bn_eps: f64,
    bn_decay: f64,
    pb: ParamBuilder,
) -> Result<ConvBnReluStage> {
    let conv = conv2d_bias(
        in_channels,
        out_channels,
        kernel,
        stride,
        0,
        bias_init,
        pb.clone(),
    )?;
    let bn = batch_norm2d(out_channels, bn_eps, bn_decay, pb.pp("bn"))?;
    Ok(ConvBnReluStage { conv, bn })
}

impl StageT for ConvBnReluStage {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Option<BatchStatUpdate>)> {
        let h = self.conv.forward(x)?;
        let (h, update) = self.bn.forward_t(&h, train)?;
        Ok((h.relu()?, update))
    }
}

/// build a stack of `M` stages applied in order
pub struct StackLayers<M>
where
    M: StageT,
{
    module_layers: Vec<M>,
}

impl<M> StackLayers<M>
where
    M: StageT,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    pub fn layers(&self) -> &[M] {
        &self.module_layers
    }

    /// Run every layer, collecting whatever statistic updates they emit
    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<(Tensor, Vec<BatchStatUpdate>)> {
        let mut x = input.clone();
        let mut updates = Vec::with_capacity(self.module_layers.len());
        for module in self.module_layers.iter() {
            let (h, update) = module.forward_t(&x, train)?;
            updates.extend(update);
            x = h;
        }
        Ok((x, updates))
    }
}

impl<M> Default for StackLayers<M>
where
    M: StageT,
{
    fn default() -> Self {
        Self::new()
    }
}
