use crate::candle_param_store::{xavier_conv2d, ParamBuilder, ParamRole};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{ops, Init};

/// Hidden and cell state of one recurrent layer (n x filters x h x w)
#[derive(Clone, Debug)]
pub struct ConvLstmState {
    pub hidden: Tensor,
    pub cell: Tensor,
}

/// Convolutional LSTM cell.
///
/// The four gates (input, forget, output, candidate) come out of a
/// single same-padded convolution over `[x, h]`, so the kernel has
/// `4 * num_filters` output channels.
#[derive(Clone, Debug)]
pub struct ConvLstmCell {
    layer_id: usize,
    in_channels: usize,
    num_filters: usize,
    kernel: usize,
    weight: Tensor,
    bias: Tensor,
}

impl ConvLstmCell {
    /// Will create `weight` and `bias` under `pb`; callers give each
    /// layer its own prefix so no weights are shared
    ///
    /// * `layer_id` - position of this cell in its stack
    /// * `in_channels` - depth of the input feature map
    /// * `num_filters` - depth of the hidden and cell state
    /// * `kernel` - odd filter size
    pub fn new(
        layer_id: usize,
        in_channels: usize,
        num_filters: usize,
        kernel: usize,
        pb: ParamBuilder,
    ) -> Result<Self> {
        if kernel % 2 == 0 {
            candle_core::bail!("conv lstm kernel must be odd, got {}", kernel);
        }
        let fan_in = in_channels + num_filters;
        let weight = pb.get(
            (4 * num_filters, fan_in, kernel, kernel),
            "weight",
            xavier_conv2d(kernel, fan_in, 4 * num_filters),
            ParamRole::Kernel,
        )?;
        let bias = pb.get(4 * num_filters, "bias", Init::Const(0.), ParamRole::Bias)?;

        Ok(Self {
            layer_id,
            in_channels,
            num_filters,
            kernel,
            weight,
            bias,
        })
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn num_filters(&self) -> usize {
        self.num_filters
    }

    pub fn zero_state(
        &self,
        batch: usize,
        extent: (usize, usize),
        dtype: DType,
        device: &Device,
    ) -> Result<ConvLstmState> {
        let shape = (batch, self.num_filters, extent.0, extent.1);
        Ok(ConvLstmState {
            hidden: Tensor::zeros(shape, dtype, device)?,
            cell: Tensor::zeros(shape, dtype, device)?,
        })
    }

    /// One time step
    ///
    /// c' = σ(f) ⊙ c + σ(i) ⊙ tanh(g)
    /// h' = σ(o) ⊙ tanh(c')
    ///
    /// * `x_nchw` - input feature map
    /// * `state` - previous hidden and cell state, same extent as `x_nchw`
    pub fn step(&self, x_nchw: &Tensor, state: &ConvLstmState) -> Result<ConvLstmState> {
        let (_, c, _, _) = x_nchw.dims4()?;
        if c != self.in_channels {
            candle_core::bail!(
                "conv lstm layer {} expects {} channels, got {}",
                self.layer_id,
                self.in_channels,
                c
            );
        }

        let xh = Tensor::cat(&[x_nchw, &state.hidden], 1)?;
        let gates = xh
            .conv2d(&self.weight, self.kernel / 2, 1, 1, 1)?
            .broadcast_add(&self.bias.reshape((1, 4 * self.num_filters, 1, 1))?)?;

        let gates = gates.chunk(4, 1)?;
        let input_gate = ops::sigmoid(&gates[0])?;
        let forget_gate = ops::sigmoid(&gates[1])?;
        let output_gate = ops::sigmoid(&gates[2])?;
        let candidate = gates[3].tanh()?;

        let cell = forget_gate
            .mul(&state.cell)?
            .add(&input_gate.mul(&candidate)?)?;
        let hidden = output_gate.mul(&cell.tanh()?)?;

        Ok(ConvLstmState { hidden, cell })
    }
}
