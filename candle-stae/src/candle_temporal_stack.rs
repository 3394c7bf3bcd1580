use crate::candle_conv_lstm::{ConvLstmCell, ConvLstmState};
use crate::candle_model_config::StaeConfig;
use crate::candle_model_traits::TemporalModuleT;
use crate::candle_param_store::ParamBuilder;
use candle_core::{Result, Tensor};

/// Stacked convolutional LSTM unrolled over time.
///
/// Layer `i`'s hidden state is layer `i+1`'s input at every step, and
/// the top hidden state is the output of that step. State starts at
/// zero for every sequence and is dropped afterwards.
pub struct ConvLstmStack {
    cells: Vec<ConvLstmCell>,
}

impl ConvLstmStack {
    /// Will create `clstm.{i}.weight` and `clstm.{i}.bias` for each
    /// layer `i`
    ///
    /// * `in_channels` - depth of the incoming feature maps
    /// * `filters` - depth of each recurrent layer, bottom first
    /// * `kernel` - filter size shared by all layers
    pub fn new(in_channels: usize, filters: &[usize], kernel: usize, pb: ParamBuilder) -> Result<Self> {
        if filters.is_empty() {
            candle_core::bail!("empty conv lstm stack");
        }
        let mut cells = Vec::with_capacity(filters.len());
        let mut prev_dim = in_channels;
        for (i, &num_filters) in filters.iter().enumerate() {
            cells.push(ConvLstmCell::new(
                i,
                prev_dim,
                num_filters,
                kernel,
                pb.pp(format!("clstm.{}", i)),
            )?);
            prev_dim = num_filters;
        }
        Ok(Self { cells })
    }

    pub fn from_config(config: &StaeConfig, pb: ParamBuilder) -> Result<Self> {
        Self::new(
            config.encoder_channels(),
            &config.lstm_filters,
            config.lstm_kernel,
            pb,
        )
    }

    pub fn cells(&self) -> &[ConvLstmCell] {
        &self.cells
    }

    pub fn zero_states(&self, x_nchw: &Tensor) -> Result<Vec<ConvLstmState>> {
        let (n, _, h, w) = x_nchw.dims4()?;
        self.cells
            .iter()
            .map(|cell| cell.zero_state(n, (h, w), x_nchw.dtype(), x_nchw.device()))
            .collect()
    }

    /// Push one time step through all layers
    ///
    /// # Returns `(top_hidden, next_states)`
    pub fn step(
        &self,
        x_nchw: &Tensor,
        states: &[ConvLstmState],
    ) -> Result<(Tensor, Vec<ConvLstmState>)> {
        if states.len() != self.cells.len() {
            candle_core::bail!(
                "{} states for {} layers",
                states.len(),
                self.cells.len()
            );
        }
        let mut x = x_nchw.clone();
        let mut next = Vec::with_capacity(states.len());
        for (cell, state) in self.cells.iter().zip(states.iter()) {
            let s = cell.step(&x, state)?;
            x = s.hidden.clone();
            next.push(s);
        }
        Ok((x, next))
    }

    /// Unroll over a sequence of feature maps from a zero state
    pub fn unroll(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let Some(first) = inputs.first() else {
            return Ok(vec![]);
        };
        let mut states = self.zero_states(first)?;
        let mut outputs = Vec::with_capacity(inputs.len());
        for x in inputs {
            let (h, next) = self.step(x, &states)?;
            outputs.push(h);
            states = next;
        }
        Ok(outputs)
    }
}

impl TemporalModuleT for ConvLstmStack {
    fn forward_sequence(&self, x_btchw: &Tensor) -> Result<Tensor> {
        let (_, t, _, _, _) = x_btchw.dims5()?;
        let inputs = (0..t)
            .map(|s| x_btchw.narrow(1, s, 1)?.squeeze(1))
            .collect::<Result<Vec<_>>>()?;
        let outputs = self.unroll(&inputs)?;
        Tensor::stack(&outputs, 1)
    }

    fn dim_input(&self) -> usize {
        self.cells.first().map(|c| c.in_channels()).unwrap_or(0)
    }

    fn dim_output(&self) -> usize {
        self.cells.last().map(|c| c.num_filters()).unwrap_or(0)
    }
}
