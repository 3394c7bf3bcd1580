use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Error, Result, Tensor, Var};
use std::collections::HashMap;

pub const ADAM_STEP_KEY: &str = "adam.step";

/// Adam hyperparameters
#[derive(Clone, Copy, Debug)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-6,
        }
    }
}

struct AdamSlot {
    name: String,
    param: Var,
    m: Var,
    v: Var,
}

/// Adam whose moment buffers are keyed by parameter name, so they can
/// be written to and read back from a checkpoint.
///
/// lr_t = lr * sqrt(1 - β2^t) / (1 - β1^t)
/// θ <- θ - lr_t * m / (sqrt(v) + ε)
pub struct Adam {
    slots: Vec<AdamSlot>,
    config: AdamConfig,
    step_t: u32,
}

impl Adam {
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let slots = params
            .into_iter()
            .map(|(name, param)| {
                let t = param.as_tensor();
                let m = Var::zeros(t.shape(), t.dtype(), t.device())?;
                let v = Var::zeros(t.shape(), t.dtype(), t.device())?;
                Ok(AdamSlot { name, param, m, v })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slots,
            config,
            step_t: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn num_steps(&self) -> u32 {
        self.step_t
    }

    pub fn num_params(&self) -> usize {
        self.slots.len()
    }

    /// Apply one update from `grads`; parameters without a gradient are
    /// left untouched
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let AdamConfig {
            learning_rate,
            beta_1,
            beta_2,
            epsilon,
        } = self.config;
        let t = self.step_t as i32;
        let lr_t = learning_rate * (1. - beta_2.powi(t)).sqrt() / (1. - beta_1.powi(t));

        for slot in self.slots.iter() {
            let theta = slot.param.as_tensor();
            if let Some(g) = grads.get(theta) {
                let m = slot
                    .m
                    .as_tensor()
                    .affine(beta_1, 0.)?
                    .add(&g.affine(1. - beta_1, 0.)?)?;
                let v = slot
                    .v
                    .as_tensor()
                    .affine(beta_2, 0.)?
                    .add(&g.sqr()?.affine(1. - beta_2, 0.)?)?;
                let delta = m.div(&v.sqrt()?.affine(1., epsilon)?)?.affine(lr_t, 0.)?;
                slot.param.set(&theta.sub(&delta)?.detach())?;
                slot.m.set(&m.detach())?;
                slot.v.set(&v.detach())?;
            }
        }
        Ok(())
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// `adam.m.{name}`, `adam.v.{name}` and the step counter
    pub fn state_tensors(&self, device: &Device) -> Result<Vec<(String, Tensor)>> {
        let mut ret = Vec::with_capacity(2 * self.slots.len() + 1);
        for slot in self.slots.iter() {
            ret.push((format!("adam.m.{}", slot.name), slot.m.as_tensor().clone()));
            ret.push((format!("adam.v.{}", slot.name), slot.v.as_tensor().clone()));
        }
        ret.push((
            ADAM_STEP_KEY.to_string(),
            Tensor::new(&[self.step_t], device)?,
        ));
        Ok(ret)
    }

    /// Check that `tensors` carries a complete state for this optimizer
    pub fn check_state(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for slot in self.slots.iter() {
            for key in [format!("adam.m.{}", slot.name), format!("adam.v.{}", slot.name)] {
                let t = tensors
                    .get(&key)
                    .ok_or_else(|| Error::Msg(format!("missing optimizer state {}", key)))?;
                if t.dims() != slot.param.as_tensor().dims() {
                    candle_core::bail!(
                        "optimizer state {} has shape {:?}, expected {:?}",
                        key,
                        t.dims(),
                        slot.param.as_tensor().dims()
                    );
                }
            }
        }
        if !tensors.contains_key(ADAM_STEP_KEY) {
            candle_core::bail!("missing optimizer state {}", ADAM_STEP_KEY);
        }
        Ok(())
    }

    /// Overwrite moments and step counter; call `check_state` first to
    /// avoid a half-loaded state
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.check_state(tensors)?;
        for slot in self.slots.iter() {
            let dtype = slot.param.as_tensor().dtype();
            let device = slot.param.as_tensor().device();
            for (key, var) in [
                (format!("adam.m.{}", slot.name), &slot.m),
                (format!("adam.v.{}", slot.name), &slot.v),
            ] {
                if let Some(t) = tensors.get(&key) {
                    var.set(&t.to_dtype(dtype)?.to_device(device)?)?;
                }
            }
        }
        if let Some(step) = tensors.get(ADAM_STEP_KEY) {
            self.step_t = step
                .to_dtype(DType::U32)?
                .flatten_all()?
                .to_vec1::<u32>()?
                .first()
                .copied()
                .unwrap_or(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_first_step_moves_by_learning_rate() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, -2.], &dev)?;
        let config = AdamConfig {
            learning_rate: 0.1,
            ..Default::default()
        };
        let mut adam = Adam::new(vec![("w".to_string(), w.clone())], config)?;

        // d/dw sum(w^2) = 2w; the first bias-corrected step is ~lr * sign(g)
        let loss = w.as_tensor().sqr()?.sum_all()?;
        adam.backward_step(&loss)?;

        let v = w.as_tensor().to_vec1::<f32>()?;
        assert!((v[0] - 0.9).abs() < 1e-4, "{:?}", v);
        assert!((v[1] + 1.9).abs() < 1e-4, "{:?}", v);
        assert_eq!(adam.num_steps(), 1);
        Ok(())
    }

    #[test]
    fn test_minimizes_quadratic() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[3f32, -4., 0.5], &dev)?;
        let config = AdamConfig {
            learning_rate: 0.05,
            ..Default::default()
        };
        let mut adam = Adam::new(vec![("w".to_string(), w.clone())], config)?;
        for _ in 0..500 {
            let loss = w.as_tensor().sqr()?.sum_all()?;
            adam.backward_step(&loss)?;
        }
        let norm = w.as_tensor().sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!(norm < 5e-2, "norm {}", norm);
        Ok(())
    }

    #[test]
    fn test_state_round_trip() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, 2., 3.], &dev)?;
        let mut adam = Adam::new(vec![("w".to_string(), w.clone())], AdamConfig::default())?;
        for _ in 0..3 {
            adam.backward_step(&w.as_tensor().sqr()?.sum_all()?)?;
        }
        let state: HashMap<String, Tensor> = adam.state_tensors(&dev)?.into_iter().collect();
        assert_eq!(state.len(), 3);
        assert_eq!(state[ADAM_STEP_KEY].dtype(), DType::U32);

        let w2 = Var::new(&[0f32, 0., 0.], &dev)?;
        let mut other = Adam::new(vec![("w".to_string(), w2)], AdamConfig::default())?;
        other.load_state(&state)?;
        assert_eq!(other.num_steps(), 3);

        let m1 = state["adam.m.w"].to_vec1::<f32>()?;
        let reloaded: HashMap<String, Tensor> = other.state_tensors(&dev)?.into_iter().collect();
        assert_eq!(reloaded["adam.m.w"].to_vec1::<f32>()?, m1);
        Ok(())
    }

    #[test]
    fn test_incomplete_state_is_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32], &dev)?;
        let mut adam = Adam::new(vec![("w".to_string(), w)], AdamConfig::default())?;
        let mut state = HashMap::new();
        state.insert("adam.m.w".to_string(), Tensor::new(&[0f32], &dev)?);
        assert!(adam.load_state(&state).is_err());
        assert_eq!(adam.num_steps(), 0);
        Ok(())
    }
}
