use crate::candle_param_store::{ParamBuilder, ParamRole};
use candle_core::{Result, Tensor, Var};
use candle_nn::Init;

/// A pending moving-average update of batch-norm running statistics.
///
/// Produced by a training-mode forward pass. Nothing changes until
/// `apply` is called, so loss evaluations can discard it.
#[derive(Clone, Debug)]
pub struct BatchStatUpdate {
    running_mean: Var,
    running_var: Var,
    batch_mean: Tensor,
    batch_var: Tensor,
    decay: f64,
}

impl BatchStatUpdate {
    /// running <- decay * running + (1 - decay) * batch
    pub fn apply(&self) -> Result<()> {
        let keep = self.decay;
        let take = 1.0 - self.decay;

        let mean = self
            .running_mean
            .as_tensor()
            .affine(keep, 0.)?
            .add(&self.batch_mean.affine(take, 0.)?)?;
        let var = self
            .running_var
            .as_tensor()
            .affine(keep, 0.)?
            .add(&self.batch_var.affine(take, 0.)?)?;

        self.running_mean.set(&mean.detach())?;
        self.running_var.set(&var.detach())
    }

    pub fn batch_mean(&self) -> &Tensor {
        &self.batch_mean
    }

    pub fn batch_var(&self) -> &Tensor {
        &self.batch_var
    }
}

/// Per-channel batch normalization of `N x C x H x W` feature maps
/// with a learnable scale and shift
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    num_features: usize,
    eps: f64,
    decay: f64,
    scale: Tensor,
    shift: Tensor,
    running_mean: Var,
    running_var: Var,
}

/// Will create these variables under `pb`:
///
/// * `scale`, `shift` (trainable)
/// * `running_mean`, `running_var` (moving averages)
pub fn batch_norm2d(
    num_features: usize,
    eps: f64,
    decay: f64,
    pb: ParamBuilder,
) -> Result<BatchNorm2d> {
    let scale = pb.get(num_features, "scale", Init::Const(1.), ParamRole::Scale)?;
    let shift = pb.get(num_features, "shift", Init::Const(0.), ParamRole::Shift)?;
    let running_mean = pb.get_var(
        num_features,
        "running_mean",
        Init::Const(0.),
        ParamRole::RunningStat,
    )?;
    let running_var = pb.get_var(
        num_features,
        "running_var",
        Init::Const(1.),
        ParamRole::RunningStat,
    )?;

    Ok(BatchNorm2d {
        num_features,
        eps,
        decay,
        scale,
        shift,
        running_mean,
        running_var,
    })
}

impl BatchNorm2d {
    /// Normalize `x_nchw`
    ///
    /// * `train` - use the batch statistics and hand back their
    ///   running-average update; otherwise use the running statistics
    pub fn forward_t(
        &self,
        x_nchw: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<BatchStatUpdate>)> {
        let (_, c, _, _) = x_nchw.dims4()?;
        if c != self.num_features {
            candle_core::bail!(
                "batch norm expects {} channels, got {}",
                self.num_features,
                c
            );
        }

        let (mean_c, var_c, update) = if train {
            let x_cm = x_nchw.transpose(0, 1)?.flatten_from(1)?;
            let mean_c = x_cm.mean(1)?;
            // biased variance, same as the normalizer
            let var_c = x_cm
                .broadcast_sub(&mean_c.unsqueeze(1)?)?
                .sqr()?
                .mean(1)?;
            let update = BatchStatUpdate {
                running_mean: self.running_mean.clone(),
                running_var: self.running_var.clone(),
                batch_mean: mean_c.detach(),
                batch_var: var_c.detach(),
                decay: self.decay,
            };
            (mean_c, var_c, Some(update))
        } else {
            (
                self.running_mean.as_tensor().detach(),
                self.running_var.as_tensor().detach(),
                None,
            )
        };

        let shape = (1, c, 1, 1);
        let inv_std = var_c.affine(1., self.eps)?.sqrt()?.recip()?;

        let y = x_nchw
            .broadcast_sub(&mean_c.reshape(shape)?)?
            .broadcast_mul(&inv_std.reshape(shape)?)?
            .broadcast_mul(&self.scale.reshape(shape)?)?
            .broadcast_add(&self.shift.reshape(shape)?)?;

        Ok((y, update))
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_param_store::ParamStore;
    use candle_core::{DType, Device};

    fn make_bn(c: usize, decay: f64) -> Result<BatchNorm2d> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        batch_norm2d(c, 1e-3, decay, store.root().pp("bn"))
    }

    #[test]
    fn test_train_mode_normalizes_each_channel() -> Result<()> {
        let bn = make_bn(3, 0.999)?;
        let x = Tensor::randn(2f32, 3f32, (4, 3, 5, 5), &Device::Cpu)?;
        let (y, update) = bn.forward_t(&x, true)?;
        assert!(update.is_some());

        let y_cm = y.transpose(0, 1)?.flatten_from(1)?;
        let mean = y_cm.mean(1)?.to_vec1::<f32>()?;
        let var = y_cm.sqr()?.mean(1)?.to_vec1::<f32>()?;
        for (m, v) in mean.iter().zip(var.iter()) {
            assert!(m.abs() < 1e-4, "mean {}", m);
            assert!((v - 1.0).abs() < 1e-2, "var {}", v);
        }
        Ok(())
    }

    #[test]
    fn test_update_is_explicit() -> Result<()> {
        let bn = make_bn(2, 0.9)?;
        let x = Tensor::ones((2, 2, 3, 3), DType::F32, &Device::Cpu)?.affine(5., 0.)?;

        let (_, update) = bn.forward_t(&x, true)?;
        // forward alone leaves the running statistics alone
        assert_eq!(bn.running_mean().to_vec1::<f32>()?, vec![0., 0.]);

        update.expect("training mode update").apply()?;
        let mean = bn.running_mean().to_vec1::<f32>()?;
        let var = bn.running_var().to_vec1::<f32>()?;
        for (m, v) in mean.iter().zip(var.iter()) {
            assert!((m - 0.5).abs() < 1e-5);
            assert!((v - 0.9).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_inference_mode_uses_running_stats() -> Result<()> {
        let bn = make_bn(1, 0.999)?;
        let x = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu)?.reshape((1, 1, 2, 2))?;
        let (y, update) = bn.forward_t(&x, false)?;
        assert!(update.is_none());

        // running mean 0, var 1
        let scale = 1. / (1.0f32 + 1e-3).sqrt();
        let y = y.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in y.iter().zip([1f32, 2., 3., 4.].iter()) {
            assert!((a - b * scale).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_channel_mismatch_fails() -> Result<()> {
        let bn = make_bn(4, 0.999)?;
        let x = Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(bn.forward_t(&x, true).is_err());
        Ok(())
    }
}
