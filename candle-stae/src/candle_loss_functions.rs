use candle_core::{DType, Device, Result, Tensor};

/// Squared reconstruction error of each frame
///
/// err(b,t) = sum_{h,w,c} [ x(b,t,h,w,c) - xhat(b,t,h,w,c) ]^2
///
/// * `x_bthwc` - observed volume
/// * `recon_bthwc` - reconstruction of the same shape
///
pub fn per_frame_squared_error(x_bthwc: &Tensor, recon_bthwc: &Tensor) -> Result<Tensor> {
    x_bthwc.sub(recon_bthwc)?.sqr()?.flatten_from(2)?.sum(2)
}

/// Reconstruction loss: half the mean per-frame error over batch and time
pub fn reconstruction_loss(errors_bt: &Tensor) -> Result<Tensor> {
    errors_bt.mean_all()?.affine(0.5, 0.)
}

/// Sum of `sum(w^2) / 2` over the given weights (zero for none)
pub fn l2_penalty(weights: &[Tensor], device: &Device) -> Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for w in weights {
        total = total.add(&w.sqr()?.sum_all()?.to_dtype(DType::F32)?)?;
    }
    total.affine(0.5, 0.)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_frame_error() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::ones((2, 3, 4, 4, 1), DType::F32, &dev)?;
        let y = Tensor::zeros((2, 3, 4, 4, 1), DType::F32, &dev)?;
        let err = per_frame_squared_error(&x, &y)?;
        assert_eq!(err.dims(), &[2, 3]);
        let v = err.flatten_all()?.to_vec1::<f32>()?;
        assert!(v.iter().all(|&e| e == 16.));

        let loss = reconstruction_loss(&err)?.to_scalar::<f32>()?;
        assert_eq!(loss, 8.);
        Ok(())
    }

    #[test]
    fn test_l2_penalty() -> Result<()> {
        let dev = Device::Cpu;
        let w1 = Tensor::new(&[1f32, 2.], &dev)?;
        let w2 = Tensor::new(&[[3f32]], &dev)?;
        let pen = l2_penalty(&[w1, w2], &dev)?.to_scalar::<f32>()?;
        assert_eq!(pen, 7.);
        assert_eq!(l2_penalty(&[], &dev)?.to_scalar::<f32>()?, 0.);
        Ok(())
    }
}
