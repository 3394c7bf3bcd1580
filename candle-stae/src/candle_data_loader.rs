use candle_core::{DType, Device, Tensor};
use rand::prelude::SliceRandom;
use std::path::Path;

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<Tensor>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(size: usize) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
        }
    }

    /// Shuffle the samples and cut them into chunks of `batch_size`;
    /// the last chunk may be smaller
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.chunks = self
            .samples
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// First frame of every window of `tvol` frames, `stride` apart
///
/// # Returns `N = (nframes - tvol) / stride + 1` start indices
pub fn window_starts(nframes: usize, tvol: usize, stride: usize) -> anyhow::Result<Vec<usize>> {
    if tvol == 0 || stride == 0 {
        anyhow::bail!("tvol and stride must be positive");
    }
    if nframes < tvol {
        anyhow::bail!("{} frames cannot fill a volume of {}", nframes, tvol);
    }
    Ok((0..=(nframes - tvol)).step_by(stride).collect())
}

/// Read frames or volumes from a `.npy` file as `f32`.
/// Unsigned 8-bit pixels are scaled to [0, 1].
pub fn read_npy_f32(path: &Path) -> anyhow::Result<Tensor> {
    let raw = Tensor::read_npy(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(match raw.dtype() {
        DType::U8 => raw.to_dtype(DType::F32)?.affine(1. / 255., 0.)?,
        DType::F32 => raw,
        _ => raw.to_dtype(DType::F32)?,
    })
}

///
/// In-memory video `(F, H, W, C)` seen as windows of `tvol` frames.
/// Each window is a sample; frames are stored once and a window is
/// only materialized when it is handed out in a minibatch.
///
pub struct VolumeData {
    frames: Tensor,
    tvol: usize,
    stride: usize,
    starts: Vec<usize>,
    minibatches: Minibatches,
}

impl VolumeData {
    /// Ready-made volumes `(N, T, H, W, C)` become back-to-back windows
    /// (stride `T`) over their concatenated frames
    pub fn from_volumes(volumes: &Tensor) -> anyhow::Result<Self> {
        let (n, t, h, w, c) = volumes.dims5()?;
        let frames = volumes.reshape((n * t, h, w, c))?;
        Self::from_frames(&frames, t, t)
    }

    /// Sliding windows over `(F, H, W)` or `(F, H, W, C)` frames
    pub fn from_frames(frames: &Tensor, tvol: usize, stride: usize) -> anyhow::Result<Self> {
        let frames = match frames.rank() {
            3 => frames.unsqueeze(3)?,
            4 => frames.clone(),
            r => anyhow::bail!("expected (F, H, W[, C]) frames, got rank {}", r),
        };
        let starts = window_starts(frames.dim(0)?, tvol, stride)?;
        let n = starts.len();
        Ok(Self {
            frames,
            tvol,
            stride,
            starts,
            minibatches: Minibatches::new(n),
        })
    }

    /// Frames `(F, H, W[, C])` are windowed with `tvol` and `stride`;
    /// volumes `(N, T, H, W, C)` keep their own `T` and do not overlap
    pub fn from_npy(path: &Path, tvol: usize, stride: usize) -> anyhow::Result<Self> {
        let data = read_npy_f32(path)?;
        match data.rank() {
            5 => Self::from_volumes(&data),
            _ => Self::from_frames(&data, tvol, stride),
        }
    }

    pub fn num_volumes(&self) -> usize {
        self.starts.len()
    }

    /// frames per volume
    pub fn tvol(&self) -> usize {
        self.tvol
    }

    /// offset between the first frames of consecutive volumes
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// all frames `(F, H, W, C)`, each stored once
    pub fn frames(&self) -> &Tensor {
        &self.frames
    }

    /// `(H, W, C)` of a frame
    pub fn frame_dims(&self) -> &[usize] {
        &self.frames.dims()[1..]
    }

    fn windows<I>(&self, samples: I, target_device: &Device) -> anyhow::Result<Tensor>
    where
        I: Iterator<Item = usize>,
    {
        let volumes = samples
            .map(|i| self.frames.narrow(0, self.starts[i], self.tvol))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&volumes, 0)?.to_device(target_device)?)
    }

    /// Volumes `[lb, ub)` in window order
    pub fn range_data(&self, lb: usize, ub: usize, target_device: &Device) -> anyhow::Result<Tensor> {
        let ub = ub.min(self.num_volumes());
        if lb >= ub {
            anyhow::bail!("empty range [{}, {})", lb, ub);
        }
        self.windows(lb..ub, target_device)
    }
}

impl DataLoader for VolumeData {
    fn minibatch_data(&self, batch_idx: usize, target_device: &Device) -> anyhow::Result<Tensor> {
        if let Some(samples) = self.minibatches.chunks.get(batch_idx) {
            self.windows(samples.iter().copied(), target_device)
        } else {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            ))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> anyhow::Result<Tensor> {
        // frame f is filled with the value f
        Ok(Tensor::arange(0f32, n as f32, &Device::Cpu)?
            .reshape((n, 1, 1))?
            .repeat((1, 3, 2))?)
    }

    #[test]
    fn test_window_starts() -> anyhow::Result<()> {
        assert_eq!(window_starts(10, 4, 2)?, vec![0, 2, 4, 6]);
        assert_eq!(window_starts(4, 4, 3)?, vec![0]);
        assert!(window_starts(3, 4, 1).is_err());
        assert!(window_starts(5, 4, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_sliding_windows_share_frames() -> anyhow::Result<()> {
        let data = VolumeData::from_frames(&frames(10)?, 4, 2)?;
        assert_eq!(data.num_volumes(), 4);
        // frames are kept once, not once per window
        assert_eq!(data.frames().dims(), &[10, 3, 2, 1]);
        assert_eq!(data.frame_dims(), &[3, 2, 1]);

        let v = data.range_data(0, 4, &Device::Cpu)?;
        assert_eq!(v.dims(), &[4, 4, 3, 2, 1]);
        // second volume holds frames 2..6
        for t in 0..4 {
            let x = v.get(1)?.get(t)?.flatten_all()?.to_vec1::<f32>()?;
            assert!(x.iter().all(|&x| x == (2 + t) as f32));
        }
        Ok(())
    }

    #[test]
    fn test_minibatches_cover_all_volumes() -> anyhow::Result<()> {
        let mut data = VolumeData::from_frames(&frames(12)?, 3, 1)?;
        assert_eq!(data.num_volumes(), 10);
        assert_eq!(data.num_minibatch(), 0);

        data.shuffle_minibatch(4)?;
        assert_eq!(data.num_minibatch(), 3);

        let mut seen = vec![];
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, &Device::Cpu)?;
            assert_eq!(mb.dims()[1..], [3, 3, 2, 1]);
            // first frame value identifies the volume
            for i in 0..mb.dim(0)? {
                let v = mb.get(i)?.flatten_all()?.to_vec1::<f32>()?[0];
                seen.push(v as usize);
            }
        }
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(data.minibatch_data(3, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_npy_frames() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("frames.npy");
        let raw = Tensor::full(255u8, (6, 4, 4), &Device::Cpu)?;
        raw.write_npy(&path)?;

        let data = VolumeData::from_npy(&path, 2, 2)?;
        assert_eq!(data.num_volumes(), 3);
        assert_eq!((data.tvol(), data.stride()), (2, 2));
        let max = data.frames().max_all()?.to_scalar::<f32>()?;
        assert!((max - 1.0).abs() < 1e-6);

        let range = data.range_data(1, 10, &Device::Cpu)?;
        assert_eq!(range.dims(), &[2, 2, 4, 4, 1]);
        Ok(())
    }

    #[test]
    fn test_npy_volumes_do_not_overlap() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("volumes.npy");
        // volume n, frame t is filled with 10 * n + t
        let vals = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((2, 3))?;
        let offset = Tensor::new(&[[0f32], [7.]], &Device::Cpu)?;
        let vals = vals.broadcast_add(&offset)?;
        let volumes = vals
            .reshape((2, 3, 1, 1, 1))?
            .repeat((1, 1, 4, 4, 1))?
            .contiguous()?;
        volumes.write_npy(&path)?;

        // the volume length comes from the file, not from the arguments
        let data = VolumeData::from_npy(&path, 5, 1)?;
        assert_eq!(data.num_volumes(), 2);
        assert_eq!((data.tvol(), data.stride()), (3, 3));

        let back = data.range_data(0, 2, &Device::Cpu)?;
        assert_eq!(back.dims(), volumes.dims());
        let diff = back.sub(&volumes)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        Ok(())
    }
}
