use serde::{Deserialize, Serialize};
use std::path::Path;

pub const NCHANNELS: usize = 1;
pub const HEIGHT: usize = 227;
pub const WIDTH: usize = 227;

pub const CONV1: usize = 64;
pub const CONV2: usize = 64;
pub const CONV3: usize = 64;
pub const CONV4: usize = 32;
pub const CLSTM1: usize = 32;
pub const CLSTM2: usize = 32;
pub const CLSTM3: usize = 32;
pub const DECONV1: usize = NCHANNELS;

pub const MODEL_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";

/// kernel size, stride and output depth of a valid-padded convolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvStageConfig {
    pub kernel: usize,
    pub stride: usize,
    pub out_channels: usize,
}

impl ConvStageConfig {
    pub const fn new(kernel: usize, stride: usize, out_channels: usize) -> Self {
        Self {
            kernel,
            stride,
            out_channels,
        }
    }
}

/// Model architecture; every module is built from this
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StaeConfig {
    /// number of frames in a volume
    pub tvol: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub encoder: Vec<ConvStageConfig>,
    pub lstm_filters: Vec<usize>,
    pub lstm_kernel: usize,
    pub decoder_kernel: usize,
    pub bn_eps: f64,
    pub bn_decay: f64,
}

impl StaeConfig {
    /// The fixed 227 x 227 grayscale architecture for `tvol` frames
    pub fn new(tvol: usize) -> Self {
        Self {
            tvol,
            height: HEIGHT,
            width: WIDTH,
            channels: NCHANNELS,
            encoder: vec![
                ConvStageConfig::new(7, 2, CONV1),
                ConvStageConfig::new(5, 2, CONV2),
                ConvStageConfig::new(3, 1, CONV3),
                ConvStageConfig::new(3, 1, CONV4),
            ],
            lstm_filters: vec![CLSTM1, CLSTM2, CLSTM3],
            lstm_kernel: 3,
            decoder_kernel: 3,
            bn_eps: 1e-3,
            bn_decay: 0.999,
        }
    }

    pub fn with_frame_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    /// depth of the encoder output
    pub fn encoder_channels(&self) -> usize {
        self.encoder
            .last()
            .map(|s| s.out_channels)
            .unwrap_or(self.channels)
    }

    /// depth of the top recurrent layer
    pub fn temporal_channels(&self) -> usize {
        self.lstm_filters
            .last()
            .copied()
            .unwrap_or_else(|| self.encoder_channels())
    }

    /// Spatial extent after the encoder, `(n - k) / s + 1` per stage
    pub fn encoder_extent(&self) -> candle_core::Result<(usize, usize)> {
        let mut h = self.height;
        let mut w = self.width;
        for (j, stage) in self.encoder.iter().enumerate() {
            if stage.kernel > h || stage.kernel > w {
                candle_core::bail!(
                    "encoder stage {} ({}x{}) does not fit a {}x{} map",
                    j,
                    stage.kernel,
                    stage.kernel,
                    h,
                    w
                );
            }
            h = (h - stage.kernel) / stage.stride + 1;
            w = (w - stage.kernel) / stage.stride + 1;
        }
        Ok((h, w))
    }

    pub fn validate(&self) -> candle_core::Result<()> {
        if self.tvol == 0 {
            candle_core::bail!("tvol must be positive");
        }
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            candle_core::bail!(
                "empty frame shape {}x{}x{}",
                self.height,
                self.width,
                self.channels
            );
        }
        if self.encoder.iter().any(|s| s.stride == 0 || s.kernel == 0) {
            candle_core::bail!("encoder stages need positive kernel and stride");
        }
        if self.lstm_filters.is_empty() {
            candle_core::bail!("at least one recurrent layer is required");
        }
        if self.lstm_kernel % 2 == 0 || self.decoder_kernel % 2 == 0 {
            candle_core::bail!("same-padded kernels must have odd size");
        }
        if !(0.0..1.0).contains(&self.bn_decay) {
            candle_core::bail!("batch norm decay {} not in [0, 1)", self.bn_decay);
        }
        self.encoder_extent()?;
        Ok(())
    }

    pub fn to_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn from_json(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_extent() -> candle_core::Result<()> {
        let config = StaeConfig::new(10);
        config.validate()?;
        // 227 -> 111 -> 54 -> 52 -> 50
        assert_eq!(config.encoder_extent()?, (50, 50));
        assert_eq!(config.encoder_channels(), 32);
        assert_eq!(config.temporal_channels(), 32);
        Ok(())
    }

    #[test]
    fn test_small_frames() -> candle_core::Result<()> {
        let config = StaeConfig::new(4).with_frame_size(45, 45);
        // 45 -> 20 -> 8 -> 6 -> 4
        assert_eq!(config.encoder_extent()?, (4, 4));
        Ok(())
    }

    #[test]
    fn test_collapsing_frames_are_rejected() {
        let config = StaeConfig::new(4).with_frame_size(16, 16);
        assert!(config.validate().is_err());
        assert!(StaeConfig::new(0).validate().is_err());
    }

    #[test]
    fn test_json_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE);
        let config = StaeConfig::new(8).with_frame_size(64, 48);
        config.to_json(&path)?;
        assert_eq!(StaeConfig::from_json(&path)?, config);
        Ok(())
    }
}
