#![allow(dead_code, unused_imports)]

pub use log::info;
pub use std::path::{Path, PathBuf};

pub use candle_stae::candle_data_loader::*;
pub use candle_stae::candle_experiment::*;
pub use candle_stae::candle_inference::TrainConfig;
pub use candle_stae::candle_model_config::*;
pub use candle_stae::candle_scoring::*;

pub use candle_stae::{candle_core, candle_nn};

pub const DEFAULT_TVOL: usize = 10;
