pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub lambd: f32,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl TrainConfig {
    pub fn new(learning_rate: f32, batch_size: usize, lambd: f32) -> Self {
        Self {
            learning_rate,
            batch_size,
            lambd,
            num_epochs: 1,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        }
    }
}
