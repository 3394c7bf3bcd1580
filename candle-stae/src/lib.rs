pub mod candle_aux_layers;
pub mod candle_batch_norm;
pub mod candle_checkpoint;
pub mod candle_conv_lstm;
pub mod candle_data_loader;
pub mod candle_experiment;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_config;
pub mod candle_model_traits;
pub mod candle_optimizer;
pub mod candle_param_store;
pub mod candle_scoring;
pub mod candle_spatial_decoder;
pub mod candle_spatial_encoder;
pub mod candle_temporal_stack;

pub use candle_core;
pub use candle_nn;
