use crate::candle_model_config::{StaeConfig, CONFIG_FILE, MODEL_FILE};
use crate::candle_optimizer::Adam;
use crate::candle_param_store::ParamStore;
use candle_core::Tensor;
use log::info;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const PARAM_PREFIX: &str = "param.";

pub fn model_file(dir: &Path) -> PathBuf {
    dir.join(MODEL_FILE)
}

pub fn config_file(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Write parameters, batch-norm statistics and optimizer state to
/// `{dir}/model.safetensors`, and the architecture to `{dir}/config.json`
pub fn save_checkpoint(
    dir: &Path,
    params: &ParamStore,
    optimizer: &Adam,
    config: &StaeConfig,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {}", dir.display(), e))?;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    for p in params.named_params()? {
        tensors.insert(
            format!("{}{}", PARAM_PREFIX, p.name),
            p.var.as_tensor().clone(),
        );
    }
    for (name, t) in optimizer.state_tensors(params.device())? {
        tensors.insert(name, t);
    }

    let file = model_file(dir);
    candle_core::safetensors::save(&tensors, &file)?;
    config.to_json(&config_file(dir))?;

    info!("saved {} tensors to {}", tensors.len(), file.display());
    Ok(file)
}

/// Overwrite every parameter and the optimizer state from
/// `{dir}/model.safetensors`.
///
/// `{dir}/config.json` must describe the same model as `config`, and
/// all entries are checked against the live model before anything is
/// written; a missing or mismatched entry is an error.
pub fn restore_checkpoint(
    dir: &Path,
    params: &ParamStore,
    optimizer: &mut Adam,
    config: &StaeConfig,
) -> anyhow::Result<()> {
    let file = model_file(dir);
    if !file.exists() {
        anyhow::bail!("no checkpoint at {}", file.display());
    }

    // tvol and frame size leave parameter shapes unchanged
    let saved = StaeConfig::from_json(&config_file(dir))?;
    if saved != *config {
        anyhow::bail!(
            "checkpoint {} was saved for {:?}, model is {:?}",
            dir.display(),
            saved,
            config
        );
    }
    let tensors = candle_core::safetensors::load(&file, params.device())?;

    let named = params.named_params()?;
    for p in named.iter() {
        let key = format!("{}{}", PARAM_PREFIX, p.name);
        let t = tensors
            .get(&key)
            .ok_or_else(|| anyhow::anyhow!("checkpoint {} lacks {}", file.display(), key))?;
        if t.dims() != p.var.as_tensor().dims() {
            anyhow::bail!(
                "checkpoint {} has {:?} for {}, model expects {:?}",
                file.display(),
                t.dims(),
                key,
                p.var.as_tensor().dims()
            );
        }
    }
    optimizer.check_state(&tensors)?;

    for p in named.iter() {
        let key = format!("{}{}", PARAM_PREFIX, p.name);
        if let Some(t) = tensors.get(&key) {
            p.var.set(&t.to_dtype(params.dtype())?)?;
        }
    }
    optimizer.load_state(&tensors)?;

    info!("restored {} parameters from {}", named.len(), file.display());
    Ok(())
}
