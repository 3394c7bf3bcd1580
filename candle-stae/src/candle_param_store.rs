use candle_core::{DType, Device, Error, Result, Shape, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// What a parameter is used for. The role, not the name, decides
/// whether a tensor is penalized or updated by the optimizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamRole {
    Kernel,
    Bias,
    Scale,
    Shift,
    RunningStat,
}

impl ParamRole {
    /// only convolution kernels enter the L2 penalty
    pub fn is_regularizable(&self) -> bool {
        matches!(self, ParamRole::Kernel)
    }

    /// running statistics are updated by batch norm, not by gradients
    pub fn is_trainable(&self) -> bool {
        !matches!(self, ParamRole::RunningStat)
    }
}

#[derive(Clone, Debug)]
pub struct NamedParam {
    pub name: String,
    pub role: ParamRole,
    pub var: Var,
}

/// A `VarMap` that also remembers the role of each variable
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    roles: Arc<Mutex<BTreeMap<String, ParamRole>>>,
    dtype: DType,
    device: Device,
}

fn poisoned<T>(_: T) -> Error {
    Error::Msg("parameter store lock poisoned".to_string())
}

impl ParamStore {
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            roles: Arc::new(Mutex::new(BTreeMap::new())),
            dtype,
            device: device.clone(),
        }
    }

    pub fn root(&self) -> ParamBuilder {
        ParamBuilder {
            store: self.clone(),
            path: vec![],
        }
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn get_with_role<S: Into<Shape>>(
        &self,
        shape: S,
        name: &str,
        init: Init,
        role: ParamRole,
    ) -> Result<Tensor> {
        let vb = VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device);
        let ret = vb.get_with_hints(shape, name, init)?;
        let mut roles = self.roles.lock().map_err(poisoned)?;
        if let Some(prev) = roles.insert(name.to_string(), role) {
            if prev != role {
                candle_core::bail!("parameter {} registered as {:?} and {:?}", name, prev, role);
            }
        }
        Ok(ret)
    }

    /// All parameters sorted by name
    pub fn named_params(&self) -> Result<Vec<NamedParam>> {
        let data = self.varmap.data().lock().map_err(poisoned)?;
        let roles = self.roles.lock().map_err(poisoned)?;
        roles
            .iter()
            .map(|(name, role)| {
                let var = data
                    .get(name)
                    .ok_or_else(|| Error::Msg(format!("unregistered parameter {}", name)))?;
                Ok(NamedParam {
                    name: name.clone(),
                    role: *role,
                    var: var.clone(),
                })
            })
            .collect()
    }

    /// Tensors that contribute to the L2 penalty
    pub fn regularizable(&self) -> Result<Vec<Tensor>> {
        Ok(self
            .named_params()?
            .into_iter()
            .filter(|p| p.role.is_regularizable())
            .map(|p| p.var.as_tensor().clone())
            .collect())
    }

    /// (name, variable) pairs the optimizer should update
    pub fn trainable(&self) -> Result<Vec<(String, Var)>> {
        Ok(self
            .named_params()?
            .into_iter()
            .filter(|p| p.role.is_trainable())
            .map(|p| (p.name, p.var))
            .collect())
    }

    pub fn num_elements(&self) -> Result<usize> {
        Ok(self
            .named_params()?
            .iter()
            .map(|p| p.var.as_tensor().elem_count())
            .sum())
    }
}

/// Hands out parameters under a dotted prefix, much like `VarBuilder::pp`
#[derive(Clone)]
pub struct ParamBuilder {
    store: ParamStore,
    path: Vec<String>,
}

impl ParamBuilder {
    pub fn pp<S: ToString>(&self, s: S) -> Self {
        let mut path = self.path.clone();
        path.push(s.to_string());
        Self {
            store: self.store.clone(),
            path,
        }
    }

    pub fn path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path.join("."), name)
        }
    }

    pub fn get<S: Into<Shape>>(
        &self,
        shape: S,
        name: &str,
        init: Init,
        role: ParamRole,
    ) -> Result<Tensor> {
        self.store
            .get_with_role(shape, &self.path(name), init, role)
    }

    /// Same as `get`, but keeps the handle so the values can be
    /// overwritten outside of the optimizer
    pub fn get_var<S: Into<Shape>>(
        &self,
        shape: S,
        name: &str,
        init: Init,
        role: ParamRole,
    ) -> Result<Var> {
        let t = self.get(shape, name, init, role)?;
        Var::from_tensor(&t)
    }

    pub fn device(&self) -> &Device {
        self.store.device()
    }

    pub fn dtype(&self) -> DType {
        self.store.dtype()
    }
}

/// Glorot/Xavier uniform bounds for a `k x k` convolution
pub fn xavier_conv2d(kernel: usize, in_channels: usize, out_channels: usize) -> Init {
    let fan_in = (kernel * kernel * in_channels) as f64;
    let fan_out = (kernel * kernel * out_channels) as f64;
    let bound = (6.0 / (fan_in + fan_out)).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_tracked() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let pb = store.root().pp("enc").pp(0);
        pb.get((4, 1, 3, 3), "weight", xavier_conv2d(3, 1, 4), ParamRole::Kernel)?;
        pb.get(4, "bias", Init::Const(0.01), ParamRole::Bias)?;
        pb.get_var(4, "running_mean", Init::Const(0.), ParamRole::RunningStat)?;

        let names = store
            .named_params()?
            .into_iter()
            .map(|p| p.name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["enc.0.bias", "enc.0.running_mean", "enc.0.weight"]
        );

        assert_eq!(store.regularizable()?.len(), 1);
        assert_eq!(store.trainable()?.len(), 2);
        assert_eq!(store.num_elements()?, 36 + 4 + 4);
        Ok(())
    }

    #[test]
    fn test_conflicting_role_fails() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let pb = store.root();
        pb.get(3, "bias", Init::Const(0.), ParamRole::Bias)?;
        assert!(pb.get(3, "bias", Init::Const(0.), ParamRole::Kernel).is_err());
        Ok(())
    }

    #[test]
    fn test_var_shares_storage() -> Result<()> {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let var = store
            .root()
            .get_var(2, "stat", Init::Const(1.), ParamRole::RunningStat)?;
        var.set(&Tensor::new(&[3f32, 4.], &Device::Cpu)?)?;

        let stored = store.named_params()?;
        let v = stored[0].var.as_tensor().to_vec1::<f32>()?;
        assert_eq!(v, vec![3., 4.]);
        Ok(())
    }
}
