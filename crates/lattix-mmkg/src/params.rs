//! Seeded parameter storage.
//!
//! A thin layer over [`candle_nn::VarMap`] that draws every initial value from
//! a caller-supplied [`StdRng`], so two models built with the same seed are
//! bit-identical. Parameters are named (`ent_embeddings`, `proj.visual.fc1.weight`,
//! ...) and the whole map round-trips through safetensors.

use std::path::Path;

use candle_core::{Device, Shape, Tensor, Var};
use candle_nn::{Linear, VarMap};
use rand::prelude::*;
use rand_distr::Uniform;

use crate::error::{Error, Result};

/// Named trainable tensors of one network.
pub struct ParamStore {
    varmap: VarMap,
    device: Device,
}

impl std::fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamStore")
            .field("device", &self.device)
            .field("num_tensors", &self.all_vars().len())
            .finish()
    }
}

impl ParamStore {
    pub fn new(device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Register an existing tensor as a trainable parameter.
    pub fn insert(&self, name: &str, value: &Tensor) -> Result<Tensor> {
        let var = Var::from_tensor(&value.to_device(&self.device)?)?;
        let tensor = var.as_tensor().clone();
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Training("parameter map lock poisoned".into()))?;
        if data.insert(name.to_string(), var).is_some() {
            return Err(Error::InvalidConfig(format!("parameter {name} registered twice")));
        }
        Ok(tensor)
    }

    /// New parameter with entries drawn from `U(lo, hi)`.
    pub fn uniform(
        &self,
        name: &str,
        shape: impl Into<Shape>,
        lo: f64,
        hi: f64,
        rng: &mut StdRng,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let values = uniform_values(shape.elem_count(), lo, hi, rng)?;
        let value = Tensor::from_vec(values, shape, &self.device)?;
        self.insert(name, &value)
    }

    /// Fully connected layer with PyTorch's default init, `U(±1/sqrt(in))`.
    pub fn linear(&self, name: &str, in_dim: usize, out_dim: usize, bias: bool, rng: &mut StdRng) -> Result<Linear> {
        let bound = 1.0 / (in_dim.max(1) as f64).sqrt();
        let weight = self.uniform(&format!("{name}.weight"), (out_dim, in_dim), -bound, bound, rng)?;
        let bias = if bias {
            Some(self.uniform(&format!("{name}.bias"), out_dim, -bound, bound, rng)?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }

    /// Every parameter, for an optimizer.
    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite every registered parameter in place from a safetensors file.
    ///
    /// Tensors handed out earlier observe the new values.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}

fn uniform_values(n: usize, lo: f64, hi: f64, rng: &mut StdRng) -> Result<Vec<f32>> {
    if lo == hi {
        return Ok(vec![lo as f32; n]);
    }
    let dist = Uniform::new(lo as f32, hi as f32)
        .map_err(|e| Error::InvalidConfig(format!("uniform bounds [{lo}, {hi}): {e}")))?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Module;

    #[test]
    fn test_uniform_is_seeded_and_bounded() {
        let a = ParamStore::new(&Device::Cpu);
        let b = ParamStore::new(&Device::Cpu);
        let ta = a.uniform("w", (4, 3), -0.5, 0.5, &mut StdRng::seed_from_u64(1)).unwrap();
        let tb = b.uniform("w", (4, 3), -0.5, 0.5, &mut StdRng::seed_from_u64(1)).unwrap();

        let va = ta.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let vb = tb.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(va, vb);
        assert!(va.iter().all(|x| (-0.5..0.5).contains(x)));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = ParamStore::new(&Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        store.uniform("w", 2, -1.0, 1.0, &mut rng).unwrap();
        assert!(store.uniform("w", 2, -1.0, 1.0, &mut rng).is_err());
    }

    #[test]
    fn test_linear_shapes() {
        let store = ParamStore::new(&Device::Cpu);
        let layer = store.linear("fc", 5, 3, true, &mut StdRng::seed_from_u64(0)).unwrap();
        let x = Tensor::ones((2, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[2, 3]);
        assert_eq!(store.num_parameters(), 5 * 3 + 3);
    }

    #[test]
    fn test_save_load_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.safetensors");

        let store = ParamStore::new(&Device::Cpu);
        let original = store.uniform("w", 6, -1.0, 1.0, &mut StdRng::seed_from_u64(3)).unwrap();
        store.save(&path).unwrap();

        let mut other = ParamStore::new(&Device::Cpu);
        let handle = other.uniform("w", 6, -1.0, 1.0, &mut StdRng::seed_from_u64(99)).unwrap();
        other.load(&path).unwrap();

        assert_eq!(
            handle.to_vec1::<f32>().unwrap(),
            original.to_vec1::<f32>().unwrap()
        );
    }
}
