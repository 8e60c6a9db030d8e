//! Seeded parameter creation.
//!
//! candle's CPU backend has no global seed, so parameters are registered in
//! the [`VarMap`] and then overwritten with values drawn from the run's
//! `init` stream.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarMap};
use credo_core::Result;
use rand::Rng;
use rand::rngs::StdRng;

/// Register `name` with uniform values in `[-bound, bound]`. A zero bound
/// leaves the parameter at zero.
pub(crate) fn uniform(
    vars: &mut VarMap,
    name: &str,
    shape: &[usize],
    bound: f64,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let tensor = vars.get(shape, name, Init::Const(0.0), DType::F32, device)?;
    if bound > 0.0 {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count)
            .map(|_| rng.gen_range(-bound..bound) as f32)
            .collect();
        vars.set_one(name, Tensor::from_vec(values, shape, device)?)?;
    }
    Ok(tensor)
}

/// Glorot-style bound for a `fan_in x fan_out` weight.
pub(crate) fn glorot_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}
