use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};
use crate::graph::array::Array;
use crate::graph::dtype::DType;

/// How a variable's first value is produced when the session initializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    /// Orthogonal matrix over (prod(shape[..-1]), shape[-1]), scaled by `gain`.
    Orthogonal { gain: f32 },
    RandomNormal { mean: f32, stddev: f32 },
    Constant { value: f32 },
}

impl Initializer {
    pub fn orthogonal(gain: f32) -> Initializer {
        Initializer::Orthogonal { gain }
    }

    pub fn random_normal(stddev: f32) -> Initializer {
        Initializer::RandomNormal { mean: 0.0, stddev }
    }

    pub fn constant(value: f32) -> Initializer {
        Initializer::Constant { value }
    }

    pub fn sample(&self, shape: &[usize], dtype: DType, rng: &mut StdRng) -> Result<Array> {
        let array = match self {
            Initializer::Constant { value } => Array::full(shape, *value),
            Initializer::RandomNormal { mean, stddev } => {
                let normal = Normal::new(*mean, *stddev).map_err(|e| {
                    OpsError::Configuration(format!("random normal stddev {stddev}: {e}"))
                })?;
                let n = shape.iter().product();
                Array {
                    shape: shape.to_vec(),
                    data: (0..n).map(|_| normal.sample(rng)).collect(),
                }
            }
            Initializer::Orthogonal { gain } => orthogonal(shape, *gain, rng)?,
        };
        Ok(array.map(|x| dtype.round(x)))
    }
}

fn orthogonal(shape: &[usize], gain: f32, rng: &mut StdRng) -> Result<Array> {
    if shape.len() < 2 {
        return Err(OpsError::backend(
            "orthogonal_initializer",
            format!("shape must have at least two dimensions, got {shape:?}"),
        ));
    }
    let cols = shape[shape.len() - 1];
    let rows: usize = shape[..shape.len() - 1].iter().product();

    // Orthonormalize the columns of a tall (n x k) normal matrix.
    let (n, k) = (rows.max(cols), rows.min(cols));
    let mut q: Vec<Vec<f32>> = (0..k)
        .map(|_| (0..n).map(|_| StandardNormal.sample(rng)).collect())
        .collect();
    for j in 0..k {
        for i in 0..j {
            let dot: f32 = q[j].iter().zip(&q[i]).map(|(a, b)| a * b).sum();
            let (done, rest) = q.split_at_mut(j);
            for (x, y) in rest[0].iter_mut().zip(&done[i]) {
                *x -= dot * y;
            }
        }
        let norm = q[j].iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        q[j].iter_mut().for_each(|x| *x /= norm);
    }

    // q[j][i] is column j of the tall matrix; lay it out as (rows, cols).
    let mut data = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            data[r * cols + c] = if rows >= cols { q[c][r] } else { q[r][c] } * gain;
        }
    }
    Array::from_vec(shape, data)
}
