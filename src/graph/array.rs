use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};

/// Dense row-major `f32` buffer with a concrete shape.
///
/// This is what a `Session` produces when it evaluates a graph tensor, and
/// what it stores as the current value of every variable.
///
/// Fields:
/// - `shape`: concrete dimensions, outermost first; empty for a scalar
/// - `data`: `shape.iter().product()` values, last axis varying fastest
///   (NHWC images therefore keep each pixel's channels adjacent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Array {
    pub fn zeros(shape: &[usize]) -> Array {
        Array::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Array {
        Array::full(shape, 1.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Array {
        Array {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    pub fn scalar(value: f32) -> Array {
        Array { shape: vec![], data: vec![value] }
    }

    /// Wraps `data` without copying; its length must match the shape.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Array> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(OpsError::shape_mismatch(
                "array",
                format!("{expected} elements for shape {shape:?}"),
                data.len(),
            ));
        }
        Ok(Array { shape: shape.to_vec(), data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Row-major strides for this shape.
    pub fn strides(&self) -> Vec<usize> {
        strides_of(&self.shape)
    }

    pub fn map<F>(&self, functor: F) -> Array
    where
        F: Fn(f32) -> f32,
    {
        Array {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| functor(x)).collect(),
        }
    }

    /// Elementwise binary op with numpy broadcasting.
    pub fn zip_with<F>(&self, rhs: &Array, functor: F) -> Result<Array>
    where
        F: Fn(f32, f32) -> f32,
    {
        if self.shape == rhs.shape {
            let data = self.data.iter().zip(&rhs.data).map(|(&a, &b)| functor(a, b)).collect();
            return Ok(Array { shape: self.shape.clone(), data });
        }

        let shape = broadcast_shapes(&self.shape, &rhs.shape)?;
        let a_strides = broadcast_strides(&self.shape, shape.len());
        let b_strides = broadcast_strides(&rhs.shape, shape.len());
        let out_strides = strides_of(&shape);
        let total: usize = shape.iter().product();

        let mut data = Vec::with_capacity(total);
        for flat in 0..total {
            let mut rem = flat;
            let (mut ia, mut ib) = (0, 0);
            for axis in 0..shape.len() {
                let coord = rem / out_strides[axis];
                rem %= out_strides[axis];
                ia += coord * a_strides[axis];
                ib += coord * b_strides[axis];
            }
            data.push(functor(self.data[ia], rhs.data[ib]));
        }
        Ok(Array { shape, data })
    }

    pub fn reshaped(&self, shape: &[usize]) -> Result<Array> {
        Array::from_vec(shape, self.data.clone())
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Mean and population variance of each slice along the last axis,
    /// taken over every other axis.
    pub fn channel_moments(&self) -> (Vec<f32>, Vec<f32>) {
        let channels = self.shape.last().copied().unwrap_or(1).max(1);
        let count = (self.data.len() / channels).max(1) as f32;
        let mut mean = vec![0.0; channels];
        for (i, x) in self.data.iter().enumerate() {
            mean[i % channels] += x;
        }
        mean.iter_mut().for_each(|m| *m /= count);
        let mut variance = vec![0.0; channels];
        for (i, x) in self.data.iter().enumerate() {
            variance[i % channels] += (x - mean[i % channels]).powi(2);
        }
        variance.iter_mut().for_each(|v| *v /= count);
        (mean, variance)
    }
}

pub(crate) fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
            let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
            match (da, db) {
                (x, y) if x == y => Ok(x),
                (1, y) => Ok(y),
                (x, 1) => Ok(x),
                (x, y) => Err(OpsError::shape_mismatch(
                    "broadcast",
                    format!("{a:?} compatible with {b:?}"),
                    format!("{x} vs {y}"),
                )),
            }
        })
        .collect()
}

/// Strides of `shape` left-padded to `rank`, with 0 on broadcast axes.
fn broadcast_strides(shape: &[usize], rank: usize) -> Vec<usize> {
    let own = strides_of(shape);
    let offset = rank - shape.len();
    (0..rank)
        .map(|i| {
            if i < offset || shape[i - offset] == 1 { 0 } else { own[i - offset] }
        })
        .collect()
}
