use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};
use crate::graph::{Initializer, Tensor, UnaryOp, Variable};
use crate::ops::builder::Ops;

const LRELU_LEAK: f32 = 0.2;
/// Spread of the initial `alphas` of the parametric activations.
const ALPHA_STDDEV: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Tanh,
    Sigmoid,
    #[default]
    Relu,
    Crelu,
    /// Parametric ReLU with one learned slope per feature.
    Prelu,
    /// Thresholded activation with one learned threshold per feature.
    Trelu,
    /// Activation shifted by one learned scalar.
    Frelu,
    Selu,
    Lrelu,
    Square,
}

impl Activation {
    pub fn from_name(name: &str) -> Option<Activation> {
        let activation = match name {
            "tanh" => Activation::Tanh,
            "sigmoid" => Activation::Sigmoid,
            "relu" => Activation::Relu,
            "crelu" => Activation::Crelu,
            "prelu" => Activation::Prelu,
            "trelu" => Activation::Trelu,
            "frelu" => Activation::Frelu,
            "selu" => Activation::Selu,
            "lrelu" => Activation::Lrelu,
            "square" => Activation::Square,
            _ => return None,
        };
        Some(activation)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Relu => "relu",
            Activation::Crelu => "crelu",
            Activation::Prelu => "prelu",
            Activation::Trelu => "trelu",
            Activation::Frelu => "frelu",
            Activation::Selu => "selu",
            Activation::Lrelu => "lrelu",
            Activation::Square => "square",
        }
    }

    /// True for the variants that allocate a trainable parameter per call.
    pub fn is_parametric(&self) -> bool {
        matches!(self, Activation::Prelu | Activation::Trelu | Activation::Frelu)
    }

    /// True for `crelu`, whose output has twice the input's last dimension.
    pub fn widens(&self) -> bool {
        matches!(self, Activation::Crelu)
    }

    pub fn apply(&self, ops: &mut Ops, x: &Tensor) -> Result<Tensor> {
        let g = ops.graph_mut();
        match self {
            Activation::Tanh => Ok(g.unary(UnaryOp::Tanh, x)),
            Activation::Sigmoid => Ok(g.unary(UnaryOp::Sigmoid, x)),
            Activation::Relu => Ok(g.unary(UnaryOp::Relu, x)),
            Activation::Selu => Ok(g.unary(UnaryOp::Selu, x)),
            Activation::Lrelu => Ok(g.unary(UnaryOp::LeakyRelu(LRELU_LEAK), x)),
            Activation::Square => Ok(g.square(x)),
            Activation::Crelu => ops.crelu(x),
            Activation::Prelu => ops.prelu(x),
            Activation::Trelu => ops.trelu(x),
            Activation::Frelu => ops.frelu(x),
        }
    }
}

impl Ops {
    /// `relu(x)` and `relu(-x)` concatenated along the last axis.
    pub fn crelu(&mut self, x: &Tensor) -> Result<Tensor> {
        let g = self.graph_mut();
        let pos = g.unary(UnaryOp::Relu, x);
        let neg = g.unary(UnaryOp::Neg, x);
        let neg = g.unary(UnaryOp::Relu, &neg);
        g.concat(&[pos, neg], -1)
    }

    /// `relu(x) + alphas * (x - |x|) / 2` over the flattened features.
    pub fn prelu(&mut self, x: &Tensor) -> Result<Tensor> {
        let (flat, features) = self.flatten_features("prelu", x)?;
        let out = self.scoped(|ops| {
            let alphas = ops.alphas("prelu", features)?;
            let g = ops.graph_mut();
            let pos = g.unary(UnaryOp::Relu, &flat);
            let abs = g.unary(UnaryOp::Abs, &flat);
            let neg = g.sub(&flat, &abs)?;
            let neg = g.mul(alphas.tensor(), &neg)?;
            let neg = g.mul_scalar(&neg, 0.5)?;
            g.add(&pos, &neg)
        })?;
        self.restore_shape(&out, x)
    }

    /// `act(x - alphas) + alphas`, with `act` from `trelu_activation`.
    pub fn trelu(&mut self, x: &Tensor) -> Result<Tensor> {
        let activation = self.config().trelu_activation;
        let (flat, features) = self.flatten_features("trelu", x)?;
        let out = self.scoped(|ops| {
            let alphas = ops.alphas("trelu", features)?;
            let shifted = ops.graph_mut().sub(&flat, alphas.tensor())?;
            let activated = activation.apply(ops, &shifted)?;
            ops.graph_mut().add(&activated, alphas.tensor())
        })?;
        self.restore_shape(&out, x)
    }

    /// `act(x) + alpha` with a single learned scalar, `act` from `frelu_activation`.
    pub fn frelu(&mut self, x: &Tensor) -> Result<Tensor> {
        let activation = self.config().frelu_activation;
        let (flat, _) = self.flatten_features("frelu", x)?;
        let out = self.scoped(|ops| {
            let alphas = ops.alphas("frelu", 1)?;
            let activated = activation.apply(ops, &flat)?;
            ops.graph_mut().add(&activated, alphas.tensor())
        })?;
        self.restore_shape(&out, x)
    }

    pub fn lrelu(&mut self, x: &Tensor) -> Tensor {
        self.graph_mut().unary(UnaryOp::LeakyRelu(LRELU_LEAK), x)
    }

    pub fn selu(&mut self, x: &Tensor) -> Tensor {
        self.graph_mut().unary(UnaryOp::Selu, x)
    }

    // Registered through `get_weight`, so reuse passes bind to the first
    // pass's alphas without registering them twice.
    fn alphas(&mut self, name: &str, features: usize) -> Result<Variable> {
        self.get_weight(&[features], Some(name), Some(Initializer::random_normal(ALPHA_STDDEV)))
    }

    /// Reshapes `x` to `[batch, features]`; every non-batch dim must be known.
    fn flatten_features(&mut self, operation: &str, x: &Tensor) -> Result<(Tensor, usize)> {
        let dims = x.shape().dims();
        let features = match dims.split_first() {
            Some((_, rest)) if !rest.is_empty() => rest.iter().copied().product::<Option<usize>>(),
            _ => None,
        }
        .ok_or_else(|| OpsError::shape_mismatch(operation, "[batch, known features...]", x.shape()))?;
        let flat = self.graph_mut().reshape(x, &[-1, features as i64])?;
        Ok((flat, features))
    }

    fn restore_shape(&mut self, out: &Tensor, original: &Tensor) -> Result<Tensor> {
        let target = original.shape().as_i64();
        self.graph_mut().reshape(out, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for name in ["tanh", "sigmoid", "relu", "crelu", "prelu", "trelu", "frelu", "selu", "lrelu", "square"] {
            assert_eq!(Activation::from_name(name).map(|a| a.name()), Some(name));
        }
        assert_eq!(Activation::from_name("swish"), None);
    }

    #[test]
    fn parametric_variants() {
        assert!(Activation::Prelu.is_parametric());
        assert!(!Activation::Selu.is_parametric());
        assert!(Activation::Crelu.widens());
        assert!(!Activation::Crelu.is_parametric());
    }
}
