use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{OpsError, Result};
use crate::graph::{ReduceKind, Tensor, UnaryOp, Variable};
use crate::ops::activations::Activation;
use crate::ops::builder::Ops;
use crate::ops::config::LayerRegularizer;

/// Argument handed to a resolved callable. Configuration values can end up
/// here too, which is why `Ops::assert_tensor` exists.
#[derive(Debug, Clone)]
pub enum Operand {
    Tensor(Tensor),
    Variable(Variable),
    Value(Value),
}

impl From<Tensor> for Operand {
    fn from(t: Tensor) -> Self {
        Operand::Tensor(t)
    }
}

impl From<Variable> for Operand {
    fn from(v: Variable) -> Self {
        Operand::Variable(v)
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

/// Collapses a tensor, either over every axis or through a one-unit dense
/// projection (`reduce_linear`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Mean,
    Min,
    Sum,
    LogSumExp,
    Linear,
}

impl Reduction {
    pub fn apply(&self, ops: &mut Ops, net: &Tensor) -> Result<Tensor> {
        let kind = match self {
            Reduction::Mean => ReduceKind::Mean,
            Reduction::Min => ReduceKind::Min,
            Reduction::Sum => ReduceKind::Sum,
            Reduction::LogSumExp => ReduceKind::LogSumExp,
            Reduction::Linear => return ops.linear(net, 1),
        };
        ops.graph_mut().reduce(kind, net, None, false)
    }
}

impl Ops {
    /// Reduction that projects `net` to a single output feature.
    pub fn reduce_linear(&self) -> Reduction {
        Reduction::Linear
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    L1,
    L2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    BatchNorm,
    LayerNorm,
}

pub type OpFn = Arc<dyn Fn(&mut Ops, &[Operand]) -> Result<Tensor> + Send + Sync>;

/// A registry entry resolved from a `function:` or `class:` path.
#[derive(Clone)]
pub struct Callable {
    pub path: String,
    func: OpFn,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("path", &self.path).finish()
    }
}

/// Explicit table of the paths `function:` / `class:` symbols may name.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, OpFn>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registry holding this crate's own operators under `ferrite_ops.*`.
    pub fn with_builtins() -> Registry {
        let mut registry = Registry::new();
        for name in ["tanh", "sigmoid", "relu", "crelu", "prelu", "trelu", "frelu", "selu", "lrelu", "square"] {
            if let Some(activation) = Activation::from_name(name) {
                registry.register(
                    &format!("ferrite_ops.activations.{name}"),
                    Arc::new(move |ops: &mut Ops, args: &[Operand]| {
                        let x = single_tensor(ops, args)?;
                        activation.apply(ops, &x)
                    }),
                );
            }
        }
        registry.register(
            "ferrite_ops.layers.batch_norm",
            Arc::new(|ops: &mut Ops, args: &[Operand]| {
                let x = single_tensor(ops, args)?;
                ops.batch_norm(&x)
            }),
        );
        registry.register(
            "ferrite_ops.layers.layer_norm",
            Arc::new(|ops: &mut Ops, args: &[Operand]| {
                let x = single_tensor(ops, args)?;
                ops.layer_norm(&x)
            }),
        );
        registry.register(
            "ferrite_ops.math.abs",
            Arc::new(|ops: &mut Ops, args: &[Operand]| {
                let x = single_tensor(ops, args)?;
                Ok(ops.graph_mut().unary(UnaryOp::Abs, &x))
            }),
        );
        registry
    }

    pub fn register(&mut self, path: &str, func: OpFn) {
        self.entries.insert(path.to_string(), func);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Result<Callable> {
        self.entries
            .get(path)
            .map(|func| Callable { path: path.to_string(), func: Arc::clone(func) })
            .ok_or_else(|| OpsError::UnresolvedSymbol(path.to_string()))
    }
}

/// Result of `Ops::lookup`.
#[derive(Debug, Clone)]
pub enum Resolved {
    None,
    List(Vec<Resolved>),
    Map(BTreeMap<String, Resolved>),
    Activation(Activation),
    Reduction(Reduction),
    Distance(Distance),
    Normalizer(Normalizer),
    Regularizer(LayerRegularizer),
    Function(Callable),
    /// A string outside the vocabulary, passed through untouched.
    Text(String),
    /// A non-string, non-container value, passed through untouched.
    Literal(Value),
}

impl Resolved {
    /// Invokes a callable resolution on `args`.
    pub fn apply(&self, ops: &mut Ops, args: &[Operand]) -> Result<Tensor> {
        match self {
            Resolved::Activation(a) => {
                let x = single_tensor(ops, args)?;
                a.apply(ops, &x)
            }
            Resolved::Reduction(r) => {
                let x = single_tensor(ops, args)?;
                r.apply(ops, &x)
            }
            Resolved::Normalizer(n) => {
                let x = single_tensor(ops, args)?;
                match n {
                    Normalizer::BatchNorm => ops.batch_norm(&x),
                    Normalizer::LayerNorm => ops.layer_norm(&x),
                }
            }
            Resolved::Distance(d) => {
                let [a, b] = args else {
                    return Err(OpsError::backend("distance", format!("expects 2 operands, got {}", args.len())));
                };
                let (a, b) = (ops.assert_tensor(a)?, ops.assert_tensor(b)?);
                match d {
                    Distance::L1 => ops.l1_distance(&a, &b),
                    Distance::L2 => ops.l2_distance(&a, &b),
                }
            }
            Resolved::Function(c) => (c.func)(ops, args),
            other => Err(OpsError::Configuration(format!("{other:?} is not callable"))),
        }
    }
}

fn single_tensor(ops: &Ops, args: &[Operand]) -> Result<Tensor> {
    match args {
        [x] => ops.assert_tensor(x),
        _ => Err(OpsError::backend("apply", format!("expects 1 operand, got {}", args.len()))),
    }
}

impl Ops {
    /// Resolves configuration symbols to operators.
    ///
    /// Lists and maps resolve element by element, keeping map keys.
    /// `function:` / `class:` paths go through the registry, and a missing
    /// path is an error. Names in the fixed vocabulary map to their
    /// operators. Every other string or scalar passes through unchanged.
    pub fn lookup(&self, symbol: &Value) -> Result<Resolved> {
        match symbol {
            Value::Null => Ok(Resolved::None),
            Value::Array(items) => items
                .iter()
                .map(|s| self.lookup(s))
                .collect::<Result<Vec<_>>>()
                .map(Resolved::List),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| -> Result<(String, Resolved)> { Ok((k.clone(), self.lookup(v)?)) })
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Resolved::Map),
            Value::String(s) => self.lookup_str(s),
            other => Ok(Resolved::Literal(other.clone())),
        }
    }

    pub fn lookup_str(&self, symbol: &str) -> Result<Resolved> {
        if let Some(path) = symbol.strip_prefix("function:").or_else(|| symbol.strip_prefix("class:")) {
            return self.registry().get(path).map(Resolved::Function);
        }
        if let Some(activation) = Activation::from_name(symbol) {
            return Ok(Resolved::Activation(activation));
        }
        let resolved = match symbol {
            "reduce_mean" => Resolved::Reduction(Reduction::Mean),
            "reduce_min" => Resolved::Reduction(Reduction::Min),
            "reduce_sum" => Resolved::Reduction(Reduction::Sum),
            "reduce_logsumexp" => Resolved::Reduction(Reduction::LogSumExp),
            "reduce_linear" => Resolved::Reduction(self.reduce_linear()),
            "l1_distance" => Resolved::Distance(Distance::L1),
            "l2_distance" => Resolved::Distance(Distance::L2),
            "batch_norm" => Resolved::Normalizer(Normalizer::BatchNorm),
            "layer_norm" => Resolved::Normalizer(Normalizer::LayerNorm),
            "cosine_norm" => Resolved::Regularizer(LayerRegularizer::CosineNorm),
            other => Resolved::Text(other.to_string()),
        };
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::config::OpsConfig;
    use serde_json::json;

    fn ops() -> Ops {
        Ops::new(OpsConfig::default()).unwrap()
    }

    #[test]
    fn vocabulary_resolves() {
        let ops = ops();
        assert!(matches!(ops.lookup_str("lrelu"), Ok(Resolved::Activation(Activation::Lrelu))));
        assert!(matches!(ops.lookup_str("reduce_logsumexp"), Ok(Resolved::Reduction(Reduction::LogSumExp))));
        assert!(matches!(ops.lookup_str("reduce_linear"), Ok(Resolved::Reduction(Reduction::Linear))));
        assert!(matches!(ops.lookup_str("l2_distance"), Ok(Resolved::Distance(Distance::L2))));
        assert!(matches!(
            ops.lookup_str("cosine_norm"),
            Ok(Resolved::Regularizer(LayerRegularizer::CosineNorm))
        ));
    }

    #[test]
    fn function_paths_use_registry() {
        let ops = ops();
        assert!(matches!(
            ops.lookup_str("function:ferrite_ops.activations.relu"),
            Ok(Resolved::Function(_))
        ));
        assert!(matches!(
            ops.lookup_str("class:ferrite_ops.layers.layer_norm"),
            Ok(Resolved::Function(_))
        ));
        assert_eq!(
            ops.lookup_str("function:numpy.missing").unwrap_err(),
            OpsError::UnresolvedSymbol("numpy.missing".to_string())
        );
    }

    #[test]
    fn null_and_literals_pass_through() {
        let ops = ops();
        assert!(matches!(ops.lookup(&Value::Null), Ok(Resolved::None)));
        assert!(matches!(ops.lookup(&json!(0.5)), Ok(Resolved::Literal(v)) if v == json!(0.5)));
    }

    #[test]
    fn non_callables_refuse_apply() {
        let mut ops = ops();
        let x = ops.placeholder(vec![Some(1), Some(2)]);
        let text = ops.lookup_str("adam").unwrap();
        assert!(matches!(text.apply(&mut ops, &[x.into()]), Err(OpsError::Configuration(_))));
    }
}
