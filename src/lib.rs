pub mod error;
pub mod graph;
pub mod ops;

// Convenience re-exports
pub use error::{OpsError, Result};
pub use graph::{Array, DType, Graph, Initializer, ResizeMethod, Session, Shape, Tensor, Variable};
pub use ops::{Activation, LayerRegularizer, LinearType, Operand, Ops, OpsConfig, Reduction, Resolved};
