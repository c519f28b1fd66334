pub mod activations;
pub mod builder;
pub mod config;
pub mod layers;
pub mod lookup;

pub use activations::Activation;
pub use builder::Ops;
pub use config::{InitializerKind, LayerRegularizer, LinearType, OpsConfig};
pub use lookup::{Callable, Distance, Normalizer, OpFn, Operand, Reduction, Registry, Resolved};
