pub mod array;
pub mod dtype;
pub mod graph;
pub mod init;
pub mod kernels;
pub mod session;
pub mod shape;
pub mod tensor;
pub mod variable;

pub use array::Array;
pub use dtype::DType;
pub use graph::{BinaryOp, Checkpoint, Graph, Op, ReduceKind, ResizeMethod, UnaryOp};
pub use init::Initializer;
pub use session::Session;
pub use shape::{Dim, Shape};
pub use tensor::{NodeId, Tensor, VarId, Variable};
pub use variable::{VariableDef, VariableStore};
