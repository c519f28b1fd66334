use std::fmt;

use crate::graph::dtype::DType;
use crate::graph::shape::Shape;

/// Index of a node in its `Graph`. Ids grow in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

/// Handle to a node's output in a `Graph`. Holds no values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub(crate) node: NodeId,
    pub(crate) shape: Shape,
    pub(crate) dtype: DType,
}

impl Tensor {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Static shape, possibly with unknown dimensions.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(node={}, shape={}, dtype={})", self.node.0, self.shape, self.dtype)
    }
}

/// A named trainable parameter owned by the graph's variable store.
///
/// Cloning the handle never copies the parameter's value.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub(crate) id: VarId,
    pub(crate) name: String,
    pub(crate) tensor: Tensor,
}

impl Variable {
    pub fn id(&self) -> VarId {
        self.id
    }

    /// Fully scoped name, e.g. `generator_3/w`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> &Shape {
        &self.tensor.shape
    }
}

impl AsRef<Tensor> for Variable {
    fn as_ref(&self) -> &Tensor {
        &self.tensor
    }
}

impl AsRef<Tensor> for Tensor {
    fn as_ref(&self) -> &Tensor {
        self
    }
}
