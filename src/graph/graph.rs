use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};
use crate::graph::array::Array;
use crate::graph::dtype::DType;
use crate::graph::init::Initializer;
use crate::graph::shape::{Dim, Shape};
use crate::graph::tensor::{NodeId, Tensor, VarId, Variable};
use crate::graph::variable::{Resolution, VariableDef, VariableStore};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Square,
    Sqrt,
    Abs,
    Neg,
    Relu,
    Tanh,
    Sigmoid,
    Exp,
    Selu,
    LeakyRelu(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceKind {
    Sum,
    Mean,
    Min,
    Max,
    LogSumExp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    #[default]
    Bilinear,
    NearestNeighbor,
    Bicubic,
}

/// Operation recorded in a graph node. Operands live in `Node::inputs`.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Placeholder,
    Constant(Array),
    Variable(VarId),
    Unary(UnaryOp),
    Binary(BinaryOp),
    MatMul,
    /// NHWC input, HWIO filter, SAME padding. Strides are (height, width).
    Conv2d { strides: (usize, usize) },
    /// NHWC input, HWOI filter, SAME padding.
    Conv2dTranspose { output_shape: [usize; 4], strides: (usize, usize) },
    Reduce { kind: ReduceKind, axes: Vec<usize>, keep_dims: bool },
    /// Target dims; at most one -1, resolved from the element count at run time.
    Reshape(Vec<i64>),
    Slice { begin: Vec<usize>, size: Vec<i64> },
    Concat { axis: usize },
    Squeeze { axes: Vec<usize> },
    OnesLike,
    ResizeImages { height: usize, width: usize, method: ResizeMethod },
}

/// Graph size at some point of construction; see `Graph::rollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    nodes: usize,
    variables: usize,
}

/// One recorded operation.
///
/// Fields:
/// - `name`: scoped label, `<scope>/<op>_<id>`, or the variable's name
/// - `op`: what to compute
/// - `inputs`: operand nodes, all with smaller ids
/// - `shape`: static shape inferred when the node was added
/// - `dtype`: precision the output is rounded to
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub shape: Shape,
    pub dtype: DType,
}

/// Symbolic computation graph.
///
/// Every builder method infers the static shape of its output and rejects
/// contradictions immediately; values only exist once a `Session` runs it.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    variables: VariableStore,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Panics if `id` belongs to another graph or was rolled back.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    /// Handle for a variable already in the store.
    pub fn variable(&self, id: VarId) -> Variable {
        let def = self.variables.def(id);
        Variable {
            id,
            name: def.name.clone(),
            tensor: self.tensor(def.node),
        }
    }

    fn tensor(&self, id: NodeId) -> Tensor {
        let node = &self.nodes[id.0];
        Tensor { node: id, shape: node.shape.clone(), dtype: node.dtype }
    }

    fn push(&mut self, label: &str, op: Op, inputs: Vec<NodeId>, shape: Shape, dtype: DType) -> Tensor {
        let id = NodeId(self.nodes.len());
        let name = self.variables.full_name(&format!("{label}_{}", id.0));
        self.nodes.push(Node { name, op, inputs, shape: shape.clone(), dtype });
        Tensor { node: id, shape, dtype }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint { nodes: self.nodes.len(), variables: self.variables.len() }
    }

    /// Drops every node and variable added since `checkpoint`.
    ///
    /// Handles created after the checkpoint become dangling, so this is only
    /// meant for abandoning a construction step that failed part way.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.nodes.truncate(checkpoint.nodes);
        self.variables.truncate(checkpoint.variables);
    }

    // -----------------------------------------------------------------------
    // Scopes and variables
    // -----------------------------------------------------------------------

    /// Opens a variable scope. A reusing scope stays reusing for everything
    /// nested inside it.
    pub fn push_scope(&mut self, name: &str, reuse: bool) {
        self.variables.push_scope(name, reuse);
    }

    pub fn pop_scope(&mut self) {
        self.variables.pop_scope();
    }

    pub fn current_scope(&self) -> String {
        self.variables.current_scope()
    }

    /// Creates `name` under the current scope, or binds to the existing
    /// variable when `reuse` is set or the scope is reusing.
    ///
    /// Returns the handle and whether it was newly created.
    pub fn get_variable(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        initializer: Initializer,
        reuse: bool,
        device: &str,
    ) -> Result<(Variable, bool)> {
        let full_name = self.variables.full_name(name);
        match self.variables.resolve(&full_name, shape, dtype, reuse)? {
            Resolution::Existing(id) => Ok((self.variable(id), false)),
            Resolution::Create => {
                let node = NodeId(self.nodes.len());
                let id = self.variables.insert(VariableDef {
                    name: full_name.clone(),
                    shape: shape.to_vec(),
                    dtype,
                    initializer,
                    device: device.to_string(),
                    node,
                });
                self.nodes.push(Node {
                    name: full_name.clone(),
                    op: Op::Variable(id),
                    inputs: vec![],
                    shape: Shape::known(shape),
                    dtype,
                });
                Ok((Variable { id, name: full_name, tensor: self.tensor(node) }, true))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    /// Input fed at run time. Unknown dims accept any size.
    pub fn placeholder(&mut self, dtype: DType, shape: Shape) -> Tensor {
        self.push("placeholder", Op::Placeholder, vec![], shape, dtype)
    }

    /// Embeds `value`, rounded to `dtype`.
    pub fn constant(&mut self, value: Array, dtype: DType) -> Tensor {
        let shape = Shape::known(&value.shape);
        let value = value.map(|x| dtype.round(x));
        self.push("const", Op::Constant(value), vec![], shape, dtype)
    }

    pub fn scalar(&mut self, value: f32, dtype: DType) -> Tensor {
        self.constant(Array::scalar(value), dtype)
    }

    pub fn ones_like(&mut self, x: &Tensor) -> Tensor {
        self.push("ones_like", Op::OnesLike, vec![x.node], x.shape.clone(), x.dtype)
    }

    // -----------------------------------------------------------------------
    // Elementwise
    // -----------------------------------------------------------------------

    pub fn unary(&mut self, op: UnaryOp, x: &Tensor) -> Tensor {
        self.push("unary", Op::Unary(op), vec![x.node], x.shape.clone(), x.dtype)
    }

    /// Elementwise `op` with numpy-style broadcasting. An unknown dim
    /// broadcasts against anything and stays unknown unless the other side
    /// pins it.
    pub fn binary(&mut self, op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let label = format!("{op:?}").to_lowercase();
        check_dtype(&label, a, b)?;
        let shape = a.shape.broadcast(&b.shape, &label)?;
        Ok(self.push(&label, Op::Binary(op), vec![a.node, b.node], shape, a.dtype))
    }

    pub fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn maximum(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(BinaryOp::Maximum, a, b)
    }

    pub fn add_scalar(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        let c = self.scalar(value, x.dtype);
        self.add(x, &c)
    }

    pub fn mul_scalar(&mut self, x: &Tensor, value: f32) -> Result<Tensor> {
        let c = self.scalar(value, x.dtype);
        self.mul(x, &c)
    }

    pub fn square(&mut self, x: &Tensor) -> Tensor {
        self.unary(UnaryOp::Square, x)
    }

    pub fn sqrt(&mut self, x: &Tensor) -> Tensor {
        self.unary(UnaryOp::Sqrt, x)
    }

    /// Sum of one or more tensors.
    pub fn add_n(&mut self, inputs: &[Tensor]) -> Result<Tensor> {
        let (first, rest) = inputs
            .split_first()
            .ok_or_else(|| OpsError::backend("add_n", "needs at least one input"))?;
        let mut sum = first.clone();
        for t in rest {
            if t.shape.rank() != first.shape.rank() {
                return Err(OpsError::shape_mismatch("add_n", &first.shape, &t.shape));
            }
            sum = self.add(&sum, t)?;
        }
        Ok(sum)
    }

    // -----------------------------------------------------------------------
    // Linear algebra and convolution
    // -----------------------------------------------------------------------

    pub fn matmul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        check_dtype("matmul", a, b)?;
        if a.shape.rank() != 2 || b.shape.rank() != 2 {
            return Err(OpsError::shape_mismatch(
                "matmul",
                "two rank-2 operands",
                format!("{} x {}", a.shape, b.shape),
            ));
        }
        check_dim("matmul", a.shape.dim(1), b.shape.dim(0))?;
        let shape = Shape::new(vec![a.shape.dim(0), b.shape.dim(1)]);
        Ok(self.push("matmul", Op::MatMul, vec![a.node, b.node], shape, a.dtype))
    }

    pub fn conv2d(&mut self, x: &Tensor, filter: &Tensor, strides: (usize, usize)) -> Result<Tensor> {
        check_dtype("conv2d", x, filter)?;
        let f = conv_filter("conv2d", x, filter)?;
        check_dim("conv2d", x.shape.dim(3), Some(f[2]))?;
        check_strides("conv2d", strides)?;
        let shape = Shape::new(vec![
            x.shape.dim(0),
            x.shape.dim(1).map(|h| h.div_ceil(strides.0)),
            x.shape.dim(2).map(|w| w.div_ceil(strides.1)),
            Some(f[3]),
        ]);
        Ok(self.push("conv2d", Op::Conv2d { strides }, vec![x.node, filter.node], shape, x.dtype))
    }

    /// Transposed convolution. `filter` is [h, w, out_channels, in_channels].
    pub fn conv2d_transpose(
        &mut self,
        x: &Tensor,
        filter: &Tensor,
        output_shape: [usize; 4],
        strides: (usize, usize),
    ) -> Result<Tensor> {
        check_dtype("conv2d_transpose", x, filter)?;
        let f = conv_filter("conv2d_transpose", x, filter)?;
        check_strides("conv2d_transpose", strides)?;
        check_dim("conv2d_transpose", x.shape.dim(3), Some(f[3]))?;
        check_dim("conv2d_transpose", Some(output_shape[3]), Some(f[2]))?;
        check_dim("conv2d_transpose", x.shape.dim(0), Some(output_shape[0]))?;
        check_dim("conv2d_transpose", x.shape.dim(1), Some(output_shape[1].div_ceil(strides.0)))?;
        check_dim("conv2d_transpose", x.shape.dim(2), Some(output_shape[2].div_ceil(strides.1)))?;
        Ok(self.push(
            "conv2d_transpose",
            Op::Conv2dTranspose { output_shape, strides },
            vec![x.node, filter.node],
            Shape::known(&output_shape),
            x.dtype,
        ))
    }

    // -----------------------------------------------------------------------
    // Reductions
    // -----------------------------------------------------------------------

    /// Reduces over `axes`, or over every axis when `axes` is `None`.
    /// Negative axes count from the end.
    pub fn reduce(
        &mut self,
        kind: ReduceKind,
        x: &Tensor,
        axes: Option<&[isize]>,
        keep_dims: bool,
    ) -> Result<Tensor> {
        let label = format!("reduce_{kind:?}").to_lowercase();
        let mut resolved = match axes {
            Some(axes) => axes
                .iter()
                .map(|&a| x.shape.axis(a, &label))
                .collect::<Result<Vec<_>>>()?,
            None => (0..x.shape.rank()).collect(),
        };
        resolved.sort_unstable();
        resolved.dedup();

        let dims = x
            .shape
            .dims()
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| match (resolved.contains(&i), keep_dims) {
                (true, true) => Some(Some(1)),
                (true, false) => None,
                (false, _) => Some(d),
            })
            .collect();
        Ok(self.push(
            &label,
            Op::Reduce { kind, axes: resolved, keep_dims },
            vec![x.node],
            Shape::new(dims),
            x.dtype,
        ))
    }

    /// Mean and variance over `axes`, without kept dimensions.
    pub fn moments(&mut self, x: &Tensor, axes: &[isize]) -> Result<(Tensor, Tensor)> {
        let mean_kept = self.reduce(ReduceKind::Mean, x, Some(axes), true)?;
        let centered = self.sub(x, &mean_kept)?;
        let squared = self.square(&centered);
        let variance = self.reduce(ReduceKind::Mean, &squared, Some(axes), false)?;
        let mean = self.reduce(ReduceKind::Mean, x, Some(axes), false)?;
        Ok((mean, variance))
    }

    /// `x / sqrt(max(sum(x², axes), 1e-12))`.
    pub fn l2_normalize(&mut self, x: &Tensor, axes: &[isize]) -> Result<Tensor> {
        let squared = self.square(x);
        let sum = self.reduce(ReduceKind::Sum, &squared, Some(axes), true)?;
        let floor = self.scalar(1e-12, x.dtype);
        let clipped = self.maximum(&sum, &floor)?;
        let norm = self.sqrt(&clipped);
        self.div(x, &norm)
    }

    // -----------------------------------------------------------------------
    // Shape manipulation
    // -----------------------------------------------------------------------

    pub fn reshape(&mut self, x: &Tensor, target: &[i64]) -> Result<Tensor> {
        if target.iter().filter(|&&d| d == -1).count() > 1 || target.iter().any(|&d| d < -1) {
            return Err(OpsError::shape_mismatch("reshape", "at most one -1 and no other negatives", format!("{target:?}")));
        }
        let known_product: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
        let inferred = match x.shape.num_elements() {
            Some(n) => {
                let fits = if target.contains(&-1) {
                    known_product != 0 && n % known_product == 0
                } else {
                    n == known_product
                };
                if !fits {
                    return Err(OpsError::shape_mismatch(
                        "reshape",
                        format!("a shape holding {n} elements"),
                        format!("{target:?}"),
                    ));
                }
                Some(if known_product == 0 { 0 } else { n / known_product })
            }
            None => None,
        };
        let dims: Vec<Dim> = target
            .iter()
            .map(|&d| if d == -1 { inferred } else { Some(d as usize) })
            .collect();
        Ok(self.push("reshape", Op::Reshape(target.to_vec()), vec![x.node], Shape::new(dims), x.dtype))
    }

    /// `size[i] == -1` takes everything from `begin[i]` to the end of axis `i`.
    pub fn slice(&mut self, x: &Tensor, begin: &[usize], size: &[i64]) -> Result<Tensor> {
        if begin.len() != x.shape.rank() || size.len() != x.shape.rank() {
            return Err(OpsError::shape_mismatch(
                "slice",
                format!("begin and size of rank {}", x.shape.rank()),
                format!("{begin:?} / {size:?}"),
            ));
        }
        let mut dims = Vec::with_capacity(begin.len());
        for (axis, (&b, &s)) in begin.iter().zip(size).enumerate() {
            let d = x.shape.dim(axis);
            let out = if s < 0 { d.map(|n| n.saturating_sub(b)) } else { Some(s as usize) };
            if let (Some(n), Some(o)) = (d, out) {
                if b + o > n {
                    return Err(OpsError::shape_mismatch(
                        "slice",
                        format!("begin + size <= {n} on axis {axis}"),
                        b + o,
                    ));
                }
            }
            dims.push(out);
        }
        Ok(self.push(
            "slice",
            Op::Slice { begin: begin.to_vec(), size: size.to_vec() },
            vec![x.node],
            Shape::new(dims),
            x.dtype,
        ))
    }

    pub fn concat(&mut self, values: &[Tensor], axis: isize) -> Result<Tensor> {
        let first = values
            .first()
            .ok_or_else(|| OpsError::backend("concat", "needs at least one input"))?;
        let axis = first.shape.axis(axis, "concat")?;
        let mut dims = first.shape.dims().to_vec();
        for t in &values[1..] {
            check_dtype("concat", first, t)?;
            if t.shape.rank() != first.shape.rank() {
                return Err(OpsError::shape_mismatch("concat", &first.shape, &t.shape));
            }
            for (i, d) in dims.iter_mut().enumerate() {
                let other = t.shape.dim(i);
                if i == axis {
                    *d = d.zip(other).map(|(a, b)| a + b);
                } else {
                    check_dim("concat", *d, other)?;
                    *d = d.or(other);
                }
            }
        }
        let inputs = values.iter().map(|t| t.node).collect();
        Ok(self.push("concat", Op::Concat { axis }, inputs, Shape::new(dims), first.dtype))
    }

    /// Drops every axis whose static size is 1.
    pub fn squeeze(&mut self, x: &Tensor) -> Tensor {
        let axes: Vec<usize> = x
            .shape
            .dims()
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == Some(1))
            .map(|(i, _)| i)
            .collect();
        let dims = x.shape.dims().iter().copied().filter(|&d| d != Some(1)).collect();
        self.push("squeeze", Op::Squeeze { axes }, vec![x.node], Shape::new(dims), x.dtype)
    }

    pub fn resize_images(
        &mut self,
        x: &Tensor,
        height: usize,
        width: usize,
        method: ResizeMethod,
    ) -> Result<Tensor> {
        if x.shape.rank() != 4 {
            return Err(OpsError::shape_mismatch("resize_images", "rank 4 NHWC", &x.shape));
        }
        let shape = Shape::new(vec![x.shape.dim(0), Some(height), Some(width), x.shape.dim(3)]);
        Ok(self.push(
            "resize_images",
            Op::ResizeImages { height, width, method },
            vec![x.node],
            shape,
            x.dtype,
        ))
    }
}

fn check_dtype(operation: &str, a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dtype != b.dtype {
        return Err(OpsError::backend(
            operation,
            format!("dtype mismatch: {} vs {}", a.dtype, b.dtype),
        ));
    }
    Ok(())
}

fn check_dim(operation: &str, a: Dim, b: Dim) -> Result<()> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(OpsError::shape_mismatch(operation, x, y)),
        _ => Ok(()),
    }
}

fn check_strides(operation: &str, strides: (usize, usize)) -> Result<()> {
    if strides.0 == 0 || strides.1 == 0 {
        return Err(OpsError::backend(operation, "strides must be positive"));
    }
    Ok(())
}

fn conv_filter(operation: &str, x: &Tensor, filter: &Tensor) -> Result<Vec<usize>> {
    if x.shape.rank() != 4 {
        return Err(OpsError::shape_mismatch(operation, "rank 4 NHWC input", &x.shape));
    }
    match filter.shape.to_concrete() {
        Some(f) if f.len() == 4 => Ok(f),
        _ => Err(OpsError::shape_mismatch(operation, "fully known rank 4 filter", &filter.shape)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(g: &mut Graph, dims: Vec<Dim>) -> Tensor {
        g.placeholder(DType::Float32, Shape::new(dims))
    }

    #[test]
    fn conv2d_infers_same_padding_shape() {
        let mut g = Graph::new();
        let x = batch(&mut g, vec![None, Some(7), Some(8), Some(3)]);
        let w = g.constant(Array::zeros(&[3, 3, 3, 5]), DType::Float32);
        let y = g.conv2d(&x, &w, (2, 2)).unwrap();
        assert_eq!(y.shape(), &Shape::new(vec![None, Some(4), Some(4), Some(5)]));
    }

    #[test]
    fn conv2d_rejects_channel_mismatch() {
        let mut g = Graph::new();
        let x = batch(&mut g, vec![Some(1), Some(4), Some(4), Some(2)]);
        let w = g.constant(Array::zeros(&[3, 3, 3, 5]), DType::Float32);
        assert!(matches!(g.conv2d(&x, &w, (1, 1)), Err(OpsError::ShapeMismatch { .. })));
    }

    #[test]
    fn reduce_drops_or_keeps_axes() {
        let mut g = Graph::new();
        let x = batch(&mut g, vec![None, Some(3), Some(4)]);
        let kept = g.reduce(ReduceKind::Sum, &x, Some(&[-1]), true).unwrap();
        let dropped = g.reduce(ReduceKind::Sum, &x, Some(&[0, 1]), false).unwrap();
        assert_eq!(kept.shape(), &Shape::new(vec![None, Some(3), Some(1)]));
        assert_eq!(dropped.shape(), &Shape::known(&[4]));
    }

    #[test]
    fn reshape_infers_minus_one() {
        let mut g = Graph::new();
        let x = batch(&mut g, vec![Some(2), Some(3), Some(4)]);
        let y = g.reshape(&x, &[2, -1]).unwrap();
        assert_eq!(y.shape(), &Shape::known(&[2, 12]));
        assert!(g.reshape(&x, &[5, -1]).is_err());
    }

    #[test]
    fn concat_sums_axis() {
        let mut g = Graph::new();
        let a = batch(&mut g, vec![None, Some(2)]);
        let b = batch(&mut g, vec![Some(3), Some(5)]);
        let c = g.concat(&[a, b], -1).unwrap();
        assert_eq!(c.shape(), &Shape::known(&[3, 7]));
    }

    #[test]
    fn variables_are_scoped() {
        let mut g = Graph::new();
        g.push_scope("d_1", false);
        let (w, created) = g
            .get_variable("w", &[2, 2], DType::Float32, Initializer::constant(0.0), false, "/cpu:0")
            .unwrap();
        g.pop_scope();
        assert!(created);
        assert_eq!(w.name(), "d_1/w");
    }

    #[test]
    fn rollback_forgets_nodes_and_variables() {
        let mut g = Graph::new();
        let x = batch(&mut g, vec![Some(1), Some(2)]);
        let mark = g.checkpoint();
        g.push_scope("d_1", false);
        g.get_variable("w", &[2, 2], DType::Float32, Initializer::constant(0.0), false, "/cpu:0")
            .unwrap();
        g.pop_scope();
        g.square(&x);
        g.rollback(mark);
        assert_eq!(g.checkpoint(), mark);
        assert!(g.variables().lookup("d_1/w").is_none());

        g.push_scope("d_1", false);
        let (_, created) = g
            .get_variable("w", &[3], DType::Float32, Initializer::constant(0.0), false, "/cpu:0")
            .unwrap();
        assert!(created);
    }
}
