use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{OpsError, Result};
use crate::graph::array::Array;
use crate::graph::graph::{Graph, Op};
use crate::graph::kernels;
use crate::graph::tensor::{NodeId, Tensor, VarId, Variable};

/// Holds variable values for a graph and evaluates fetched tensors on the CPU.
pub struct Session {
    values: HashMap<VarId, Array>,
    rng: StdRng,
}

impl Session {
    pub fn new() -> Session {
        Session { values: HashMap::new(), rng: StdRng::from_entropy() }
    }

    /// Session whose initializers draw from a fixed seed.
    pub fn with_seed(seed: u64) -> Session {
        Session { values: HashMap::new(), rng: StdRng::seed_from_u64(seed) }
    }

    /// Runs the initializer of every variable in `vars` as one batch.
    pub fn initialize(&mut self, graph: &Graph, vars: &[Variable], device: &str) -> Result<()> {
        let mut fresh = Vec::with_capacity(vars.len());
        for var in vars {
            let def = graph.variables().def(var.id);
            let value = def.initializer.sample(&def.shape, def.dtype, &mut self.rng)?;
            fresh.push((var.id, value));
        }
        tracing::info!(count = fresh.len(), device, "initialized variables");
        self.values.extend(fresh);
        Ok(())
    }

    pub fn is_initialized(&self, var: &Variable) -> bool {
        self.values.contains_key(&var.id)
    }

    pub fn value(&self, var: &Variable) -> Option<&Array> {
        self.values.get(&var.id)
    }

    /// Overwrites a variable's value; the shape must match its definition.
    pub fn assign(&mut self, graph: &Graph, var: &Variable, value: Array) -> Result<()> {
        let def = graph.variables().def(var.id);
        if def.shape != value.shape {
            return Err(OpsError::shape_mismatch(
                format!("assign({})", def.name),
                format!("{:?}", def.shape),
                format!("{:?}", value.shape),
            ));
        }
        let dtype = def.dtype;
        self.values.insert(var.id, value.map(|x| dtype.round(x)));
        Ok(())
    }

    pub fn run_one(&self, graph: &Graph, fetch: &Tensor, feeds: &[(&Tensor, Array)]) -> Result<Array> {
        let mut out = self.run(graph, &[fetch], feeds)?;
        Ok(out.remove(0))
    }

    /// Evaluates `fetches`, computing only the nodes they depend on.
    pub fn run(&self, graph: &Graph, fetches: &[&Tensor], feeds: &[(&Tensor, Array)]) -> Result<Vec<Array>> {
        let mut computed: HashMap<NodeId, Array> = HashMap::new();
        for (tensor, value) in feeds {
            if !tensor.shape.accepts(&value.shape) {
                return Err(OpsError::shape_mismatch(
                    format!("feed {}", graph.node(tensor.node).name),
                    &tensor.shape,
                    format!("{:?}", value.shape),
                ));
            }
            computed.insert(tensor.node, value.clone());
        }

        let mut needed: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = fetches.iter().map(|t| t.node).collect();
        while let Some(id) = stack.pop() {
            if computed.contains_key(&id) || !needed.insert(id) {
                continue;
            }
            stack.extend(graph.node(id).inputs.iter().copied());
        }

        // Inputs always precede their consumers in the arena.
        let mut order: Vec<NodeId> = needed.into_iter().collect();
        order.sort_unstable();
        for id in order {
            let value = self.evaluate(graph, id, &computed)?;
            computed.insert(id, value);
        }

        fetches
            .iter()
            .map(|t| {
                computed
                    .get(&t.node)
                    .cloned()
                    .ok_or_else(|| OpsError::backend("run", format!("{} was not computed", t)))
            })
            .collect()
    }

    fn evaluate(&self, graph: &Graph, id: NodeId, computed: &HashMap<NodeId, Array>) -> Result<Array> {
        let node = graph.node(id);
        let inputs: Vec<&Array> = node.inputs.iter().map(|i| &computed[i]).collect();
        let value = match &node.op {
            Op::Placeholder => {
                return Err(OpsError::backend(
                    "run",
                    format!("placeholder {} must be fed a value", node.name),
                ))
            }
            Op::Constant(value) => value.clone(),
            Op::Variable(var) => self.values.get(var).cloned().ok_or_else(|| {
                OpsError::backend("run", format!("attempting to use uninitialized variable {}", node.name))
            })?,
            Op::Unary(op) => kernels::unary(*op, inputs[0]),
            Op::Binary(op) => kernels::binary(*op, inputs[0], inputs[1])?,
            Op::MatMul => kernels::matmul(inputs[0], inputs[1])?,
            Op::Conv2d { strides } => kernels::conv2d(inputs[0], inputs[1], *strides)?,
            Op::Conv2dTranspose { output_shape, strides } => {
                kernels::conv2d_transpose(inputs[0], inputs[1], *output_shape, *strides)?
            }
            Op::Reduce { kind, axes, keep_dims } => kernels::reduce(*kind, inputs[0], axes, *keep_dims),
            Op::Reshape(target) => kernels::reshape(inputs[0], target)?,
            Op::Slice { begin, size } => kernels::slice(inputs[0], begin, size)?,
            Op::Concat { axis } => kernels::concat(&inputs, *axis)?,
            Op::Squeeze { axes } => kernels::squeeze(inputs[0], axes)?,
            Op::OnesLike => Array::ones(&inputs[0].shape),
            Op::ResizeImages { height, width, method } => {
                kernels::resize_images(inputs[0], *height, *width, *method)?
            }
        };
        Ok(value.map(|x| node.dtype.round(x)))
    }

    /// Current value of every initialized variable, keyed by scoped name.
    pub fn snapshot(&self, graph: &Graph) -> BTreeMap<String, Array> {
        graph
            .variables()
            .iter()
            .filter_map(|(id, def)| self.values.get(&id).map(|v| (def.name.clone(), v.clone())))
            .collect()
    }

    /// Serializes every initialized variable to a pretty-printed JSON file.
    pub fn save_json(&self, graph: &Graph, path: &str) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.snapshot(graph))?;
        Ok(())
    }

    /// Restores variable values written by `save_json`. Every named variable
    /// must exist in `graph` with the same shape.
    pub fn load_json(&mut self, graph: &Graph, path: &str) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let saved: BTreeMap<String, Array> = serde_json::from_reader(reader)?;
        for (name, value) in saved {
            let id = graph
                .variables()
                .lookup(&name)
                .ok_or_else(|| OpsError::backend("load_json", format!("no variable named {name}")))?;
            self.assign(graph, &graph.variable(id), value)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dtype::DType;
    use crate::graph::init::Initializer;
    use crate::graph::shape::Shape;

    #[test]
    fn evaluates_fed_expression() {
        let mut g = Graph::new();
        let x = g.placeholder(DType::Float32, Shape::new(vec![None, Some(2)]));
        let y = g.mul_scalar(&x, 3.0).unwrap();
        let s = Session::with_seed(0);
        let out = s
            .run_one(&g, &y, &[(&x, Array::from_vec(&[1, 2], vec![1., 2.]).unwrap())])
            .unwrap();
        assert_eq!(out.data, vec![3., 6.]);
    }

    #[test]
    fn unfed_placeholder_is_an_error() {
        let mut g = Graph::new();
        let x = g.placeholder(DType::Float32, Shape::known(&[1]));
        let y = g.square(&x);
        assert!(Session::new().run_one(&g, &y, &[]).is_err());
    }

    #[test]
    fn feed_must_match_static_shape() {
        let mut g = Graph::new();
        let x = g.placeholder(DType::Float32, Shape::new(vec![None, Some(2)]));
        let bad = Array::zeros(&[1, 3]);
        assert!(matches!(
            Session::new().run_one(&g, &x, &[(&x, bad)]),
            Err(OpsError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn variables_need_initialization() {
        let mut g = Graph::new();
        let (v, _) = g
            .get_variable("b", &[2], DType::Float32, Initializer::constant(0.5), false, "/cpu:0")
            .unwrap();
        let mut s = Session::with_seed(1);
        assert!(s.run_one(&g, v.tensor(), &[]).is_err());
        s.initialize(&g, &[v.clone()], "/cpu:0").unwrap();
        assert_eq!(s.run_one(&g, v.tensor(), &[]).unwrap().data, vec![0.5, 0.5]);
    }
}
