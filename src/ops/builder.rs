use crate::error::{OpsError, Result};
use crate::graph::{DType, Graph, Initializer, ResizeMethod, Session, Shape, Tensor, Variable};
use crate::ops::config::OpsConfig;
use crate::ops::lookup::{Operand, Reduction, Registry};

/// Builds neural-network layers into an owned `Graph` and keeps track of the
/// trainable parameters they create.
///
/// Every layer call opens a fresh variable scope named by `generate_name()`.
/// Between `reuse()` and `stop_reuse()` the same sequence of calls produces
/// the same sequence of scope names, so each parameter request binds to the
/// variable created by the matching call of the first pass.
pub struct Ops {
    pub(crate) graph: Graph,
    config: OpsConfig,
    initializer: Initializer,
    description: String,
    scope_count: usize,
    reuse_scope_count: usize,
    reuse: bool,
    weights: Vec<Variable>,
    biases: Vec<Variable>,
    initialized: bool,
    registry: Registry,
    /// Weight-norm layers whose gain and bias still wait for a first batch.
    pub(crate) weight_norm_inits: Vec<WeightNormInit>,
}

/// A weight-norm layer's provisional output `conv(net, V_norm)` together
/// with the gain and bias that `Ops::data_dependent_init` derives from it.
#[derive(Debug, Clone)]
pub(crate) struct WeightNormInit {
    pub(crate) provisional: Tensor,
    pub(crate) gain: Variable,
    pub(crate) bias: Variable,
}

impl Ops {
    pub fn new(config: OpsConfig) -> Result<Ops> {
        config.validate()?;
        let initializer = config.weight_initializer();
        Ok(Ops {
            graph: Graph::new(),
            config,
            initializer,
            description: String::new(),
            scope_count: 0,
            reuse_scope_count: 0,
            reuse: false,
            weights: Vec::new(),
            biases: Vec::new(),
            initialized: false,
            registry: Registry::with_builtins(),
            weight_norm_inits: Vec::new(),
        })
    }

    /// Builder with a dtype given by name, e.g. `"float16"`.
    pub fn with_dtype(dtype: &str) -> Result<Ops> {
        let config = OpsConfig { dtype: DType::parse(dtype)?, ..OpsConfig::default() };
        Ops::new(config)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The graph every layer is built into.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn config(&self) -> &OpsConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.config.dtype
    }

    pub fn device(&self) -> &str {
        &self.config.device
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Weights registered so far, in creation order. Reuse passes add none.
    pub fn weights(&self) -> &[Variable] {
        &self.weights
    }

    pub fn biases(&self) -> &[Variable] {
        &self.biases
    }

    /// Every registered parameter: biases first, then weights.
    pub fn variables(&self) -> Vec<Variable> {
        self.biases.iter().chain(&self.weights).cloned().collect()
    }

    pub fn is_reusing(&self) -> bool {
        self.reuse
    }

    /// True once `initialize_variables` has run with at least one parameter.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Table consulted for `function:` and `class:` symbols; register custom
    /// operators here before calling `lookup`.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    // -----------------------------------------------------------------------
    // Scope naming and reuse
    // -----------------------------------------------------------------------

    /// Prefix for generated scope names, e.g. `"generator"`.
    pub fn describe(&mut self, description: &str) {
        self.description = description.to_string();
    }

    /// Enters reuse mode and restarts the reuse counter.
    pub fn reuse(&mut self) {
        self.reuse = true;
        self.reuse_scope_count = 0;
    }

    pub fn stop_reuse(&mut self) {
        self.reuse = false;
    }

    /// Next value of the active counter: `reuse_scope_count` in reuse mode,
    /// `scope_count` otherwise.
    pub fn generate_scope(&mut self) -> String {
        if self.reuse {
            self.reuse_scope_count += 1;
            return self.reuse_scope_count.to_string();
        }
        self.scope_count += 1;
        self.scope_count.to_string()
    }

    pub fn generate_name(&mut self) -> String {
        if self.description.is_empty() {
            return self.generate_scope();
        }
        let scope = self.generate_scope();
        format!("{}_{}", self.description, scope)
    }

    /// Runs `build` inside a freshly named variable scope.
    ///
    /// When `build` fails, everything it added is discarded: graph nodes,
    /// variables, registered weights and biases, and pending weight-norm
    /// inits. The scope counter is not rewound.
    pub(crate) fn scoped<T>(&mut self, build: impl FnOnce(&mut Ops) -> Result<T>) -> Result<T> {
        let name = self.generate_name();
        tracing::trace!(scope = %name, reuse = self.reuse, "entering scope");
        let checkpoint = self.graph.checkpoint();
        let registered = (self.weights.len(), self.biases.len(), self.weight_norm_inits.len());
        self.graph.push_scope(&name, self.reuse);
        let out = build(self);
        self.graph.pop_scope();
        if let Err(e) = &out {
            tracing::debug!(scope = %name, error = %e, "layer construction failed, rolling back");
            self.graph.rollback(checkpoint);
            self.weights.truncate(registered.0);
            self.biases.truncate(registered.1);
            self.weight_norm_inits.truncate(registered.2);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    /// Requests a weight under the current scope; `name` defaults to `"w"` and
    /// `initializer` to the configured default.
    pub fn get_weight(
        &mut self,
        shape: &[usize],
        name: Option<&str>,
        initializer: Option<Initializer>,
    ) -> Result<Variable> {
        let initializer = initializer.unwrap_or_else(|| self.initializer.clone());
        let weight = self.acquire(name.unwrap_or("w"), shape, initializer)?;
        if !self.reuse {
            self.weights.push(weight.clone());
        }
        Ok(weight)
    }

    /// Requests a constant-filled bias; `name` defaults to `"b"`.
    pub fn get_bias(&mut self, shape: &[usize], constant: f32, name: Option<&str>) -> Result<Variable> {
        let bias = self.acquire(name.unwrap_or("b"), shape, Initializer::constant(constant))?;
        if !self.reuse {
            self.biases.push(bias.clone());
        }
        Ok(bias)
    }

    fn acquire(&mut self, name: &str, shape: &[usize], initializer: Initializer) -> Result<Variable> {
        let dtype = self.config.dtype;
        let (variable, _) = self
            .graph
            .get_variable(name, shape, dtype, initializer, self.reuse, &self.config.device)?;
        Ok(variable)
    }

    /// Registers parameters created outside `get_weight`.
    pub fn add_weights(&mut self, weights: &[Variable]) {
        self.weights.extend_from_slice(weights);
    }

    // -----------------------------------------------------------------------
    // Tensors
    // -----------------------------------------------------------------------

    /// Graph input of the builder's dtype. `None` dims are fed at run time.
    pub fn placeholder(&mut self, dims: Vec<Option<usize>>) -> Tensor {
        let dtype = self.config.dtype;
        self.graph.placeholder(dtype, Shape::new(dims))
    }

    pub fn assert_tensor(&self, operand: &Operand) -> Result<Tensor> {
        match operand {
            Operand::Tensor(t) => Ok(t.clone()),
            Operand::Variable(v) => Ok(v.tensor().clone()),
            Operand::Value(v) => Err(OpsError::NotATensor(v.to_string())),
        }
    }

    pub fn reshape(&mut self, net: &Tensor, shape: &[i64]) -> Result<Tensor> {
        self.graph.reshape(net, shape)
    }

    pub fn concat(&mut self, values: &[Tensor], axis: isize) -> Result<Tensor> {
        self.graph.concat(values, axis)
    }

    pub fn resize_images(&mut self, net: &Tensor, dims: (usize, usize), method: ResizeMethod) -> Result<Tensor> {
        self.graph.resize_images(net, dims.0, dims.1, method)
    }

    pub fn slice(&mut self, net: &Tensor, begin: &[usize], size: &[i64]) -> Result<Tensor> {
        self.graph.slice(net, begin, size)
    }

    /// Static shape with unknown dimensions reported as -1.
    pub fn shape(&self, net: &Tensor) -> Vec<i64> {
        net.shape().as_i64()
    }

    pub fn add_n(&mut self, nets: &[Tensor]) -> Result<Tensor> {
        self.graph.add_n(nets)
    }

    /// Reduces `net` to a scalar by applying `reduce` and squeezing until no
    /// dimensions are left.
    pub fn squash(&mut self, net: &Tensor, reduce: Reduction) -> Result<Tensor> {
        let mut net = net.clone();
        while net.shape().rank() > 0 {
            if net.shape().num_elements() == Some(1) {
                return Ok(self.graph.squeeze(&net));
            }
            let reduced = reduce.apply(self, &net)?;
            let next = self.graph.squeeze(&reduced);
            if next.shape() == net.shape() {
                return Err(OpsError::backend(
                    "squash",
                    format!("{reduce:?} does not shrink a tensor of shape {}", net.shape()),
                ));
            }
            net = next;
        }
        Ok(net)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Session seeded from the configured `seed`, if any.
    pub fn new_session(&self) -> Session {
        match self.config.seed {
            Some(seed) => Session::with_seed(seed),
            None => Session::new(),
        }
    }

    /// Runs the initializers of every registered parameter in one batch.
    /// Does nothing when no parameters have been registered.
    pub fn initialize_variables(&mut self, session: &mut Session) -> Result<()> {
        let variables = self.variables();
        if variables.is_empty() {
            return Ok(());
        }
        session.initialize(&self.graph, &variables, &self.config.device)?;
        self.initialized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> Ops {
        Ops::new(OpsConfig::default()).unwrap()
    }

    #[test]
    fn names_count_up_with_description() {
        let mut ops = ops();
        assert_eq!(ops.generate_name(), "1");
        ops.describe("generator");
        assert_eq!(ops.generate_name(), "generator_2");
    }

    #[test]
    fn reuse_counter_is_independent() {
        let mut ops = ops();
        ops.generate_name();
        ops.generate_name();
        ops.reuse();
        assert_eq!(ops.generate_name(), "1");
        ops.stop_reuse();
        assert_eq!(ops.generate_name(), "3");
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        assert!(matches!(Ops::with_dtype("int32"), Err(OpsError::Configuration(_))));
        assert_eq!(Ops::with_dtype("float16").unwrap().dtype(), DType::Float16);
    }

    #[test]
    fn assert_tensor_rejects_values() {
        let mut ops = ops();
        let x = ops.placeholder(vec![Some(1)]);
        assert!(ops.assert_tensor(&Operand::from(x)).is_ok());
        assert!(matches!(
            ops.assert_tensor(&Operand::Value(serde_json::json!(3))),
            Err(OpsError::NotATensor(_))
        ));
    }

    #[test]
    fn squash_reduces_to_scalar() {
        let mut ops = ops();
        let x = ops.placeholder(vec![None, Some(3), Some(2)]);
        let s = ops.squash(&x, Reduction::Mean).unwrap();
        assert_eq!(s.shape().rank(), 0);
    }

    #[test]
    fn initialize_without_parameters_is_noop() {
        let mut ops = ops();
        let mut session = ops.new_session();
        ops.initialize_variables(&mut session).unwrap();
        assert!(!ops.is_initialized());
    }
}
