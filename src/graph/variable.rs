use std::collections::HashMap;

use crate::error::{OpsError, Result};
use crate::graph::dtype::DType;
use crate::graph::init::Initializer;
use crate::graph::tensor::{NodeId, VarId};

/// Everything the store knows about one variable.
///
/// Fields:
/// - `name`: fully scoped name, unique within the store
/// - `shape`: always fully known; variables never have dynamic dims
/// - `dtype`: precision the session stores the value at
/// - `initializer`: run by `Session::initialize`
/// - `device`: placement hint recorded at creation, informational on
///   the CPU session
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDef {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub initializer: Initializer,
    pub device: String,
    pub(crate) node: NodeId,
}

#[derive(Debug, Clone)]
struct Scope {
    name: String,
    reuse: bool,
}

/// What `VariableStore::resolve` decided for a requested name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Existing(VarId),
    Create,
}

/// Named, scoped variable registry with create-vs-reuse semantics.
///
/// Names are the `/`-joined scope stack followed by the local name. A scope
/// opened with `reuse` makes every request inside it (nested scopes included)
/// bind to an existing variable; otherwise a request must create a new one.
#[derive(Debug, Default)]
pub struct VariableStore {
    defs: Vec<VariableDef>,
    by_name: HashMap<String, VarId>,
    scopes: Vec<Scope>,
}

impl VariableStore {
    pub fn new() -> VariableStore {
        VariableStore::default()
    }

    pub fn push_scope(&mut self, name: &str, reuse: bool) {
        let inherited = self.scopes.last().map_or(false, |s| s.reuse);
        self.scopes.push(Scope { name: name.to_string(), reuse: reuse || inherited });
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn current_scope(&self) -> String {
        self.scopes.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join("/")
    }

    pub fn reusing(&self) -> bool {
        self.scopes.last().map_or(false, |s| s.reuse)
    }

    pub fn full_name(&self, name: &str) -> String {
        let scope = self.current_scope();
        if scope.is_empty() { name.to_string() } else { format!("{scope}/{name}") }
    }

    /// Decides whether `full_name` binds to an existing variable or needs a
    /// new one. `reuse` forces binding even outside a reusing scope.
    pub(crate) fn resolve(&self, full_name: &str, shape: &[usize], dtype: DType, reuse: bool) -> Result<Resolution> {
        let reuse = reuse || self.reusing();
        match self.by_name.get(full_name) {
            Some(&id) => {
                if !reuse {
                    return Err(OpsError::backend(
                        "get_variable",
                        format!("variable {full_name} already exists, disallowed outside a reuse scope"),
                    ));
                }
                let def = &self.defs[id.0];
                if def.shape != shape || def.dtype != dtype {
                    return Err(OpsError::shape_mismatch(
                        format!("get_variable({full_name})"),
                        format!("{:?} {}", def.shape, def.dtype),
                        format!("{shape:?} {dtype}"),
                    ));
                }
                Ok(Resolution::Existing(id))
            }
            None if reuse => Err(OpsError::backend(
                "get_variable",
                format!("variable {full_name} does not exist, cannot reuse it"),
            )),
            None => Ok(Resolution::Create),
        }
    }

    pub(crate) fn insert(&mut self, def: VariableDef) -> VarId {
        let id = VarId(self.defs.len());
        self.by_name.insert(def.name.clone(), id);
        self.defs.push(def);
        id
    }

    pub fn def(&self, id: VarId) -> &VariableDef {
        &self.defs[id.0]
    }

    pub fn lookup(&self, full_name: &str) -> Option<VarId> {
        self.by_name.get(full_name).copied()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &VariableDef)> {
        self.defs.iter().enumerate().map(|(i, d)| (VarId(i), d))
    }

    /// Forgets every variable created after the first `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        for def in self.defs.drain(len.min(self.defs.len())..) {
            self.by_name.remove(&def.name);
        }
    }
}
