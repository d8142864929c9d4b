//! Task definitions and the registry that owns them.
//!
//! A task is an opaque callable with a name and a declared [`Signature`].
//! Registering it yields a [`TaskHandle`]; calling the handle inside an open
//! [`GraphBuilder`] records an invocation and returns a [`PendingResult`]
//! without running anything.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::args::{Arg, Args};
use crate::config::ConfigMap;
use crate::error::GraphConstructionError;
use crate::graph::GraphBuilder;
use crate::handle::{NodeId, PendingResult};

/// Result of a task body.
pub type TaskResult<T = Value> = anyhow::Result<T>;

/// Type-erased task body.
pub(crate) type TaskFnPtr = Arc<dyn Fn(&TaskContext) -> TaskResult + Send + Sync>;

/// One declared parameter of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }
}

/// Ordered parameter list of a task.
///
/// Positional arguments fill parameters in declaration order, keyword
/// arguments fill them by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a signature made only of required parameters.
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: names.into_iter().map(Param::required).collect(),
        }
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param::required(name));
        self
    }

    pub fn param_or(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.params.push(Param::optional(name, default));
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    fn validate(&self, task: &str) -> Result<(), GraphConstructionError> {
        for (i, param) in self.params.iter().enumerate() {
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return Err(GraphConstructionError::DuplicateParameter {
                    task: task.to_string(),
                    param: param.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Bind call arguments to parameters, in declaration order.
    pub(crate) fn bind(
        &self,
        task: &str,
        args: Args,
    ) -> Result<Vec<(String, Arg)>, GraphConstructionError> {
        let Args {
            positional,
            keyword,
        } = args;

        if positional.len() > self.params.len() {
            return Err(GraphConstructionError::TooManyArguments {
                task: task.to_string(),
                expected: self.params.len(),
                given: positional.len(),
            });
        }

        let mut slots: Vec<Option<Arg>> = vec![None; self.params.len()];
        for (slot, arg) in slots.iter_mut().zip(positional) {
            *slot = Some(arg);
        }

        for (name, arg) in keyword {
            let Some(i) = self.params.iter().position(|p| p.name == name) else {
                return Err(GraphConstructionError::UnknownParameter {
                    task: task.to_string(),
                    param: name,
                });
            };
            if slots[i].is_some() {
                return Err(GraphConstructionError::DuplicateArgument {
                    task: task.to_string(),
                    param: name,
                });
            }
            slots[i] = Some(arg);
        }

        self.params
            .iter()
            .zip(slots)
            .map(|(param, slot)| match (slot, &param.default) {
                (Some(arg), _) => Ok((param.name.clone(), arg)),
                (None, Some(default)) => Ok((param.name.clone(), Arg::Literal(default.clone()))),
                (None, None) => Err(GraphConstructionError::MissingArgument {
                    task: task.to_string(),
                    param: param.name.clone(),
                }),
            })
            .collect()
    }
}

/// Concrete inputs of a task once all handles are resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inputs(Vec<(String, Value)>);

impl Inputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Inputs {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Inputs(iter.into_iter().collect())
    }
}

/// Everything a task body can see while it runs.
///
/// Bodies only get their own inputs, their own workspace and the
/// configuration mapping. They never see graph state.
pub struct TaskContext<'a> {
    pub(crate) node: &'a NodeId,
    pub(crate) inputs: &'a Inputs,
    pub(crate) workspace: &'a Utf8Path,
    pub(crate) config: &'a ConfigMap,
}

impl<'a> TaskContext<'a> {
    pub fn node(&self) -> &NodeId {
        self.node
    }

    pub fn task(&self) -> &str {
        self.node.task()
    }

    /// Absolute path of the private working directory of this invocation.
    pub fn workspace(&self) -> &Utf8Path {
        self.workspace
    }

    pub fn config(&self) -> &ConfigMap {
        self.config
    }

    pub fn inputs(&self) -> &Inputs {
        self.inputs
    }

    /// Raw input value bound to `name`.
    pub fn input(&self, name: &str) -> anyhow::Result<&Value> {
        self.inputs
            .get(name)
            .with_context(|| format!("task '{}' has no input '{name}'", self.task()))
    }

    /// Input bound to `name`, deserialised into `T`.
    pub fn input_as<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.input(name)?.clone();
        serde_json::from_value(value)
            .with_context(|| format!("input '{name}' of task '{}' has the wrong shape", self.task()))
    }

    /// Input bound to `name`, read as a filesystem path.
    pub fn path(&self, name: &str) -> anyhow::Result<&Utf8Path> {
        self.input(name)?
            .as_str()
            .map(Utf8Path::new)
            .with_context(|| format!("input '{name}' of task '{}' is not a path", self.task()))
    }
}

/// Identity of a [`Registry`], used to reject tasks from another registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RegistryId(u64);

impl RegistryId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RegistryId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An immutable, registered task.
pub struct TaskDef {
    pub(crate) name: Arc<str>,
    pub(crate) signature: Signature,
    pub(crate) func: TaskFnPtr,
}

impl TaskDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Run the body directly in the calling thread.
    pub(crate) fn call(&self, context: &TaskContext) -> TaskResult {
        (self.func)(context)
    }
}

impl Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskDef({})", self.name)
    }
}

/// A callable wrapper around a registered task.
///
/// Calling it records an invocation in a graph and returns a handle, it never
/// runs the body.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub(crate) registry: RegistryId,
    pub(crate) def: Arc<TaskDef>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn signature(&self) -> &Signature {
        self.def.signature()
    }

    /// Record a call of this task in `builder`.
    pub fn call(
        &self,
        builder: &mut GraphBuilder,
        args: Args,
    ) -> Result<PendingResult, GraphConstructionError> {
        builder.call(self, args)
    }
}

/// Owner of all task definitions of a process.
///
/// The same registry must be available in worker processes, so that a task
/// name arriving in a unit of work can be mapped back to its body. In
/// practice this means building it with one function used both by the
/// pipeline code and by [`worker::enter`](crate::worker::enter).
#[derive(Debug)]
pub struct Registry {
    pub(crate) id: RegistryId,
    tasks: BTreeMap<Arc<str>, Arc<TaskDef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            id: RegistryId::next(),
            tasks: BTreeMap::new(),
        }
    }

    /// Register a task body under `name` with the given parameters.
    pub fn register<F>(
        &mut self,
        name: &str,
        signature: Signature,
        func: F,
    ) -> Result<TaskHandle, GraphConstructionError>
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        if !is_valid_task_name(name) {
            return Err(GraphConstructionError::InvalidTaskName(name.to_string()));
        }
        if self.tasks.contains_key(name) {
            return Err(GraphConstructionError::DuplicateTask(name.to_string()));
        }
        signature.validate(name)?;

        let name: Arc<str> = name.into();
        let def = Arc::new(TaskDef {
            name: name.clone(),
            signature,
            func: Arc::new(func),
        });

        tracing::debug!(task = %name, "registered task");
        self.tasks.insert(name, def.clone());

        Ok(TaskHandle {
            registry: self.id,
            def,
        })
    }

    /// Handle of an already registered task.
    pub fn get(&self, name: &str) -> Option<TaskHandle> {
        self.tasks.get(name).map(|def| TaskHandle {
            registry: self.id,
            def: def.clone(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|name| &**name)
    }

    /// Open a new graph-build context bound to this registry.
    pub fn pipeline(&self) -> GraphBuilder {
        GraphBuilder::new(self.id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
