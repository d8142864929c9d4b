//! Arguments of a task call.
//!
//! A call mixes literal values with [`PendingResult`]s produced by earlier
//! calls. Handles may also be nested inside lists, which is how a task can
//! consume the outputs of a whole fan-out.

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;

use crate::handle::PendingResult;

/// A single argument to a task call.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// A plain value known while the pipeline is being defined.
    Literal(Value),
    /// The future output of another invocation.
    Pending(PendingResult),
    /// A list which may itself contain handles.
    List(Vec<Arg>),
}

impl Arg {
    /// Visit every handle contained in this argument, including nested ones.
    pub(crate) fn for_each_handle<'a>(&'a self, f: &mut impl FnMut(&'a PendingResult)) {
        match self {
            Arg::Literal(_) => {}
            Arg::Pending(handle) => f(handle),
            Arg::List(items) => items.iter().for_each(|item| item.for_each_handle(f)),
        }
    }

    /// Replace every handle with the value produced by its owner.
    ///
    /// `lookup` returns `None` when the producer has no result, which can only
    /// happen if the scheduler dispatched a node too early.
    pub(crate) fn resolve(
        &self,
        lookup: &impl Fn(&PendingResult) -> Option<Value>,
    ) -> Option<Value> {
        match self {
            Arg::Literal(value) => Some(value.clone()),
            Arg::Pending(handle) => lookup(handle),
            Arg::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Canonical form used to derive invocation ids. Handles are reduced to
    /// the name of the producing task, the producer's identity is left out.
    pub(crate) fn fingerprint(&self) -> Value {
        match self {
            Arg::Literal(value) => value.clone(),
            Arg::Pending(handle) => serde_json::json!({ "$pending": handle.task() }),
            Arg::List(items) => Value::Array(items.iter().map(Arg::fingerprint).collect()),
        }
    }
}

impl From<PendingResult> for Arg {
    fn from(value: PendingResult) -> Self {
        Arg::Pending(value)
    }
}

impl From<&PendingResult> for Arg {
    fn from(value: &PendingResult) -> Self {
        Arg::Pending(value.clone())
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Literal(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<&Utf8Path> for Arg {
    fn from(value: &Utf8Path) -> Self {
        Arg::Literal(Value::from(value.as_str()))
    }
}

impl From<Utf8PathBuf> for Arg {
    fn from(value: Utf8PathBuf) -> Self {
        Arg::Literal(Value::from(value.into_string()))
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<usize> for Arg {
    fn from(value: usize) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Literal(Value::from(value))
    }
}

impl<T: Into<Arg>> From<Vec<T>> for Arg {
    fn from(value: Vec<T>) -> Self {
        Arg::List(value.into_iter().map(Into::into).collect())
    }
}

/// Positional and keyword arguments of one task call.
///
/// ```rust
/// use pipewright::Args;
///
/// let args = Args::new().arg("input.txt").kwarg("num_splits", 4);
/// assert_eq!(args.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub(crate) positional: Vec<Arg>,
    pub(crate) keyword: Vec<(String, Arg)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Arg>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.keyword.push((name.into(), value.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
