use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, read-only key/value mapping handed to every task body.
///
/// The engine never looks inside it. It is cheap to clone and is serialised
/// as-is when a unit of work crosses the process boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap(Arc<BTreeMap<String, Value>>);

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Follow a path of object keys, e.g. `["tasks", "splitter", "params"]`.
    pub fn pointer(&self, keys: &[&str]) -> Option<&Value> {
        let (first, rest) = keys.split_first()?;
        rest.iter()
            .try_fold(self.0.get(*first)?, |value, key| value.get(*key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for ConfigMap {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        ConfigMap(Arc::new(iter.into_iter().collect()))
    }
}

impl From<BTreeMap<String, Value>> for ConfigMap {
    fn from(value: BTreeMap<String, Value>) -> Self {
        ConfigMap(Arc::new(value))
    }
}

impl TryFrom<Value> for ConfigMap {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}
