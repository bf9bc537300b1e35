//! Submission-side types: module specs and the immutable task envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::task::TaskId;

fn default_weight() -> f64 {
    1.0
}

/// One check module to run, with its parameters and progress weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Identifier of a module registered in the
    /// [`ModuleRegistry`](crate::ModuleRegistry).
    pub module: String,

    /// Module-specific parameters. Each module decodes and validates these.
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Relative share of the task's progress bar. Must be positive.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl ModuleSpec {
    /// Creates a spec with no parameters and weight `1.0`.
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            params: Map::new(),
            weight: default_weight(),
        }
    }

    /// Sets the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Adds one parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Immutable description of one submitted job as it travels through the
/// queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Id assigned at submission.
    pub task_id: TaskId,
    /// Modules to run, in order.
    pub modules: Vec<ModuleSpec>,
    /// When the job was accepted.
    pub submitted_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wraps `modules` under a freshly generated id.
    pub fn new(modules: Vec<ModuleSpec>) -> Self {
        Self {
            task_id: TaskId::generate(),
            modules,
            submitted_at: Utc::now(),
        }
    }

    /// Weights of every module, in order.
    pub fn weights(&self) -> Vec<f64> {
        self.modules.iter().map(|m| m.weight).collect()
    }

    /// Module identifiers, in order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.module.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weight_defaults_to_one() {
        let spec: ModuleSpec = serde_json::from_value(json!({ "module": "sqli" })).unwrap();
        assert_eq!(spec.weight, 1.0);
        assert!(spec.params.is_empty());
    }

    #[test]
    fn builder_sets_params_and_weight() {
        let spec = ModuleSpec::new("headers")
            .with_weight(2.0)
            .with_param("url", "https://example.test");
        assert_eq!(spec.weight, 2.0);
        assert_eq!(spec.params["url"], json!("https://example.test"));
    }

    #[test]
    fn envelope_exposes_weights_in_order() {
        let env = TaskEnvelope::new(vec![
            ModuleSpec::new("a"),
            ModuleSpec::new("b").with_weight(3.0),
        ]);
        assert_eq!(env.weights(), vec![1.0, 3.0]);
        assert_eq!(env.module_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
