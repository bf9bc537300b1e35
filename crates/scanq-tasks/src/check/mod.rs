//! Pluggable check modules.
//!
//! A [`CheckModule`] is one independently developed unit of work (an SQL
//! injection probe, a header audit, ...). Tasks compose modules by id; the
//! [`ModuleRegistry`] resolves those ids at submission and at execution.

pub mod demo;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::ProgressReporter;
use crate::error::ModuleError;

/// One unit of work inside a task.
///
/// Modules must not keep mutable state across invocations: the same
/// instance runs concurrently for many tasks.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::{json, Map, Value};
/// use scanq_tasks::{CheckModule, ModuleError, ProgressReporter};
///
/// struct Headers;
///
/// #[async_trait]
/// impl CheckModule for Headers {
///     fn name(&self) -> &str {
///         "headers"
///     }
///
///     async fn execute(
///         &self,
///         _params: &Map<String, Value>,
///         progress: &mut ProgressReporter,
///     ) -> Result<Value, ModuleError> {
///         progress.status("checking strict-transport-security").await;
///         Ok(json!({ "missing": [] }))
///     }
/// }
/// ```
#[async_trait]
pub trait CheckModule: Send + Sync {
    /// Registry id, also the key of this module's entry in the result map.
    fn name(&self) -> &str;

    /// Checks parameters at submission time so malformed jobs are rejected
    /// before they are queued.
    fn validate(&self, _params: &Map<String, Value>) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Runs the check.
    async fn execute(
        &self,
        params: &Map<String, Value>,
        progress: &mut ProgressReporter,
    ) -> Result<Value, ModuleError>;
}

/// Maps module ids to implementations.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn CheckModule>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` under its [`name`](CheckModule::name), replacing
    /// any previous module with that name.
    pub fn register<M: CheckModule + 'static>(&mut self, module: M) -> &mut Self {
        self.register_arc(Arc::new(module))
    }

    /// Registers an already shared module.
    pub fn register_arc(&mut self, module: Arc<dyn CheckModule>) -> &mut Self {
        let name = module.name().to_string();
        if self.modules.insert(name.clone(), module).is_some() {
            tracing::warn!(module = %name, "replacing previously registered module");
        }
        self
    }

    /// Looks up a module.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CheckModule>> {
        self.modules.get(name).cloned()
    }

    /// Returns `true` if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Registered ids, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
