//! Demonstration modules used by the server binary and the tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::CheckModule;
use crate::context::ProgressReporter;
use crate::error::ModuleError;

/// Largest accepted `sleep_seconds`.
pub const MAX_SLEEP_SECONDS: u64 = 30;

const DEFAULT_SLEEP_SECONDS: u64 = 5;

/// Returns its parameters unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoModule;

#[async_trait]
impl CheckModule for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        _progress: &mut ProgressReporter,
    ) -> Result<Value, ModuleError> {
        Ok(Value::Object(params.clone()))
    }
}

/// Multiplies `x` by `y`, pausing one tick per requested second and
/// reporting each tick as a sub-step.
///
/// Parameters: `x` and `y` (integers, required) and `sleep_seconds`
/// (`0..=30`, default 5).
#[derive(Debug, Clone, Copy)]
pub struct MultiplyModule {
    tick: Duration,
}

impl Default for MultiplyModule {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

impl MultiplyModule {
    /// Uses `tick` instead of one second per step.
    pub fn with_tick(tick: Duration) -> Self {
        Self { tick }
    }
}

struct MultiplyParams {
    x: i64,
    y: i64,
    sleep_seconds: u64,
}

fn parse_params(params: &Map<String, Value>) -> Result<MultiplyParams, ModuleError> {
    let int = |key: &str| -> Result<i64, ModuleError> {
        params
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| ModuleError::InvalidParams(format!("`{key}` must be an integer")))
    };
    let sleep_seconds = match params.get("sleep_seconds") {
        None => DEFAULT_SLEEP_SECONDS,
        Some(v) => v
            .as_u64()
            .filter(|s| *s <= MAX_SLEEP_SECONDS)
            .ok_or_else(|| {
                ModuleError::InvalidParams(format!(
                    "`sleep_seconds` must be an integer between 0 and {MAX_SLEEP_SECONDS}"
                ))
            })?,
    };
    Ok(MultiplyParams {
        x: int("x")?,
        y: int("y")?,
        sleep_seconds,
    })
}

#[async_trait]
impl CheckModule for MultiplyModule {
    fn name(&self) -> &str {
        "multiply"
    }

    fn validate(&self, params: &Map<String, Value>) -> Result<(), ModuleError> {
        parse_params(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        progress: &mut ProgressReporter,
    ) -> Result<Value, ModuleError> {
        let MultiplyParams {
            x,
            y,
            sleep_seconds,
        } = parse_params(params)?;

        for i in 1..=sleep_seconds {
            if progress.is_cancelled() {
                return Err(ModuleError::Failed("cancelled".to_string()));
            }
            tokio::time::sleep(self.tick).await;
            progress
                .status(format!("Processing... ({i}/{sleep_seconds} seconds)"))
                .await;
        }

        let result = x
            .checked_mul(y)
            .ok_or_else(|| ModuleError::Failed(format!("{x} * {y} overflows")))?;
        Ok(json!({
            "x": x,
            "y": y,
            "result": result,
            "message": format!("Successfully multiplied {x} * {y} = {result}"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::store::memory::InMemoryTaskStore;
    use crate::store::TaskStore;
    use crate::types::module::{ModuleSpec, TaskEnvelope};

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn reporter(cancel: CancellationToken) -> (Arc<InMemoryTaskStore>, ProgressReporter) {
        let store = Arc::new(InMemoryTaskStore::default());
        let env = TaskEnvelope::new(vec![ModuleSpec::new("multiply")]);
        store.create(&env).await.unwrap();
        store.claim(&env.task_id, "w", 1).await.unwrap();
        let reporter = ProgressReporter::new(
            store.clone(),
            env.task_id.clone(),
            1,
            "multiply",
            1,
            1,
            cancel,
        );
        (store, reporter)
    }

    #[test]
    fn validate_rejects_missing_and_out_of_range() {
        let m = MultiplyModule::default();
        assert!(m.validate(&obj(json!({ "x": 2, "y": 3 }))).is_ok());
        assert!(m.validate(&obj(json!({ "x": 2 }))).is_err());
        assert!(m.validate(&obj(json!({ "x": "2", "y": 3 }))).is_err());
        assert!(m
            .validate(&obj(json!({ "x": 2, "y": 3, "sleep_seconds": 31 })))
            .is_err());
        assert!(m
            .validate(&obj(json!({ "x": 2, "y": 3, "sleep_seconds": -1 })))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn multiply_reports_each_tick() {
        let (store, mut progress) = reporter(CancellationToken::new()).await;
        let out = MultiplyModule::default()
            .execute(
                &obj(json!({ "x": 6, "y": 7, "sleep_seconds": 2 })),
                &mut progress,
            )
            .await
            .unwrap();
        assert_eq!(out["result"], json!(42));

        let record = store.get(progress.task_id()).await.unwrap();
        assert_eq!(
            record.status_text.as_deref(),
            Some("Processing... (2/2 seconds)")
        );
    }

    #[tokio::test]
    async fn multiply_overflow_is_a_module_error() {
        let (_store, mut progress) = reporter(CancellationToken::new()).await;
        let err = MultiplyModule::default()
            .execute(
                &obj(json!({ "x": i64::MAX, "y": 2, "sleep_seconds": 0 })),
                &mut progress,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Failed(_)));
    }

    #[tokio::test]
    async fn multiply_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let (_store, mut progress) = reporter(token).await;
        let err = MultiplyModule::with_tick(Duration::from_millis(1))
            .execute(
                &obj(json!({ "x": 1, "y": 1, "sleep_seconds": 3 })),
                &mut progress,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ModuleError::Failed("cancelled".to_string()));
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let (_store, mut progress) = reporter(CancellationToken::new()).await;
        let params = obj(json!({ "target": "https://example.test" }));
        let out = EchoModule.execute(&params, &mut progress).await.unwrap();
        assert_eq!(out, json!({ "target": "https://example.test" }));
    }
}
