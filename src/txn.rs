// =============================================================================
// Transaction Manager — multi-step operations with reverse-order rollback
// =============================================================================
//
// Used wherever a follow-up action touches more than one external system
// (cancel brackets, then close at market, then persist) and a mid-sequence
// failure needs to undo what already succeeded. Steps execute in order;
// on the first failure, every step that already completed is rolled back
// in reverse order, best-effort (a rollback failure is logged, not
// propagated, so one broken rollback can't block the others).
// =============================================================================

use futures_util::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;

pub struct TransactionStep {
    name: String,
    operation: Box<dyn FnOnce() -> BoxFuture<'static, Result<(), EngineError>> + Send>,
    rollback: Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>,
}

#[derive(Default)]
pub struct TransactionManager {
    steps: Vec<TransactionStep>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Queue a step. `operation` runs when `execute` reaches this step;
    /// `rollback`, if given, runs if a later step fails.
    pub fn add_step<Op, Rb>(mut self, name: impl Into<String>, operation: Op, rollback: Option<Rb>) -> Self
    where
        Op: FnOnce() -> BoxFuture<'static, Result<(), EngineError>> + Send + 'static,
        Rb: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.steps.push(TransactionStep {
            name: name.into(),
            operation: Box::new(operation),
            rollback: rollback.map(|r| Box::new(r) as Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
        });
        self
    }

    /// Run every queued step in order. On the first failure, every
    /// already-completed step's rollback runs in reverse order and the
    /// triggering error is returned.
    pub async fn execute(self) -> Result<usize, EngineError> {
        let txn_id = uuid::Uuid::new_v4();
        info!(%txn_id, steps = self.steps.len(), "starting transaction");

        let mut completed: Vec<(String, Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>)> = Vec::new();

        for step in self.steps {
            debug!(%txn_id, step = %step.name, "executing transaction step");
            match (step.operation)().await {
                Ok(()) => {
                    debug!(%txn_id, step = %step.name, "step completed");
                    completed.push((step.name, step.rollback));
                }
                Err(err) => {
                    error!(%txn_id, step = %step.name, error = %err, "transaction step failed, rolling back");
                    Self::rollback(&txn_id, completed).await;
                    return Err(err);
                }
            }
        }

        info!(%txn_id, steps_completed = completed.len(), "transaction completed successfully");
        Ok(completed.len())
    }

    async fn rollback(txn_id: &uuid::Uuid, completed: Vec<(String, Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>)>) {
        if completed.is_empty() {
            info!(%txn_id, "no steps to roll back");
            return;
        }

        info!(%txn_id, "rolling back transaction");
        for (name, rollback) in completed.into_iter().rev() {
            match rollback {
                Some(rb) => {
                    rb().await;
                    debug!(%txn_id, step = %name, "step rolled back");
                }
                None => warn!(%txn_id, step = %name, "no rollback defined for step"),
            }
        }
        info!(%txn_id, "transaction rollback complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn all_steps_succeed_runs_no_rollback() {
        let rollback_calls = Arc::new(AtomicUsize::new(0));
        let rb = rollback_calls.clone();

        let txn = TransactionManager::new().add_step(
            "step1",
            move || Box::pin(async { Ok(()) }),
            Some(move || {
                let rb = rb.clone();
                Box::pin(async move { rb.fetch_add(1, Ordering::SeqCst); }) as BoxFuture<'static, ()>
            }),
        );

        let completed = txn.execute().await.unwrap();
        assert_eq!(completed, 1);
        assert_eq!(rollback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_step_rolls_back_completed_steps_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));

        let o1 = order.clone();
        let o2 = order.clone();

        let txn = TransactionManager::new()
            .add_step(
                "step1",
                move || Box::pin(async { Ok(()) }),
                Some(move || {
                    let o1 = o1.clone();
                    Box::pin(async move { o1.lock().unwrap().push("rollback1"); }) as BoxFuture<'static, ()>
                }),
            )
            .add_step(
                "step2",
                move || Box::pin(async { Ok(()) }),
                Some(move || {
                    let o2 = o2.clone();
                    Box::pin(async move { o2.lock().unwrap().push("rollback2"); }) as BoxFuture<'static, ()>
                }),
            )
            .add_step(
                "step3_fails",
                || Box::pin(async { Err(EngineError::Validation("boom".to_string())) }),
                None::<fn() -> BoxFuture<'static, ()>>,
            );

        let result = txn.execute().await;
        assert!(result.is_err());
        assert_eq!(*order.lock().unwrap(), vec!["rollback2", "rollback1"]);
    }

    #[tokio::test]
    async fn step_with_no_rollback_is_skipped_without_panicking() {
        let txn = TransactionManager::new()
            .add_step("step1", || Box::pin(async { Ok(()) }), None::<fn() -> BoxFuture<'static, ()>>)
            .add_step(
                "step2_fails",
                || Box::pin(async { Err(EngineError::Validation("boom".to_string())) }),
                None::<fn() -> BoxFuture<'static, ()>>,
            );

        let result = txn.execute().await;
        assert!(result.is_err());
    }
}
