//! Waiting on batches of asynchronous platform tasks.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ReapError, Result, aggregate};
use crate::inventory::{Inventory, TaskRef};

/// An issued mutation that has not been awaited yet.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub task: TaskRef,
    /// Display name of the object the task acts on.
    pub target: String,
    /// Failures of this task are logged and dropped.
    pub ignore_errors: bool,
}

impl PendingTask {
    pub fn new(task: TaskRef, target: impl Into<String>) -> Self {
        Self {
            task,
            target: target.into(),
            ignore_errors: false,
        }
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }
}

/// Await every task in order.
///
/// All tasks are awaited even after a failure. Failures of tasks that do
/// not ignore errors come back as one aggregate. Cancellation aborts the
/// wait immediately; tasks already running on the platform keep running.
pub async fn wait_for_tasks(
    inventory: &dyn Inventory,
    tasks: Vec<PendingTask>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut errors = Vec::new();

    for pending in tasks {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReapError::Cancelled),
            outcome = inventory.wait_task(&pending.task) => outcome,
        };

        match outcome {
            Ok(()) => debug!(task = %pending.task, target = %pending.target, "Task finished"),
            Err(e) if pending.ignore_errors => {
                info!(task = %pending.task, target = %pending.target, error = %e, "Ignoring error for task");
            }
            Err(e) => errors.push(ReapError::TaskFailed {
                task: pending.task.id.clone(),
                target: pending.target,
                message: e.to_string(),
            }),
        }
    }

    aggregate(errors)
}
