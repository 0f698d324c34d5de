use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    adapters::{DeepScanEngine, DeepScanSession},
    error::{Result, ScanError},
    inventory::Inventory,
    models::{ScanTask, TaskStatus},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub advanced: usize,
    pub completed: usize,
    pub errored: usize,
    pub rolled_back: usize,
}

enum Step {
    Unchanged,
    Advanced,
    Completed,
}

/// Drives every open deep-scan task towards a terminal state using what the
/// engine reports. Only this type moves tasks between states.
#[derive(Clone)]
pub struct Poller {
    inventory: Inventory,
    engine: Arc<dyn DeepScanEngine>,
}

impl Poller {
    pub fn new(inventory: Inventory, engine: Arc<dyn DeepScanEngine>) -> Self {
        Self { inventory, engine }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let tasks = self.inventory.open_scan_tasks().await?;
        let mut report = ReconcileReport::default();
        if tasks.is_empty() {
            return Ok(report);
        }

        let session = self.engine.connect().await?;

        for task in &tasks {
            report.checked += 1;
            match self.reconcile_task(session.as_ref(), task).await {
                Ok(Step::Unchanged) => {}
                Ok(Step::Advanced) => report.advanced += 1,
                Ok(Step::Completed) => report.completed += 1,
                Err(ScanError::Protocol { reason, .. }) => {
                    warn!(task_id = %task.task_id, reason = %reason, "status query failed, marking task errored");
                    match self
                        .inventory
                        .update_task_status(&task.task_id, TaskStatus::Error)
                        .await
                    {
                        Ok(_) => report.errored += 1,
                        Err(e) => {
                            report.rolled_back += 1;
                            error!(error = %e, task_id = %task.task_id, "could not record task error");
                        }
                    }
                }
                Err(e) => {
                    report.rolled_back += 1;
                    error!(error = %e, task_id = %task.task_id, "task reconciliation rolled back");
                }
            }
        }

        info!(
            checked = report.checked,
            advanced = report.advanced,
            completed = report.completed,
            errored = report.errored,
            rolled_back = report.rolled_back,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_task(&self, session: &dyn DeepScanSession, task: &ScanTask) -> Result<Step> {
        let progress = session.get_task(&task.task_id).await?;
        let next = task.status.advance(progress.status);
        if next == task.status {
            return Ok(Step::Unchanged);
        }

        if next == TaskStatus::Done {
            let report_id = progress.report_id.ok_or_else(|| {
                ScanError::protocol("gvm", format!("task {} is done without a report", task.task_id))
            })?;
            // Fetch failures leave the task open so the report is retried.
            let results = session.get_report(&report_id).await.map_err(|e| match e {
                ScanError::Protocol { tool, reason } => {
                    ScanError::unavailable(tool, format!("report {report_id}: {reason}"))
                }
                other => other,
            })?;
            let summary = self.inventory.complete_task(task, &report_id, &results).await?;
            info!(
                task_id = %task.task_id,
                report_id = %report_id,
                raw = summary.raw_inserted,
                unified = summary.unified_inserted,
                skipped = summary.informational_skipped,
                "deep scan report ingested"
            );
            return Ok(Step::Completed);
        }

        self.inventory.update_task_status(&task.task_id, next).await?;
        info!(task_id = %task.task_id, from = %task.status, to = %next, "task advanced");
        Ok(Step::Advanced)
    }
}
