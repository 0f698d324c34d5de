use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    adapters::{DeepScanEngine, DiscoveryScanner, TriageScanner},
    error::{Result, ScanError},
    inventory::Inventory,
    models::HostSnapshot,
};

pub mod escalation;

pub use escalation::should_escalate;

/// Counters of one discovery cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub hosts_seen: usize,
    pub hosts_triaged: usize,
    pub escalations: usize,
    pub failures: usize,
}

/// Result of triaging one target.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TriageOutcome {
    pub findings: usize,
    pub new_findings: usize,
    /// Deep-scan task dispatched because of the triage result.
    pub task_id: Option<String>,
}

/// Discovery, triage and escalation over the inventory. Each host is its own
/// unit of work; a failing host never stops the cycle.
#[derive(Clone)]
pub struct Funnel {
    inventory: Inventory,
    discovery: Arc<dyn DiscoveryScanner>,
    triage: Arc<dyn TriageScanner>,
    engine: Arc<dyn DeepScanEngine>,
    mark_missing_hosts_down: bool,
}

impl Funnel {
    pub fn new(
        inventory: Inventory,
        discovery: Arc<dyn DiscoveryScanner>,
        triage: Arc<dyn TriageScanner>,
        engine: Arc<dyn DeepScanEngine>,
    ) -> Self {
        Self {
            inventory,
            discovery,
            triage,
            engine,
            mark_missing_hosts_down: false,
        }
    }

    pub fn mark_missing_hosts_down(mut self, enabled: bool) -> Self {
        self.mark_missing_hosts_down = enabled;
        self
    }

    /// One full cycle over `range`. A failed sweep ends the cycle with the
    /// error; the next scheduled cycle is the retry.
    pub async fn run_cycle(&self, range: &str) -> Result<CycleReport> {
        let hosts = match self.discovery.discover(range).await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!(error = %e, range, stage = self.discovery.name(), "discovery failed, skipping cycle");
                return Err(e);
            }
        };

        let mut report = CycleReport {
            hosts_seen: hosts.len(),
            ..CycleReport::default()
        };

        for snapshot in &hosts {
            match self.process_host(snapshot).await {
                Ok(outcome) => {
                    if let Some(outcome) = outcome {
                        report.hosts_triaged += 1;
                        if outcome.task_id.is_some() {
                            report.escalations += 1;
                        }
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    error!(error = %e, host = %snapshot.ip, "host processing failed");
                }
            }
        }

        let seen: Vec<String> = hosts.iter().map(|h| h.ip.clone()).collect();
        self.inventory.set_online_hosts(&seen).await?;
        if self.mark_missing_hosts_down {
            let marked = self.inventory.mark_unseen_hosts_down(&seen).await?;
            if marked > 0 {
                info!(marked, "hosts not seen this cycle marked down");
            }
        }

        info!(
            hosts_seen = report.hosts_seen,
            hosts_triaged = report.hosts_triaged,
            escalations = report.escalations,
            failures = report.failures,
            "funnel cycle finished"
        );
        Ok(report)
    }

    /// Records the host and, when it exposes any port, triages it. `None`
    /// means triage was skipped.
    async fn process_host(&self, snapshot: &HostSnapshot) -> Result<Option<TriageOutcome>> {
        self.inventory.record_host(snapshot).await?;

        if snapshot.open_ports.is_empty() {
            info!(host = %snapshot.ip, "no open ports, skipping triage");
            return Ok(None);
        }

        self.triage_target(&snapshot.ip).await.map(Some)
    }

    /// Triage plus escalation for one target; also the manual-run path.
    pub async fn triage_target(&self, target: &str) -> Result<TriageOutcome> {
        let findings = self.triage.triage(target).await;
        let new_findings = self
            .inventory
            .record_triage_findings(target, &findings)
            .await?;

        let mut outcome = TriageOutcome {
            findings: findings.len(),
            new_findings,
            task_id: None,
        };
        if !should_escalate(&findings) {
            return Ok(outcome);
        }

        info!(host = target, "triage found high severity issues, escalating");
        match self.dispatch_deep_scan(target).await {
            Ok(task_id) => outcome.task_id = Some(task_id),
            Err(e) if e.disables_stage() || matches!(e, ScanError::AdapterUnavailable { .. }) => {
                warn!(error = %e, host = target, "deep scan unavailable, escalation skipped");
            }
            Err(e) => return Err(e),
        }
        Ok(outcome)
    }

    /// Creates a target and a task on the deep-scan engine, starts it and
    /// records it as `Requested`.
    pub async fn dispatch_deep_scan(&self, ip: &str) -> Result<String> {
        let session = self.engine.connect().await?;
        let target_name = format!("Host {ip} - {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let target_id = session
            .create_target(&target_name, &[ip.to_string()])
            .await?;
        let task_id = session.create_task(&format!("Scan {ip}"), &target_id).await?;
        session.start_task(&task_id).await?;

        match self.inventory.insert_scan_task(&task_id, ip).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(task_id = %task_id, host = ip, "engine returned a task id that is already tracked")
            }
            Err(e) => {
                error!(error = %e, task_id = %task_id, host = ip, "deep scan started but not recorded, task is untracked");
                return Err(e);
            }
        }
        info!(task_id = %task_id, host = ip, engine = self.engine.name(), "deep scan dispatched");
        Ok(task_id)
    }
}
