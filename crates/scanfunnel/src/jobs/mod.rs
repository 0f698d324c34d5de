use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    adapters::{DeepScanEngine, DiscoveryScanner, TriageScanner},
    config::{validate_target, AppConfig, ScheduleConfig},
    error::Result,
    funnel::{CycleReport, Funnel, TriageOutcome},
    inventory::Inventory,
    poller::{Poller, ReconcileReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    FunnelCycle,
    Reconcile,
    NightlyAudit,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Job::FunnelCycle => "funnel_cycle",
            Job::Reconcile => "reconcile",
            Job::NightlyAudit => "nightly_audit",
        })
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> Result<()>;
}

/// Owns the pipeline stages and runs them against the configured inventory.
/// Scheduled and manual runs go through the same per-host code.
#[derive(Clone)]
pub struct Orchestrator {
    inventory: Inventory,
    funnel: Funnel,
    poller: Poller,
    config: Arc<AppConfig>,
}

impl Orchestrator {
    pub fn new(
        inventory: Inventory,
        discovery: Arc<dyn DiscoveryScanner>,
        triage: Arc<dyn TriageScanner>,
        engine: Arc<dyn DeepScanEngine>,
        config: Arc<AppConfig>,
    ) -> Self {
        let funnel = Funnel::new(inventory.clone(), discovery, triage, Arc::clone(&engine))
            .mark_missing_hosts_down(config.discovery.mark_missing_hosts_down);
        let poller = Poller::new(inventory.clone(), engine);
        Self {
            inventory,
            funnel,
            poller,
            config,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub async fn run_funnel_cycle(&self) -> Result<CycleReport> {
        let range = self.config.discovery.target()?;
        self.funnel.run_cycle(range).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.poller.reconcile().await
    }

    /// Dispatches a fresh deep scan for every host currently up, pausing
    /// between hosts. Returns the number of tasks dispatched.
    pub async fn nightly_audit(&self) -> Result<usize> {
        let hosts = self.inventory.hosts_up().await?;
        info!(hosts = hosts.len(), "nightly audit starting");

        let pacing = self.config.schedule.audit_pacing();
        let mut dispatched = 0;
        for (i, host) in hosts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(pacing).await;
            }
            match self.funnel.dispatch_deep_scan(&host.ip_address).await {
                Ok(_) => dispatched += 1,
                Err(e) if e.disables_stage() => return Err(e),
                Err(e) => warn!(error = %e, host = %host.ip_address, "audit dispatch failed"),
            }
        }

        info!(dispatched, "nightly audit finished");
        Ok(dispatched)
    }

    pub async fn manual_triage(&self, target: &str) -> Result<TriageOutcome> {
        validate_target(target)?;
        info!(host = target, "manual triage requested");
        self.funnel.triage_target(target).await
    }

    pub async fn manual_deep_scan(&self, ip: &str) -> Result<String> {
        validate_target(ip)?;
        info!(host = ip, "manual deep scan requested");
        self.funnel.dispatch_deep_scan(ip).await
    }
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run(&self, job: Job) -> Result<()> {
        match job {
            Job::FunnelCycle => self.run_funnel_cycle().await.map(drop),
            Job::Reconcile => self.reconcile().await.map(drop),
            Job::NightlyAudit => self.nightly_audit().await.map(drop),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Once per calendar day at this local time.
    DailyAt(NaiveTime),
}

/// First occurrence of `at` strictly after `now`.
pub fn next_daily_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

impl Cadence {
    fn next_delay(self) -> Duration {
        match self {
            Cadence::Every(interval) => interval,
            Cadence::DailyAt(at) => {
                let now = Local::now().naive_local();
                (next_daily_occurrence(now, at) - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            }
        }
    }
}

struct Entry {
    job: Job,
    cadence: Cadence,
    due: tokio::time::Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub tick: Duration,
    pub startup_delay: Duration,
    pub error_backoff: Duration,
}

/// Single background loop over a table of jobs. Jobs run one at a time; a
/// failing job is logged and followed by a backoff pause.
pub struct Scheduler {
    entries: Vec<Entry>,
    timing: Timing,
}

impl Scheduler {
    pub fn new(table: Vec<(Job, Cadence)>, timing: Timing) -> Self {
        let start = tokio::time::Instant::now() + timing.startup_delay;
        let entries = table
            .into_iter()
            .map(|(job, cadence)| Entry {
                job,
                cadence,
                due: match cadence {
                    Cadence::Every(_) => start,
                    Cadence::DailyAt(_) => start + cadence.next_delay(),
                },
            })
            .collect();
        Self { entries, timing }
    }

    /// Builds the production job table. An unparsable audit time leaves the
    /// nightly audit out of the table; the other jobs still run.
    pub fn from_config(cfg: &ScheduleConfig) -> Self {
        let mut table = vec![
            (Job::FunnelCycle, Cadence::Every(Duration::from_secs(cfg.funnel_interval_secs))),
            (Job::Reconcile, Cadence::Every(Duration::from_secs(cfg.reconcile_interval_secs))),
        ];
        match cfg.audit_time() {
            Ok(at) => table.push((Job::NightlyAudit, Cadence::DailyAt(at))),
            Err(e) => warn!(error = %e, "nightly audit disabled"),
        }
        Self::new(
            table,
            Timing {
                tick: cfg.tick(),
                startup_delay: Duration::from_secs(cfg.startup_delay_secs),
                error_backoff: cfg.error_backoff(),
            },
        )
    }

    pub async fn run(mut self, runner: Arc<dyn JobRunner>, shutdown: CancellationToken) {
        info!(jobs = self.entries.len(), "scheduler started");
        if !pause(&shutdown, self.timing.startup_delay).await {
            return;
        }

        loop {
            for entry in &mut self.entries {
                if shutdown.is_cancelled() {
                    break;
                }
                if entry.due > tokio::time::Instant::now() {
                    continue;
                }

                let started = tokio::time::Instant::now();
                match runner.run(entry.job).await {
                    Ok(()) => {
                        info!(job = %entry.job, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
                    }
                    Err(e) => {
                        error!(job = %entry.job, error = %e, "job failed, backing off");
                        if !pause(&shutdown, self.timing.error_backoff).await {
                            break;
                        }
                    }
                }
                entry.due = tokio::time::Instant::now() + entry.cadence.next_delay();
            }

            if !pause(&shutdown, self.timing.tick).await {
                break;
            }
        }
        info!("scheduler stopped");
    }
}

/// Sleeps for `duration`; false when shutdown was requested meanwhile.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Sliding one-minute window guarding manual runs.
#[derive(Debug)]
pub struct RateLimiter {
    limit_per_minute: usize,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: usize) -> Self {
        Self {
            limit_per_minute,
            requests: VecDeque::new(),
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.requests.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.requests.len() >= self.limit_per_minute {
            return false;
        }
        self.requests.push_back(now);
        true
    }
}
