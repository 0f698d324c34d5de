//! In-process stand-ins for the external scanners, shared by the funnel,
//! poller and scheduler tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    adapters::{DeepScanEngine, DeepScanSession, DiscoveryScanner, TriageScanner},
    db,
    error::{Result, ScanError},
    inventory::Inventory,
    models::{DeepScanResult, HostSnapshot, OpenPort, TaskProgress, TaskStatus, TriageFinding},
};

pub(crate) async fn memory_inventory() -> Inventory {
    Inventory::new(db::memory_pool().await)
}

pub(crate) fn snapshot(ip: &str, ports: &[(u16, &str)]) -> HostSnapshot {
    HostSnapshot {
        ip: ip.to_string(),
        open_ports: ports
            .iter()
            .map(|(port, protocol)| OpenPort {
                port: *port,
                protocol: protocol.to_string(),
                service_name: None,
            })
            .collect(),
        ..HostSnapshot::default()
    }
}

pub(crate) fn triage_finding(template_id: &str, host: &str, severity: &str) -> TriageFinding {
    TriageFinding {
        template_id: template_id.to_string(),
        host: host.to_string(),
        name: format!("Template {template_id}"),
        severity: severity.to_string(),
        description: None,
        extracted_results: vec![],
        matched_at: Some(format!("{host}:22")),
        cve: None,
    }
}

pub(crate) fn deep_result(host: &str, test_id: &str, severity: f64, cve: Option<&str>) -> DeepScanResult {
    DeepScanResult {
        host: host.to_string(),
        port: "22/tcp".to_string(),
        test_id: test_id.to_string(),
        test_name: format!("Test {test_id}"),
        threat: if severity >= 7.0 { "High" } else { "Medium" }.to_string(),
        severity,
        description: Some("Detected.".to_string()),
        solution: None,
        cve: cve.map(str::to_string),
    }
}

pub(crate) enum Sweep {
    Hosts(Vec<HostSnapshot>),
    Denied,
}

pub(crate) struct FakeDiscovery {
    sweep: Sweep,
    pub calls: Mutex<Vec<String>>,
}

impl FakeDiscovery {
    pub fn new(sweep: Sweep) -> Self {
        Self {
            sweep,
            calls: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl DiscoveryScanner for FakeDiscovery {
    fn name(&self) -> &'static str {
        "nmap"
    }

    async fn discover(&self, range: &str) -> Result<Vec<HostSnapshot>> {
        self.calls.lock().unwrap().push(range.to_string());
        match &self.sweep {
            Sweep::Hosts(hosts) => Ok(hosts.clone()),
            Sweep::Denied => Err(ScanError::PermissionDenied { tool: "nmap" }),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeTriage {
    pub findings: HashMap<String, Vec<TriageFinding>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTriage {
    pub fn with(target: &str, findings: Vec<TriageFinding>) -> Self {
        let mut fake = Self::default();
        fake.findings.insert(target.to_string(), findings);
        fake
    }
}

#[async_trait]
impl TriageScanner for FakeTriage {
    fn name(&self) -> &'static str {
        "nuclei"
    }

    async fn triage(&self, target: &str) -> Vec<TriageFinding> {
        self.calls.lock().unwrap().push(target.to_string());
        self.findings.get(target).cloned().unwrap_or_default()
    }
}

/// What the fake engine knows. Tasks without an entry in `progress` answer
/// status queries with a protocol error; reports without an entry in
/// `reports` fail as unavailable.
#[derive(Default)]
pub(crate) struct EngineState {
    pub connects: usize,
    pub targets: Vec<(String, Vec<String>)>,
    pub started: Vec<String>,
    pub status_queries: Vec<String>,
    pub progress: HashMap<String, TaskProgress>,
    pub reports: HashMap<String, Vec<DeepScanResult>>,
    next_task: usize,
}

impl EngineState {
    pub fn set(&mut self, task_id: &str, status: TaskStatus, report_id: Option<&str>) {
        self.progress.insert(
            task_id.to_string(),
            TaskProgress {
                status,
                report_id: report_id.map(str::to_string),
            },
        );
    }
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    pub state: Arc<Mutex<EngineState>>,
    pub unconfigured: bool,
}

impl FakeEngine {
    pub fn unconfigured() -> Self {
        Self {
            unconfigured: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl DeepScanEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "gvm"
    }

    async fn connect(&self) -> Result<Box<dyn DeepScanSession>> {
        if self.unconfigured {
            return Err(ScanError::Configuration("GVM_USER and GVM_PASSWORD are not set".into()));
        }
        self.state.lock().unwrap().connects += 1;
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<EngineState>>,
}

#[async_trait]
impl DeepScanSession for FakeSession {
    async fn create_target(&self, name: &str, hosts: &[String]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.targets.push((name.to_string(), hosts.to_vec()));
        Ok(format!("target-{}", state.targets.len()))
    }

    async fn create_task(&self, _name: &str, _target_id: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_task += 1;
        Ok(format!("task-{}", state.next_task))
    }

    async fn start_task(&self, task_id: &str) -> Result<()> {
        self.state.lock().unwrap().started.push(task_id.to_string());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskProgress> {
        let mut state = self.state.lock().unwrap();
        state.status_queries.push(task_id.to_string());
        state
            .progress
            .get(task_id)
            .cloned()
            .ok_or_else(|| ScanError::protocol("gvm", format!("unknown task status for {task_id}")))
    }

    async fn get_report(&self, report_id: &str) -> Result<Vec<DeepScanResult>> {
        self.state
            .lock()
            .unwrap()
            .reports
            .get(report_id)
            .cloned()
            .ok_or_else(|| ScanError::unavailable("gvm", "connection reset"))
    }
}
