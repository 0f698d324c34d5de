use async_trait::async_trait;

use crate::{
    error::Result,
    models::{DeepScanResult, HostSnapshot, TaskProgress, TriageFinding},
};

pub mod deep_scan;
pub mod discovery;
pub mod triage;

pub use deep_scan::GmpEngine;
pub use discovery::NmapAdapter;
pub use triage::NucleiAdapter;

/// Sweeps an address range for responding hosts.
#[async_trait]
pub trait DiscoveryScanner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn discover(&self, range: &str) -> Result<Vec<HostSnapshot>>;
}

/// Fast template-driven probing of a single target. Failures of the external
/// scanner degrade to partial or empty results.
#[async_trait]
pub trait TriageScanner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn triage(&self, target: &str) -> Vec<TriageFinding>;
}

/// Entry point to the remote deep-scan engine. `connect` authenticates and
/// yields a session for the remaining protocol calls.
#[async_trait]
pub trait DeepScanEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn connect(&self) -> Result<Box<dyn DeepScanSession>>;
}

#[async_trait]
pub trait DeepScanSession: Send + Sync {
    async fn create_target(&self, name: &str, hosts: &[String]) -> Result<String>;
    async fn create_task(&self, name: &str, target_id: &str) -> Result<String>;
    async fn start_task(&self, task_id: &str) -> Result<()>;
    async fn get_task(&self, task_id: &str) -> Result<TaskProgress>;
    async fn get_report(&self, report_id: &str) -> Result<Vec<DeepScanResult>>;
}
