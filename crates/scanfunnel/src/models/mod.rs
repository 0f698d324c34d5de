use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Up => "up",
            HostStatus::Down => "down",
        }
    }
}

/// One open port as reported by the discovery prober.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub service_name: Option<String>,
}

/// A responding host observed during one discovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HostSnapshot {
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os_guess: Option<String>,
    pub open_ports: Vec<OpenPort>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct HostRecord {
    pub id: i64,
    pub ip_address: String,
    pub mac_address: Option<String>,
    pub hostname: Option<String>,
    pub os_name: Option<String>,
    pub vendor: Option<String>,
    pub status: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct PortRecord {
    pub id: i64,
    pub host_id: Option<i64>,
    pub host_ip: String,
    pub port_number: i64,
    pub protocol: String,
    pub service_name: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Which engine produced a unified finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FindingSource {
    Discovery,
    Triage,
    DeepScan,
}

impl FindingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingSource::Discovery => "Nmap",
            FindingSource::Triage => "Nuclei",
            FindingSource::DeepScan => "GVM",
        }
    }
}

impl fmt::Display for FindingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingSource {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Nmap" => Ok(FindingSource::Discovery),
            "Nuclei" => Ok(FindingSource::Triage),
            "GVM" => Ok(FindingSource::DeepScan),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

impl TryFrom<String> for FindingSource {
    type Error = UnknownValue;

    fn try_from(value: String) -> Result<Self, UnknownValue> {
        value.parse()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct UnknownValue(pub String);

/// Engine-agnostic finding about to be written to the inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFinding {
    pub host_ip: String,
    pub port: Option<u16>,
    pub service: Option<String>,
    pub severity: String,
    pub cve: Option<String>,
    pub description: String,
    pub source: FindingSource,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct FindingRecord {
    pub id: i64,
    pub host_id: Option<i64>,
    pub host_ip: String,
    pub port: Option<i64>,
    pub service: Option<String>,
    pub severity: String,
    pub cve: Option<String>,
    pub description: String,
    #[sqlx(try_from = "String")]
    pub source: FindingSource,
    pub created_at: DateTime<Utc>,
}

/// One line of triage scanner output.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TriageFinding {
    pub template_id: String,
    pub host: String,
    pub name: String,
    pub severity: String,
    pub description: Option<String>,
    pub extracted_results: Vec<String>,
    pub matched_at: Option<String>,
    pub cve: Option<String>,
}

/// One result entry of a deep-scan report.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeepScanResult {
    pub host: String,
    pub port: String,
    pub test_id: String,
    pub test_name: String,
    pub threat: String,
    pub severity: f64,
    pub description: Option<String>,
    pub solution: Option<String>,
    pub cve: Option<String>,
}

/// Local lifecycle of a remote deep-scan job. Only moves forward:
/// Requested < Running < {Done, Error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskStatus {
    Requested,
    Running,
    Done,
    Error,
}

impl TaskStatus {
    pub const OPEN: [TaskStatus; 2] = [TaskStatus::Requested, TaskStatus::Running];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Requested => "Requested",
            TaskStatus::Running => "Running",
            TaskStatus::Done => "Done",
            TaskStatus::Error => "Error",
        }
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Requested => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done | TaskStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    /// Status after observing `observed` on the engine. Terminal states absorb
    /// every observation and regressions are ignored.
    pub fn advance(self, observed: TaskStatus) -> TaskStatus {
        if self.is_terminal() || observed.rank() < self.rank() {
            self
        } else {
            observed
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Requested" => Ok(TaskStatus::Requested),
            "Running" => Ok(TaskStatus::Running),
            "Done" => Ok(TaskStatus::Done),
            "Error" => Ok(TaskStatus::Error),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = UnknownValue;

    fn try_from(value: String) -> Result<Self, UnknownValue> {
        value.parse()
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ScanTask {
    pub id: i64,
    pub task_id: String,
    pub host_ip: String,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub report_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What the deep-scan engine says about one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub report_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{
        FindingSource,
        TaskStatus::{self, *},
        UnknownValue,
    };

    #[test]
    fn status_only_moves_forward() {
        assert_eq!(Requested.advance(Running), Running);
        assert_eq!(Running.advance(Requested), Running);
        assert_eq!(Requested.advance(Done), Done);
        assert_eq!(Running.advance(Error), Error);
        assert_eq!(Done.advance(Running), Done);
        assert_eq!(Error.advance(Done), Error);
        assert_eq!(Done.advance(Error), Done);
    }

    #[test]
    fn status_text_round_trips_through_storage_form() {
        for s in [Requested, Running, Done, Error] {
            assert_eq!(s.as_str().parse::<TaskStatus>().ok(), Some(s));
        }
        assert!("Queued".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn stored_text_converts_through_try_from() {
        assert_eq!(TaskStatus::try_from("Running".to_string()).ok(), Some(Running));
        let UnknownValue(raw) = TaskStatus::try_from("Paused".to_string()).unwrap_err();
        assert_eq!(raw, "Paused");

        assert_eq!(
            FindingSource::try_from("GVM".to_string()).ok(),
            Some(FindingSource::DeepScan)
        );
        let err = FindingSource::try_from("Shodan".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "unknown value: Shodan");
    }
}
