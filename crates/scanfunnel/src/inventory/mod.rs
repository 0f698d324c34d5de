use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    error::Result,
    models::{
        DeepScanResult, FindingRecord, HostRecord, HostSnapshot, HostStatus, NewFinding,
        PortRecord, ScanTask, TaskStatus, TriageFinding,
    },
    parser::{gmp, nuclei},
};

const HOST_COLUMNS: &str =
    "id, ip_address, mac_address, hostname, os_name, vendor, status, last_seen";
const TASK_COLUMNS: &str = "id, task_id, host_ip, status, report_id, created_at";

/// Counters produced by one report ingestion.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub raw_inserted: usize,
    pub unified_inserted: usize,
    pub informational_skipped: usize,
}

/// Shared source of truth for hosts, ports, findings and deep-scan tasks.
/// Every mutating call is one transaction.
#[derive(Debug, Clone)]
pub struct Inventory {
    pool: SqlitePool,
}

impl Inventory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upserts the host and each of its open ports.
    pub async fn record_host(&self, snapshot: &HostSnapshot) -> Result<HostRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let host = sqlx::query_as::<_, HostRecord>(&format!(
            "INSERT INTO hosts(ip_address, mac_address, hostname, os_name, vendor, status, last_seen)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(ip_address) DO UPDATE SET
                mac_address = COALESCE(excluded.mac_address, hosts.mac_address),
                hostname = COALESCE(excluded.hostname, hosts.hostname),
                os_name = COALESCE(excluded.os_name, hosts.os_name),
                vendor = COALESCE(excluded.vendor, hosts.vendor),
                status = excluded.status,
                last_seen = excluded.last_seen
             RETURNING {HOST_COLUMNS}"
        ))
        .bind(&snapshot.ip)
        .bind(&snapshot.mac)
        .bind(&snapshot.hostname)
        .bind(&snapshot.os_guess)
        .bind(&snapshot.vendor)
        .bind(HostStatus::Up.as_str())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for port in &snapshot.open_ports {
            sqlx::query(
                "INSERT INTO ports(host_id, host_ip, port_number, protocol, service_name, observed_at)
                 VALUES(?, ?, ?, ?, ?, ?)
                 ON CONFLICT(host_ip, port_number, protocol) DO NOTHING",
            )
            .bind(host.id)
            .bind(&snapshot.ip)
            .bind(i64::from(port.port))
            .bind(&port.protocol)
            .bind(port.service_name.as_deref().unwrap_or("unknown"))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(host)
    }

    pub async fn hosts_up(&self) -> Result<Vec<HostRecord>> {
        Ok(sqlx::query_as::<_, HostRecord>(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE status = 'up' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn host_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM hosts")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Marks every `up` host outside `seen` as `down`.
    pub async fn mark_unseen_hosts_down(&self, seen: &[String]) -> Result<u64> {
        let seen = serde_json::to_string(seen).unwrap_or_else(|_| "[]".to_string());
        let res = sqlx::query(
            "UPDATE hosts SET status = ?
             WHERE status = ? AND ip_address NOT IN (SELECT value FROM json_each(?))",
        )
        .bind(HostStatus::Down.as_str())
        .bind(HostStatus::Up.as_str())
        .bind(seen)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    #[cfg(test)]
    pub(crate) async fn ports(&self, ip: &str) -> Result<Vec<PortRecord>> {
        Ok(sqlx::query_as::<_, PortRecord>(
            "SELECT id, host_id, host_ip, port_number, protocol, service_name, observed_at
             FROM ports WHERE host_ip = ? ORDER BY port_number, protocol",
        )
        .bind(ip)
        .fetch_all(&self.pool)
        .await?)
    }

    #[cfg(test)]
    pub(crate) async fn findings(&self, ip: &str) -> Result<Vec<FindingRecord>> {
        Ok(sqlx::query_as::<_, FindingRecord>(
            "SELECT id, host_id, host_ip, port, service, severity, cve, description, source, created_at
             FROM findings WHERE host_ip = ? ORDER BY id",
        )
        .bind(ip)
        .fetch_all(&self.pool)
        .await?)
    }

    #[cfg(test)]
    pub(crate) async fn deep_scan_finding_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM deep_scan_findings")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Persists raw triage rows and their unified counterparts. A unified row
    /// is appended only when its raw row is new, so re-running triage over an
    /// unchanged host writes nothing. Returns the number of new raw rows.
    pub async fn record_triage_findings(
        &self,
        host_ip: &str,
        findings: &[TriageFinding],
    ) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for f in findings {
            let raw = sqlx::query(
                "INSERT OR IGNORE INTO triage_findings(template_id, host, name, severity, description, extracted_results, matched_at, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&f.template_id)
            .bind(&f.host)
            .bind(&f.name)
            .bind(&f.severity)
            .bind(&f.description)
            .bind(f.extracted_results.join("\n"))
            .bind(f.matched_at.as_deref().unwrap_or(""))
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if raw.rows_affected() == 1 {
                inserted += 1;
                insert_finding(&mut tx, &nuclei::unified_finding(f, host_ip)).await?;
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Records a freshly dispatched deep-scan task as `Requested`. Returns
    /// false when the task id is already known.
    pub async fn insert_scan_task(&self, task_id: &str, host_ip: &str) -> Result<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO scan_tasks(task_id, host_ip, status, created_at) VALUES(?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(host_ip)
        .bind(TaskStatus::Requested.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn open_scan_tasks(&self) -> Result<Vec<ScanTask>> {
        Ok(sqlx::query_as::<_, ScanTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM scan_tasks WHERE status IN (?, ?) ORDER BY id"
        ))
        .bind(TaskStatus::OPEN[0].as_str())
        .bind(TaskStatus::OPEN[1].as_str())
        .fetch_all(&self.pool)
        .await?)
    }

    #[cfg(test)]
    pub(crate) async fn scan_task(&self, task_id: &str) -> Result<Option<ScanTask>> {
        Ok(sqlx::query_as::<_, ScanTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM scan_tasks WHERE task_id = ?"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn recent_scan_tasks(&self, limit: i64) -> Result<Vec<ScanTask>> {
        Ok(sqlx::query_as::<_, ScanTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM scan_tasks ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Writes a non-terminal status observation. Rows already terminal are
    /// left untouched.
    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE scan_tasks SET status = ? WHERE task_id = ? AND status IN ('Requested', 'Running')",
        )
        .bind(status.as_str())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Marks the task Done and ingests its report in one transaction.
    pub async fn complete_task(
        &self,
        task: &ScanTask,
        report_id: &str,
        results: &[DeepScanResult],
    ) -> Result<IngestSummary> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE scan_tasks SET status = ?, report_id = ?
             WHERE task_id = ? AND status IN ('Requested', 'Running')",
        )
        .bind(TaskStatus::Done.as_str())
        .bind(report_id)
        .bind(&task.task_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(IngestSummary::default());
        }

        let summary = ingest_report(&mut tx, &task.host_ip, results).await?;
        tx.commit().await?;
        Ok(summary)
    }

    /// Last known online hosts, as recorded by the most recent funnel cycle.
    pub async fn online_hosts(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT ip_address FROM online_hosts ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn set_online_hosts(&self, ips: &[String]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM online_hosts")
            .execute(&mut *tx)
            .await?;
        for ip in ips {
            sqlx::query("INSERT OR IGNORE INTO online_hosts(ip_address, observed_at) VALUES(?, ?)")
                .bind(ip)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Inserts a unified finding unless its (CVE, host) key is already present,
/// whichever stage reported it first. CVE-less findings have no natural key
/// and are always appended.
async fn insert_finding(conn: &mut SqliteConnection, finding: &NewFinding) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO findings(host_id, host_ip, port, service, severity, cve, description, source, created_at)
         VALUES((SELECT id FROM hosts WHERE ip_address = ?), ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&finding.host_ip)
    .bind(&finding.host_ip)
    .bind(finding.port.map(i64::from))
    .bind(&finding.service)
    .bind(&finding.severity)
    .bind(&finding.cve)
    .bind(&finding.description)
    .bind(finding.source.as_str())
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(res.rows_affected() == 1)
}

async fn ingest_report(
    conn: &mut SqliteConnection,
    task_host: &str,
    results: &[DeepScanResult],
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let now = Utc::now();

    for r in results {
        if r.severity <= 0.0 {
            summary.informational_skipped += 1;
            continue;
        }

        let raw = sqlx::query(
            "INSERT OR IGNORE INTO deep_scan_findings(host, port, test_id, test_name, threat_level, severity_score, description, solution, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.host)
        .bind(&r.port)
        .bind(&r.test_id)
        .bind(&r.test_name)
        .bind(&r.threat)
        .bind(r.severity)
        .bind(r.description.as_deref().unwrap_or("No description available."))
        .bind(r.solution.as_deref().unwrap_or("No solution provided."))
        .bind(now)
        .execute(&mut *conn)
        .await?;
        summary.raw_inserted += raw.rows_affected() as usize;

        if insert_finding(&mut *conn, &gmp::unified_finding(r, task_host)).await? {
            summary.unified_inserted += 1;
        }
    }

    Ok(summary)
}
