//! Command builders and response mappings for the Greenbone Management
//! Protocol. Everything here is pure: XML in, domain values out.

use quick_xml::{de::from_str, escape::escape};

use super::nuclei::truncate;
use crate::{
    error::{Result, ScanError},
    models::{DeepScanResult, FindingSource, NewFinding, TaskProgress, TaskStatus},
};

const TOOL: &str = "gvm";

/// Cheapest command a logged-in session can send.
pub const GET_VERSION_COMMAND: &str = "<get_version/>";

pub fn authenticate_command(username: &str, password: &str) -> String {
    format!(
        "<authenticate><credentials><username>{}</username><password>{}</password></credentials></authenticate>",
        escape(username),
        escape(password)
    )
}

pub fn create_target_command(name: &str, hosts: &[String], port_list_id: &str) -> String {
    format!(
        "<create_target><name>{}</name><hosts>{}</hosts><port_list id=\"{}\"/></create_target>",
        escape(name),
        escape(&hosts.join(",")),
        escape(port_list_id)
    )
}

pub fn create_task_command(name: &str, config_id: &str, target_id: &str, scanner_id: &str) -> String {
    format!(
        "<create_task><name>{}</name><config id=\"{}\"/><target id=\"{}\"/><scanner id=\"{}\"/></create_task>",
        escape(name),
        escape(config_id),
        escape(target_id),
        escape(scanner_id)
    )
}

pub fn start_task_command(task_id: &str) -> String {
    format!("<start_task task_id=\"{}\"/>", escape(task_id))
}

pub fn get_task_command(task_id: &str) -> String {
    format!("<get_tasks task_id=\"{}\"/>", escape(task_id))
}

pub fn get_report_command(report_id: &str) -> String {
    format!(
        "<get_reports report_id=\"{}\" filter=\"apply_overrides=1 rows=-1\" details=\"1\" ignore_pagination=\"1\"/>",
        escape(report_id)
    )
}

#[derive(Debug, serde::Deserialize)]
struct StatusEnvelope {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text", default)]
    status_text: String,
    #[serde(rename = "@id", default)]
    id: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(xml: &str) -> Result<T> {
    from_str(xml).map_err(|e| ScanError::protocol(TOOL, e.to_string()))
}

fn ensure_ok(status: &str, status_text: &str) -> Result<()> {
    if status.starts_with('2') {
        Ok(())
    } else {
        Err(ScanError::protocol(
            TOOL,
            format!("status {status}: {status_text}"),
        ))
    }
}

/// Succeeds only for a 2xx response.
pub fn parse_ack(xml: &str) -> Result<()> {
    let env: StatusEnvelope = decode(xml)?;
    ensure_ok(&env.status, &env.status_text)
}

/// Identifier of the resource created by a `create_*` command.
pub fn parse_created_id(xml: &str) -> Result<String> {
    let env: StatusEnvelope = decode(xml)?;
    ensure_ok(&env.status, &env.status_text)?;
    env.id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ScanError::protocol(TOOL, "create response without id"))
}

#[derive(Debug, serde::Deserialize)]
struct GetTasksResponse {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text", default)]
    status_text: String,
    #[serde(rename = "task", default)]
    tasks: Vec<GmpTask>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpTask {
    #[serde(rename = "@id")]
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    last_report: Option<ReportRef>,
    #[serde(default)]
    current_report: Option<ReportRef>,
}

#[derive(Debug, serde::Deserialize)]
struct ReportRef {
    report: IdRef,
}

#[derive(Debug, serde::Deserialize)]
struct IdRef {
    #[serde(rename = "@id")]
    id: String,
}

/// Collapses the engine's task states onto the local lifecycle.
pub fn map_engine_status(raw: &str) -> Option<TaskStatus> {
    match raw.trim() {
        "New" | "Requested" | "Queued" => Some(TaskStatus::Requested),
        "Running"
        | "Processing"
        | "Stop Requested"
        | "Stop Waiting"
        | "Delete Requested"
        | "Delete Waiting"
        | "Ultimate Delete Requested"
        | "Ultimate Delete Waiting" => Some(TaskStatus::Running),
        "Done" => Some(TaskStatus::Done),
        "Stopped" | "Interrupted" => Some(TaskStatus::Error),
        _ => None,
    }
}

pub fn parse_task_progress(xml: &str, task_id: &str) -> Result<TaskProgress> {
    let resp: GetTasksResponse = decode(xml)?;
    ensure_ok(&resp.status, &resp.status_text)?;

    let task = resp
        .tasks
        .into_iter()
        .find(|t| t.id == task_id)
        .ok_or_else(|| ScanError::protocol(TOOL, format!("task {task_id} missing from response")))?;
    let raw = task
        .status
        .ok_or_else(|| ScanError::protocol(TOOL, format!("task {task_id} has no status")))?;
    let status = map_engine_status(&raw)
        .ok_or_else(|| ScanError::protocol(TOOL, format!("unknown task status {raw:?}")))?;

    let report_id = task
        .last_report
        .or(task.current_report)
        .map(|r| r.report.id)
        .filter(|id| !id.is_empty());
    if status == TaskStatus::Done && report_id.is_none() {
        return Err(ScanError::protocol(
            TOOL,
            format!("task {task_id} is done without a report"),
        ));
    }

    Ok(TaskProgress { status, report_id })
}

#[derive(Debug, serde::Deserialize)]
struct GetReportsResponse {
    #[serde(rename = "@status")]
    status: String,
    #[serde(rename = "@status_text", default)]
    status_text: String,
    #[serde(default)]
    report: Option<OuterReport>,
}

#[derive(Debug, serde::Deserialize)]
struct OuterReport {
    report: InnerReport,
}

#[derive(Debug, serde::Deserialize)]
struct InnerReport {
    #[serde(default)]
    results: Option<GmpResults>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpResults {
    #[serde(rename = "result", default)]
    results: Vec<GmpResult>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpResult {
    host: GmpHost,
    #[serde(default)]
    port: Option<String>,
    nvt: GmpNvt,
    #[serde(default)]
    threat: Option<String>,
    severity: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpHost {
    #[serde(rename = "$text", default)]
    addr: String,
}

#[derive(Debug, serde::Deserialize)]
struct GmpNvt {
    #[serde(rename = "@oid")]
    oid: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    solution: Option<GmpText>,
    #[serde(default)]
    refs: Option<GmpRefs>,
    #[serde(default)]
    cve: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpText {
    #[serde(rename = "$text", default)]
    text: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpRefs {
    #[serde(rename = "ref", default)]
    refs: Vec<GmpRef>,
}

#[derive(Debug, serde::Deserialize)]
struct GmpRef {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@id")]
    id: String,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Every result of a report, informational ones included.
pub fn parse_report(xml: &str) -> Result<Vec<DeepScanResult>> {
    let resp: GetReportsResponse = decode(xml)?;
    ensure_ok(&resp.status, &resp.status_text)?;

    let results = resp
        .report
        .and_then(|r| r.report.results)
        .map(|r| r.results)
        .unwrap_or_default();

    results
        .into_iter()
        .map(|r| {
            let severity = r.severity.trim().parse::<f64>().map_err(|_| {
                ScanError::protocol(TOOL, format!("bad severity {:?} for {}", r.severity, r.nvt.oid))
            })?;
            let cve = r
                .nvt
                .refs
                .and_then(|refs| refs.refs.into_iter().find(|x| x.kind.eq_ignore_ascii_case("cve")))
                .map(|x| x.id)
                .or_else(|| non_empty(r.nvt.cve).filter(|c| c != "NOCVE"));
            Ok(DeepScanResult {
                host: r.host.addr.trim().to_string(),
                port: non_empty(r.port).unwrap_or_else(|| "general".to_string()),
                test_id: r.nvt.oid,
                test_name: non_empty(r.nvt.name).unwrap_or_else(|| "Unnamed test".to_string()),
                threat: non_empty(r.threat).unwrap_or_else(|| "Unknown".to_string()),
                severity,
                description: non_empty(r.description).or_else(|| non_empty(r.nvt.description)),
                solution: r.nvt.solution.and_then(|s| non_empty(s.text)),
                cve,
            })
        })
        .collect()
}

/// Splits `80/tcp` into port and service; `general/...` entries describe the
/// host as a whole.
pub fn split_port(port: &str) -> (Option<u16>, Option<String>) {
    match port.split_once('/') {
        _ if port.starts_with("general") => (Some(0), Some("system".to_string())),
        Some((num, proto)) => (num.parse().ok(), Some(proto.to_string())),
        None => (port.parse().ok(), None),
    }
}

/// Unified view of a deep-scan result; `fallback_host` covers results whose
/// host element is empty.
pub fn unified_finding(result: &DeepScanResult, fallback_host: &str) -> NewFinding {
    let (port, service) = split_port(&result.port);
    let host_ip = if result.host.is_empty() {
        fallback_host
    } else {
        &result.host
    };
    NewFinding {
        host_ip: host_ip.to_string(),
        port,
        service,
        severity: result.threat.clone(),
        cve: result.cve.clone(),
        description: truncate(
            &format!(
                "{}: {}",
                result.test_name,
                result.description.as_deref().unwrap_or("")
            ),
            1000,
        ),
        source: FindingSource::DeepScan,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn report_xml(report_id: &str, results: &[(&str, &str, &str, &str, Option<&str>)]) -> String {
        let body: String = results
            .iter()
            .map(|(host, port, oid, severity, cve)| {
                let refs = cve
                    .map(|c| format!("<refs><ref type=\"url\" id=\"https://example.test\"/><ref type=\"cve\" id=\"{c}\"/></refs>"))
                    .unwrap_or_default();
                format!(
                    "<result id=\"r-{oid}\"><name>Test {oid}</name><host>{host}<asset asset_id=\"a1\"/><hostname/></host><port>{port}</port><nvt oid=\"{oid}\"><type>nvt</type><name>Test {oid}</name><cvss_base>{severity}</cvss_base>{refs}<solution type=\"VendorFix\">Upgrade.</solution></nvt><threat>High</threat><severity>{severity}</severity><qod><value>80</value></qod><description>Detected by {oid}.</description></result>"
                )
            })
            .collect();
        format!(
            "<get_reports_response status=\"200\" status_text=\"OK\"><report id=\"{report_id}\" format_id=\"a994b278\"><owner><name>admin</name></owner><report id=\"{report_id}\"><scan_run_status>Done</scan_run_status><results start=\"1\" max=\"-1\">{body}</results><result_count>{}</result_count></report></report></get_reports_response>",
            results.len()
        )
    }

    #[test]
    fn created_id_comes_from_response_root() {
        let xml = r#"<create_target_response status="201" status_text="OK, resource created" id="254cd3ef-bbe1-4d58-859d-21b8d0c046c6"/>"#;
        assert_eq!(
            parse_created_id(xml).unwrap(),
            "254cd3ef-bbe1-4d58-859d-21b8d0c046c6"
        );
    }

    #[test]
    fn error_status_is_a_protocol_error() {
        let xml = r#"<create_task_response status="400" status_text="Failed to find config"/>"#;
        let err = parse_created_id(xml).unwrap_err();
        assert!(matches!(err, ScanError::Protocol { .. }));
        assert!(err.to_string().contains("Failed to find config"));

        assert!(parse_ack(r#"<authenticate_response status="400" status_text="Authentication failed"/>"#).is_err());
        assert!(parse_ack(r#"<start_task_response status="202" status_text="OK, request submitted"><report_id>x</report_id></start_task_response>"#).is_ok());
    }

    #[test]
    fn running_task_maps_to_running() {
        let xml = r#"<get_tasks_response status="200" status_text="OK">
            <apply_overrides>0</apply_overrides>
            <task id="t-1"><name>Scan 10.0.0.9</name><status>Running</status><progress>42</progress>
              <current_report><report id="r-0"><timestamp>2024-01-01T00:00:00Z</timestamp></report></current_report>
            </task>
            <filters id=""><term>apply_overrides=0</term></filters>
            <task_count>1<filtered>1</filtered></task_count>
          </get_tasks_response>"#;
        let progress = parse_task_progress(xml, "t-1").unwrap();
        assert_eq!(progress.status, TaskStatus::Running);
    }

    #[test]
    fn transitional_engine_states_count_as_running() {
        for raw in [
            "Stop Requested",
            "Stop Waiting",
            "Delete Requested",
            "Delete Waiting",
            "Ultimate Delete Requested",
            "Ultimate Delete Waiting",
        ] {
            assert_eq!(map_engine_status(raw), Some(TaskStatus::Running), "{raw}");
        }

        let xml = r#"<get_tasks_response status="200" status_text="OK">
            <task id="t-1"><status>Stop Waiting</status><progress>40</progress></task>
        </get_tasks_response>"#;
        let progress = parse_task_progress(xml, "t-1").unwrap();
        assert_eq!(progress.status, TaskStatus::Running);
    }

    #[test]
    fn done_task_carries_last_report_id() {
        let xml = r#"<get_tasks_response status="200" status_text="OK">
            <task id="t-1"><status>Done</status><progress>-1</progress>
              <last_report><report id="r-1"><timestamp>2024-01-01T00:00:00Z</timestamp></report></last_report>
            </task>
          </get_tasks_response>"#;
        let progress = parse_task_progress(xml, "t-1").unwrap();
        assert_eq!(progress.status, TaskStatus::Done);
        assert_eq!(progress.report_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn done_without_report_and_unknown_status_are_rejected() {
        let done = r#"<get_tasks_response status="200" status_text="OK"><task id="t-1"><status>Done</status></task></get_tasks_response>"#;
        assert!(parse_task_progress(done, "t-1").is_err());

        let odd = r#"<get_tasks_response status="200" status_text="OK"><task id="t-1"><status>Exploded</status></task></get_tasks_response>"#;
        assert!(parse_task_progress(odd, "t-1").is_err());

        let missing = r#"<get_tasks_response status="404" status_text="Failed to find task"/>"#;
        assert!(parse_task_progress(missing, "t-1").is_err());
    }

    #[test]
    fn report_results_are_mapped() {
        let xml = report_xml(
            "r-1",
            &[
                ("10.0.0.9", "443/tcp", "1.3.6.1.4.1.25623.1.0.108031", "7.5", Some("CVE-2016-2183")),
                ("10.0.0.9", "general/tcp", "1.3.6.1.4.1.25623.1.0.80091", "0.0", None),
            ],
        );
        let results = parse_report(&xml).unwrap();
        assert_eq!(results.len(), 2);

        let tls = &results[0];
        assert_eq!(tls.host, "10.0.0.9");
        assert_eq!(tls.test_id, "1.3.6.1.4.1.25623.1.0.108031");
        assert_eq!(tls.severity, 7.5);
        assert_eq!(tls.cve.as_deref(), Some("CVE-2016-2183"));
        assert_eq!(tls.solution.as_deref(), Some("Upgrade."));
        assert_eq!(
            tls.description.as_deref(),
            Some("Detected by 1.3.6.1.4.1.25623.1.0.108031.")
        );
        assert_eq!(results[1].cve, None);
    }

    #[test]
    fn legacy_cve_element_is_honoured() {
        let xml = r#"<get_reports_response status="200" status_text="OK"><report id="r"><report id="r"><results>
            <result><host>10.0.0.2</host><port>22/tcp</port><nvt oid="1.2.3"><name>Old SSH</name><cve>CVE-2008-5161</cve></nvt><threat>Medium</threat><severity>4.3</severity></result>
            <result><host>10.0.0.2</host><port>22/tcp</port><nvt oid="1.2.4"><name>Banner</name><cve>NOCVE</cve></nvt><threat>Low</threat><severity>2.6</severity></result>
          </results></report></report></get_reports_response>"#;
        let results = parse_report(xml).unwrap();
        assert_eq!(results[0].cve.as_deref(), Some("CVE-2008-5161"));
        assert_eq!(results[1].cve, None);
        assert_eq!(results[1].description, None);
    }

    #[test]
    fn unified_finding_splits_port_and_labels_source() {
        let xml = report_xml("r-1", &[("", "general/tcp", "1.2.9", "5.0", None)]);
        let results = parse_report(&xml).unwrap();
        let finding = unified_finding(&results[0], "10.0.0.4");
        assert_eq!(finding.host_ip, "10.0.0.4");
        assert_eq!(finding.port, Some(0));
        assert_eq!(finding.service.as_deref(), Some("system"));
        assert_eq!(finding.severity, "High");
        assert_eq!(finding.source, FindingSource::DeepScan);
        assert_eq!(finding.description, "Test 1.2.9: Detected by 1.2.9.");

        assert_eq!(split_port("80/tcp"), (Some(80), Some("tcp".to_string())));
        assert_eq!(split_port("general/CPE-T"), (Some(0), Some("system".to_string())));
    }

    #[test]
    fn commands_escape_values() {
        let cmd = create_target_command("Host <a&b>", &["10.0.0.1".to_string()], "pl");
        assert!(cmd.contains("<name>Host &lt;a&amp;b&gt;</name>"));
        assert!(cmd.contains("<hosts>10.0.0.1</hosts>"));
        assert!(authenticate_command("admin", "p\"w").contains("p&quot;w"));
    }
}
