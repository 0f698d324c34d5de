use std::{collections::HashSet, io::ErrorKind, net::IpAddr, str::FromStr, time::Duration};

use ipnet::IpNet;
use tokio::{process::Command, time::timeout};
use tracing::info;

use crate::error::{Result, ScanError};

pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist
        .iter()
        .any(|item| item.eq_ignore_ascii_case(target))
    {
        return true;
    }

    if let Ok(ip) = IpAddr::from_str(target) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry)
                .map(|net| net.contains(&ip))
                .unwrap_or(false)
        });
    }

    false
}

/// Output of a finished external tool.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Arguments following one of these flags are masked in the audit log.
const SECRET_FLAGS: &[&str] = &["--gmp-password", "--password"];

fn redacted(args: &[String]) -> Vec<&str> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next || arg.contains("<password>") {
            out.push("***");
            hide_next = false;
            continue;
        }
        hide_next = SECRET_FLAGS.contains(&arg.as_str());
        out.push(arg.as_str());
    }
    out
}

/// Runs an allow-listed binary to completion within `timeout_secs`. A missing
/// binary, spawn failure or timeout is `AdapterUnavailable`; a non-zero exit
/// is returned to the caller, which decides what partial output is worth.
pub async fn run_command_allowlisted(
    tool: &'static str,
    cmd: &str,
    args: &[String],
    allowed: &[&str],
    timeout_secs: u64,
) -> Result<CommandOutput> {
    let allowed_set: HashSet<&str> = allowed.iter().copied().collect();
    if !allowed_set.contains(cmd) {
        return Err(ScanError::Configuration(format!(
            "command not allowed: {cmd}"
        )));
    }

    info!(command = cmd, args = ?redacted(args), "audit: launching external tool");
    let child = Command::new(cmd)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ScanError::unavailable(tool, format!("{cmd} not found")),
            ErrorKind::PermissionDenied => ScanError::PermissionDenied { tool },
            _ => ScanError::unavailable(tool, format!("failed to spawn {cmd}: {e}")),
        })?;

    let out = timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
        .await
        .map_err(|_| ScanError::unavailable(tool, format!("{cmd} timed out after {timeout_secs}s")))?
        .map_err(|e| ScanError::unavailable(tool, format!("{cmd} failed: {e}")))?;

    Ok(CommandOutput {
        success: out.status.success(),
        stdout: String::from_utf8_lossy(&out.stdout).to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).to_string(),
    })
}
