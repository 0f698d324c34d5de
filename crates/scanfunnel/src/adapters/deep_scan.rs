use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, sync::OnceCell};
use tracing::warn;

use super::{DeepScanEngine, DeepScanSession};
use crate::{
    config::DeepScanConfig,
    error::{Result, ScanError},
    models::{DeepScanResult, TaskProgress},
    parser::gmp,
    security::run_command_allowlisted,
};

const TOOL: &str = "gvm";
const ALLOWED: &[&str] = &["gvm-cli", "/usr/bin/gvm-cli", "/usr/local/bin/gvm-cli"];

/// Carries one GMP command to the manager and returns the raw response XML.
#[async_trait]
pub trait GmpTransport: Send + Sync {
    async fn send(&self, command: &str) -> Result<String>;

    /// Opens the authenticated session every later `send` runs in.
    async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        let reply = self
            .send(&gmp::authenticate_command(username, password))
            .await?;
        gmp::parse_ack(&reply)
    }
}

/// Talks to gvmd over TLS through `gvm-cli`. Credentials reach the CLI
/// through an owner-only gvm-tools config file, never through argv.
pub struct GvmCliTransport {
    cfg: DeepScanConfig,
    credentials_file: OnceCell<PathBuf>,
}

impl GvmCliTransport {
    pub fn new(cfg: DeepScanConfig) -> Self {
        Self {
            cfg,
            credentials_file: OnceCell::new(),
        }
    }

    fn args(&self, config_file: &Path, command: &str) -> Vec<String> {
        vec![
            "--config".to_string(),
            config_file.display().to_string(),
            "--timeout".to_string(),
            self.cfg.timeout_secs.to_string(),
            "tls".to_string(),
            "--hostname".to_string(),
            self.cfg.host.clone(),
            "--port".to_string(),
            self.cfg.port.to_string(),
            "--xml".to_string(),
            command.to_string(),
        ]
    }
}

#[async_trait]
impl GmpTransport for GvmCliTransport {
    async fn send(&self, command: &str) -> Result<String> {
        let config_file = self.credentials_file.get().ok_or_else(|| {
            ScanError::Configuration("gvm-cli used before authentication".into())
        })?;

        let out = run_command_allowlisted(
            TOOL,
            &self.cfg.cli_binary,
            &self.args(config_file, command),
            ALLOWED,
            self.cfg.timeout_secs.saturating_add(10),
        )
        .await?;

        // GMP error responses still come back as XML; let the parser report them.
        if out.success || out.stdout.trim_start().starts_with('<') {
            Ok(out.stdout)
        } else {
            Err(ScanError::unavailable(TOOL, out.stderr.trim()))
        }
    }

    /// gvm-cli logs in on every invocation using the config file, so a
    /// version query is enough to prove the credentials work.
    async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        self.credentials_file
            .get_or_try_init(|| write_credentials_file(credentials_path(), username, password))
            .await?;
        let reply = self.send(gmp::GET_VERSION_COMMAND).await?;
        gmp::parse_ack(&reply)
    }
}

impl Drop for GvmCliTransport {
    fn drop(&mut self) {
        if let Some(path) = self.credentials_file.get() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(error = %e, path = %path.display(), "could not remove gvm-cli credentials file");
            }
        }
    }
}

fn credentials_path() -> PathBuf {
    std::env::temp_dir().join(format!("scanfunnel-gvm-{}.conf", std::process::id()))
}

/// gvm-tools reads its config with Python's configparser, so `%` is escaped
/// and values may not span lines.
fn credentials_file_contents(username: &str, password: &str) -> Result<String> {
    if [username, password].iter().any(|v| v.contains(['\n', '\r'])) {
        return Err(ScanError::Configuration(
            "GVM credentials may not contain line breaks".into(),
        ));
    }
    Ok(format!(
        "[Auth]\ngmp_username={}\ngmp_password={}\n",
        username.replace('%', "%%"),
        password.replace('%', "%%")
    ))
}

async fn write_credentials_file(path: PathBuf, username: &str, password: &str) -> Result<PathBuf> {
    let contents = credentials_file_contents(username, password)?;
    let io_err = |e: std::io::Error| {
        ScanError::Configuration(format!("cannot write {}: {e}", path.display()))
    };

    // A leftover file or link at the path is replaced, never written through.
    match tokio::fs::remove_file(&path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(io_err(e)),
        _ => {}
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&path).await.map_err(io_err)?;
    file.write_all(contents.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(path)
}

pub struct GmpEngine {
    cfg: DeepScanConfig,
    transport: Arc<dyn GmpTransport>,
}

impl GmpEngine {
    pub fn new(cfg: DeepScanConfig, transport: Arc<dyn GmpTransport>) -> Self {
        Self { cfg, transport }
    }

    pub fn from_config(cfg: DeepScanConfig) -> Self {
        let transport = Arc::new(GvmCliTransport::new(cfg.clone()));
        Self::new(cfg, transport)
    }
}

#[async_trait]
impl DeepScanEngine for GmpEngine {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn connect(&self) -> Result<Box<dyn DeepScanSession>> {
        let (user, password) = self.cfg.credentials()?;
        self.transport.authenticate(user, password).await?;

        Ok(Box::new(GmpSession {
            transport: Arc::clone(&self.transport),
            config_id: self.cfg.config_id.clone(),
            scanner_id: self.cfg.scanner_id.clone(),
            port_list_id: self.cfg.port_list_id.clone(),
        }))
    }
}

struct GmpSession {
    transport: Arc<dyn GmpTransport>,
    config_id: String,
    scanner_id: String,
    port_list_id: String,
}

#[async_trait]
impl DeepScanSession for GmpSession {
    async fn create_target(&self, name: &str, hosts: &[String]) -> Result<String> {
        let reply = self
            .transport
            .send(&gmp::create_target_command(name, hosts, &self.port_list_id))
            .await?;
        gmp::parse_created_id(&reply)
    }

    async fn create_task(&self, name: &str, target_id: &str) -> Result<String> {
        let reply = self
            .transport
            .send(&gmp::create_task_command(
                name,
                &self.config_id,
                target_id,
                &self.scanner_id,
            ))
            .await?;
        gmp::parse_created_id(&reply)
    }

    async fn start_task(&self, task_id: &str) -> Result<()> {
        let reply = self.transport.send(&gmp::start_task_command(task_id)).await?;
        gmp::parse_ack(&reply)
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskProgress> {
        let reply = self.transport.send(&gmp::get_task_command(task_id)).await?;
        gmp::parse_task_progress(&reply, task_id)
    }

    async fn get_report(&self, report_id: &str) -> Result<Vec<DeepScanResult>> {
        let reply = self.transport.send(&gmp::get_report_command(report_id)).await?;
        gmp::parse_report(&reply)
    }
}
