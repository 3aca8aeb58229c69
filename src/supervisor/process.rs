//! OS-process sidecar with an HTTP health endpoint

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};

use super::ManagedProcess;
use crate::{Error, Result};

/// How to launch one sidecar
#[derive(Debug, Clone)]
pub struct SidecarSpec {
    /// Service name
    pub name: String,
    /// Executable or script path
    pub program: PathBuf,
    /// Extra arguments
    pub args: Vec<String>,
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Extra environment
    pub env: Vec<(String, String)>,
}

/// A sidecar running as a child process
pub struct SidecarProcess {
    spec: SidecarSpec,
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    client: reqwest::Client,
}

impl SidecarProcess {
    /// Resolve the launcher for `spec`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the program or its interpreter cannot be found
    pub fn new(spec: SidecarSpec) -> Result<Self> {
        let (program, mut args) = determine_launcher(&spec.program)?;
        which::which(&program)
            .map_err(|e| Error::Config(format!("{}: cannot find {program}: {e}", spec.name)))?;
        if program != spec.program.to_string_lossy() && !spec.program.exists() {
            return Err(Error::Config(format!(
                "{}: script not found: {}",
                spec.name,
                spec.program.display()
            )));
        }
        args.extend(spec.args.iter().cloned());

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            spec,
            program,
            args,
            child: None,
            client,
        })
    }

    fn health_url(&self) -> String {
        format!("http://{}:{}/health", self.spec.host, self.spec.port)
    }
}

/// Pick an interpreter from the script extension
fn determine_launcher(path: &Path) -> Result<(String, Vec<String>)> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let path_str = path
        .to_str()
        .ok_or_else(|| Error::Config(format!("invalid sidecar path: {}", path.display())))?
        .to_string();

    match extension {
        "py" => Ok(("python3".to_string(), vec![path_str])),
        "js" => Ok(("node".to_string(), vec![path_str])),
        "sh" => Ok(("bash".to_string(), vec![path_str])),
        _ => Ok((path_str, vec![])),
    }
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: Option<String>,
    model_loaded: Option<bool>,
}

/// Interpret a `/health` body
///
/// Ready unless the body reports `model_loaded: false` or a non-ok status.
/// Non-JSON bodies count as ready since the endpoint answered.
#[must_use]
pub fn parse_health_body(body: &str) -> bool {
    let Ok(health) = serde_json::from_str::<HealthBody>(body) else {
        return true;
    };
    if health.model_loaded == Some(false) {
        return false;
    }
    match health.status.as_deref() {
        None => true,
        Some(s) => matches!(s.to_ascii_lowercase().as_str(), "ok" | "healthy" | "ready" | "success"),
    }
}

#[async_trait]
impl ManagedProcess for SidecarProcess {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn host(&self) -> &str {
        &self.spec.host
    }

    fn port(&self) -> u16 {
        self.spec.port
    }

    async fn spawn(&mut self) -> Result<Option<u32>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Supervisor(format!("failed to spawn {}: {e}", self.spec.name)))?;

        let pid = child.id();
        tracing::debug!(service = %self.spec.name, ?pid, program = %self.program, "sidecar spawned");
        self.child = Some(child);
        Ok(pid)
    }

    async fn probe(&self) -> Result<bool> {
        let response = self.client.get(self.health_url()).send().await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body = response.text().await?;
        Ok(parse_health_body(&body))
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let status = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status()
                .await?;
            if status.success() {
                return Ok(());
            }
        }

        child.start_kill()?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(service = %self.spec.name, %status, "sidecar exited");
                self.child = None;
                false
            }
            Err(_) => false,
        }
    }
}
