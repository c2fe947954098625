//! Local Docker backend
//!
//! Each service runs in a container named `sparkvisor_svc_<service_id>` with
//! the dev server's port published on `port_start + service_id`. Everything
//! goes through the `docker` CLI, so no daemon socket client is needed.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Sandbox, SandboxError, SandboxProvider};
use crate::store::{Service, ServiceKind};

/// Path fragments excluded from file listings
const IGNORED_PATH_PARTS: &[&str] = &[
    "node_modules",
    ".git",
    ".next",
    "build",
    "tmp",
    "__pycache__",
    ".venv",
    "venv",
    "env",
    ".mypy_cache",
    ".pytest_cache",
    ".cache",
    ".DS_Store",
    "Thumbs.db",
];

const IGNORED_EXTENSIONS: &[&str] = &[".pyc", ".pyd", ".pyo", ".pyi"];

/// Creates containers for services, or attaches to existing ones
#[derive(Debug, Clone)]
pub struct DockerProvider {
    binary: String,
    port_start: u16,
    container_port: u16,
}

impl DockerProvider {
    /// # Arguments
    /// * `port_start` - Host port for service id 0; each service adds its id
    /// * `container_port` - Port the dev server listens on inside the container
    pub fn new(port_start: u16, container_port: u16) -> Self {
        Self {
            binary: "docker".to_string(),
            port_start,
            container_port,
        }
    }

    pub fn container_name(service: &Service) -> String {
        format!("sparkvisor_svc_{}", service.id)
    }

    fn host_port(&self, service: &Service) -> Result<u16, SandboxError> {
        u16::try_from(service.id)
            .ok()
            .and_then(|id| self.port_start.checked_add(id))
            .ok_or_else(|| {
                SandboxError::Backend(format!("no host port available for service {}", service.id))
            })
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Backend(format!("{} {}: {}", self.binary, args[0], e)))
    }

    /// `Some(state)` if a container with this name exists
    async fn container_state(&self, name: &str) -> Result<Option<String>, SandboxError> {
        let output = self
            .docker(&["inspect", "--format", "{{.State.Status}}", name])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if state.is_empty() { None } else { Some(state) })
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn create_or_attach(&self, service: &Service) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let name = Self::container_name(service);
        let host_port = self.host_port(service)?;

        match self.container_state(&name).await?.as_deref() {
            Some("running") => debug!(container = %name, "attaching to running container"),
            Some(state) => {
                info!(container = %name, state, "starting existing container");
                let output = self.docker(&["start", &name]).await?;
                if !output.status.success() {
                    return Err(SandboxError::Backend(
                        String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    ));
                }
            }
            None => {
                info!(container = %name, image = %service.stack.image, host_port, "creating container");
                let ports = format!("{}:{}", host_port, self.container_port);
                let start = service
                    .stack
                    .start_command
                    .clone()
                    .unwrap_or_else(|| "npm run dev".to_string());
                let output = self
                    .docker(&[
                        "run", "-d", "-t", "--name", &name, "-p", &ports, &service.stack.image, "sh",
                        "-c", &start,
                    ])
                    .await?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    if stderr.contains("Unable to find image") || stderr.contains("pulling") {
                        return Err(SandboxError::NotReady(stderr));
                    }
                    return Err(SandboxError::Backend(stderr));
                }
            }
        }

        let workdir = match service.kind {
            ServiceKind::Frontend => "/frontend",
            ServiceKind::Backend => "/app",
        };

        Ok(Arc::new(DockerSandbox {
            binary: self.binary.clone(),
            container_name: name,
            host_port,
            workdir: workdir.to_string(),
        }))
    }
}

/// Handle to one service container
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    binary: String,
    container_name: String,
    host_port: u16,
    workdir: String,
}

/// Outcome of one script run inside the container
struct ExecOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl ExecOutput {
    fn combined(mut self) -> String {
        self.stdout.push_str(&self.stderr);
        self.stdout
    }

    /// Stdout, or `SandboxError::Command` when the script exited non-zero
    fn checked(self, what: &str) -> Result<String, SandboxError> {
        if self.success {
            return Ok(self.stdout);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(SandboxError::Command(format!("{}: {}", what, detail)))
    }
}

impl DockerSandbox {
    async fn exec(&self, script: &str) -> Result<ExecOutput, SandboxError> {
        let output = Command::new(&self.binary)
            .args(["exec", &self.container_name, "sh", "-c", script])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Backend(format!("{} exec: {}", self.binary, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success()
            && (stderr.contains("No such container") || stderr.contains("is not running"))
        {
            return Err(SandboxError::NotReady(stderr.trim().to_string()));
        }

        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn is_up(&self) -> bool {
        TcpStream::connect(("127.0.0.1", self.host_port)).await.is_ok()
    }

    /// Combined output whatever the exit status; the agent reads failures
    /// from the text
    async fn run_command(&self, command: &str, workdir: Option<&str>) -> Result<String, SandboxError> {
        let dir = workdir.unwrap_or("/app");
        let output = self.exec(&format!("cd {} && {}", shell_quote(dir), command)).await?;
        Ok(output.combined())
    }

    async fn get_file_paths(&self) -> Result<Vec<String>, SandboxError> {
        let script = format!("cd {} && find . -type f", shell_quote(&self.workdir));
        let output = self.exec(&script).await?;
        if !output.success {
            return Err(SandboxError::FileNotFound(self.workdir.clone()));
        }
        Ok(filter_file_listing(&self.workdir, &output.stdout))
    }

    async fn read_file(&self, path: &str, missing_ok: bool) -> Result<String, SandboxError> {
        let output = self.exec(&format!("cat {}", shell_quote(path))).await?;
        if !output.success && output.stderr.contains("No such file") {
            if missing_ok {
                return Ok(String::new());
            }
            return Err(SandboxError::FileNotFound(path.to_string()));
        }
        output.checked(&format!("read {}", path))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let quoted = shell_quote(path);
        let script = format!(
            "mkdir -p \"$(dirname {path})\" && echo \"{data}\" | base64 -d > {path}",
            path = quoted,
            data = encoded
        );
        self.exec(&script).await?.checked(&format!("write {}", path))?;
        Ok(())
    }

    async fn commit_changes(&self, message: &str) -> Result<(), SandboxError> {
        let dir = shell_quote(&self.workdir);
        self.exec(&format!("cd {} && git add -A", dir))
            .await?
            .checked("git add")?;
        let output = self
            .exec(&format!("cd {} && git commit -m {}", dir, shell_quote(message)))
            .await?;
        if !output.success && output.stdout.contains("nothing to commit") {
            debug!(container = %self.container_name, "nothing to commit");
            return Ok(());
        }
        output.checked("git commit")?;
        Ok(())
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        let _ = Command::new(&self.binary)
            .args(["stop", &self.container_name])
            .output()
            .await;
        let output = Command::new(&self.binary)
            .args(["rm", "-f", &self.container_name])
            .output()
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn preview_url(&self) -> Option<String> {
        Some(format!("http://localhost:{}", self.host_port))
    }
}

/// Turn `find . -type f` output into sorted absolute paths, minus build
/// artifacts, caches and VCS internals
pub fn filter_file_listing(workdir: &str, find_output: &str) -> Vec<String> {
    let mut paths: Vec<String> = find_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !IGNORED_PATH_PARTS.iter().any(|part| line.contains(part)))
        .filter(|line| !IGNORED_EXTENSIONS.iter().any(|ext| line.ends_with(ext)))
        .map(|line| format!("{}{}", workdir, line.strip_prefix('.').unwrap_or(line)))
        .collect();
    paths.sort();
    paths
}

/// Single-quote a string for `sh -c`
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
