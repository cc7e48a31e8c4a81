//! Spawning and tearing down kernel processes

use super::config::KernelConfig;
use crate::Result;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Interval between connection attempts while waiting on a port
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a process gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

const CONFIG_FILE: &str = "config.yaml";

#[cfg(windows)]
const BINARY_NAME: &str = "mihomo.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "mihomo";

/// Locating the kernel executable
pub struct KernelBinary;

impl KernelBinary {
    /// Use `explicit` if given, otherwise the first default location that exists.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.is_file() {
                ensure_executable(path);
                return Ok(path.to_path_buf());
            }
            return Err(anyhow!("kernel binary not found at {}", path.display()));
        }

        let candidates = Self::default_locations();
        candidates
            .iter()
            .find(|p| p.is_file())
            .map(|p| {
                ensure_executable(p);
                p.clone()
            })
            .ok_or_else(|| {
                anyhow!(
                    "kernel binary not found; pass --kernel or place {} at {}",
                    BINARY_NAME,
                    candidates
                        .first()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                )
            })
    }

    /// Working directory, home directory, then system locations.
    pub fn default_locations() -> Vec<PathBuf> {
        let mut locations = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            locations.push(cwd.join(BINARY_NAME));
        }
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from);
        if let Some(home) = &home {
            locations.push(home.join(BINARY_NAME));
            locations.push(home.join("mihomo").join(BINARY_NAME));
        }
        if cfg!(windows) {
            locations.push(PathBuf::from(r"C:\mihomo").join(BINARY_NAME));
        } else {
            locations.push(PathBuf::from("/usr/local/bin").join(BINARY_NAME));
            if let Some(home) = &home {
                locations.push(home.join(".local").join("bin").join(BINARY_NAME));
            }
        }
        locations
    }
}

#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.mode() & 0o111 == 0 {
            perms.set_mode(0o755);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!(path = %path.display(), error = %e, "could not mark kernel executable");
            }
        }
    }
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) {}

/// A running kernel bound to a private working directory.
///
/// Call [`KernelProcess::terminate`] on every normal path. If the handle is
/// dropped instead (early return, panic), the child is killed and the working
/// directory removed by their own destructors.
pub struct KernelProcess {
    child: Child,
    workdir: TempDir,
    pid: Option<u32>,
}

impl KernelProcess {
    /// Write `config` into a fresh temporary directory and start the kernel on it.
    pub async fn spawn(binary: &Path, config: &KernelConfig) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("node-probe-")
            .tempdir()
            .context("failed to create kernel working directory")?;
        let config_path = workdir.path().join(CONFIG_FILE);
        tokio::fs::write(&config_path, config.render())
            .await
            .with_context(|| format!("failed to write {}", config_path.display()))?;

        let mut child = Command::new(binary)
            .arg("-d")
            .arg(workdir.path())
            .arg("-f")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", binary.display()))?;

        let pid = child.id();
        info!(
            pid = pid.unwrap_or_default(),
            mixed_port = config.mixed_port(),
            controller_port = config.controller_port(),
            nodes = config.nodes().len(),
            "kernel started"
        );

        if let Some(stderr) = child.stderr.take() {
            let pid = pid.unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    forward_log_line(pid, &line);
                }
            });
        }

        Ok(Self {
            child,
            workdir,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Graceful-then-forceful shutdown, then removal of the working directory.
    pub async fn terminate(self) {
        let Self {
            mut child,
            workdir,
            pid,
        } = self;

        let mut exited = false;
        if let Some(pid) = child.id() {
            if signal_terminate(pid) {
                exited = timeout(TERMINATE_GRACE, child.wait()).await.is_ok();
            }
        }
        if !exited {
            if let Err(e) = child.kill().await {
                debug!(pid = pid.unwrap_or_default(), error = %e, "kill failed");
            }
        }

        let path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            warn!(path = %path.display(), error = %e, "failed to remove kernel working directory");
        }
        info!(pid = pid.unwrap_or_default(), "kernel stopped");
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. `pid` comes from
    // `Child::id`, which is `None` once the child is reaped, so it is still ours.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    false
}

fn forward_log_line(pid: u32, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line.contains("level=error") || line.contains("level=fatal") {
        error!(pid, "{}", line);
    } else if line.contains("level=warn") {
        warn!(pid, "{}", line);
    } else {
        trace!(pid, "{}", line);
    }
}

/// Poll until `127.0.0.1:<port>` accepts a connection or `max_wait` elapses.
pub async fn wait_for_port(port: u16, max_wait: Duration) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        if let Ok(Ok(_)) = timeout(POLL_INTERVAL, TcpStream::connect(("127.0.0.1", port))).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Poll until nothing accepts connections on `127.0.0.1:<port>` any more, so a
/// previous kernel has let go of it.
pub async fn wait_for_release(port: u16, max_wait: Duration) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        match timeout(POLL_INTERVAL, TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(_)) => {}
            _ => return true,
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}
