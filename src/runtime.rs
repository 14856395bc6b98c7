use anyhow::{Context, Result};
use std::process::{Command, Output, Stdio};
use tracing::debug;

const INSTALL_HINT: &str = "\
Docker is not installed.\n\
Install it from: https://docs.docker.com/get-docker/";

const NOT_RUNNING_HINT: &str = "\
Docker is installed but the daemon is not running.\n\
On macOS: open Docker Desktop from Applications.\n\
On Linux: run 'sudo systemctl start docker'.";

/// Distinguishes between container-runtime install states.
pub enum RuntimeState {
    /// Binary not found on PATH.
    NotInstalled,
    /// Binary found but the daemon is not accepting commands.
    NotRunning,
    /// Binary found and the daemon answers.
    Available,
}

/// Capability seam over the container runtime: everything the linker needs
/// from the platform is "run one runtime subcommand and give me the output".
/// Tests substitute a scripted fake; production uses [`DockerCli`].
pub trait ContainerRuntime: Send + Sync {
    /// Run a single runtime subcommand (e.g. `["stop", "signal-api"]`),
    /// capturing stdout/stderr.
    fn run(&self, args: &[&str]) -> Result<Output>;

    /// Probe whether the runtime can accept commands at all.
    fn state(&self) -> RuntimeState;
}

/// The real `docker` CLI.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use an alternative runtime binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerCli {
    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run '{} {}'", self.binary, args.join(" ")))
    }

    fn state(&self) -> RuntimeState {
        if which::which(&self.binary).is_err() {
            return RuntimeState::NotInstalled;
        }
        // `docker info` exits non-zero when the daemon is unreachable.
        let Ok(output) = Command::new(&self.binary)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
        else {
            return RuntimeState::NotInstalled;
        };
        if output.status.success() {
            RuntimeState::Available
        } else {
            RuntimeState::NotRunning
        }
    }
}

/// Remediation text for a runtime that is not usable, or `Ok(())` if it is.
pub fn require_available(runtime: &dyn ContainerRuntime) -> Result<(), String> {
    match runtime.state() {
        RuntimeState::NotInstalled => Err(INSTALL_HINT.to_string()),
        RuntimeState::NotRunning => Err(NOT_RUNNING_HINT.to_string()),
        RuntimeState::Available => Ok(()),
    }
}
