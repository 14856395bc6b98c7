//! Lifecycle of the single named bridge container.
//!
//! The container is an idempotent singleton: starting it always replaces any
//! existing instance with the same name, so there is never more than one and
//! never a port conflict. Credentials live on a mounted host volume and
//! survive replacement.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bind::BindAddress;
use crate::runtime::ContainerRuntime;

/// Fixed name of the bridge container.
pub const CONTAINER_NAME: &str = "signal-api";

/// Port the bridge's HTTP API listens on, inside and outside the container.
pub const API_PORT: u16 = 8080;

/// Path inside the container where the credential store is mounted.
const CREDENTIAL_MOUNT: &str = "/home/.local/share/signal-cli";

/// Bridge operating mode, passed via the `MODE` environment value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    /// Pairing-capable mode; serves the QR-link endpoint.
    Normal,
    /// Post-link mode for ongoing bot operation.
    JsonRpc,
}

impl BridgeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeMode::Normal => "normal",
            BridgeMode::JsonRpc => "json-rpc",
        }
    }
}

impl std::fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to launch the bridge container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub bind: BindAddress,
    /// Host directory mounted as the credential store.
    pub volume: PathBuf,
    /// Operating mode for this launch.
    pub mode: BridgeMode,
    /// Mode to switch to when the container is re-bound after a link.
    pub post_link_mode: BridgeMode,
}

impl ContainerSpec {
    /// The `docker run` argument vector for this spec.
    pub fn run_args(&self) -> Vec<String> {
        vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            self.name.clone(),
            "--restart".into(),
            "unless-stopped".into(),
            "-p".into(),
            format!("{}:{}:{}", self.bind, API_PORT, API_PORT),
            "-v".into(),
            format!("{}:{}", self.volume.display(), CREDENTIAL_MOUNT),
            "-e".into(),
            format!("MODE={}", self.mode),
            self.image.clone(),
        ]
    }
}

/// The runtime rejected the container launch.
#[derive(Error, Debug)]
#[error("container runtime rejected the launch: {message}")]
pub struct ContainerStartError {
    pub message: String,
    /// Recent container output, when any exists, for diagnostics.
    pub log_tail: Vec<String>,
}

/// Starts, stops, inspects, and tails logs of the named bridge container.
pub struct ContainerManager<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> ContainerManager<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Stop and remove any container with `name`. Absence is not an error.
    pub fn stop_existing(&self, name: &str) {
        for sub in ["stop", "rm"] {
            match self.runtime.run(&[sub, name]) {
                Ok(output) if !output.status.success() => {
                    // Expected when no such container exists.
                    debug!(
                        "docker {} {}: {}",
                        sub,
                        name,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("docker {} {} failed: {}", sub, name, e),
            }
        }
    }

    /// Launch the bridge container, replacing any existing instance with the
    /// same name first. Returns the container id on success.
    pub fn start(&self, spec: &ContainerSpec) -> Result<String, ContainerStartError> {
        self.stop_existing(&spec.name);

        let args = spec.run_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runtime
            .run(&arg_refs)
            .map_err(|e| ContainerStartError {
                message: e.to_string(),
                log_tail: Vec::new(),
            })?;

        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ContainerStartError {
                message,
                log_tail: self.logs_tail(&spec.name, 20),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// True if a live container with exactly `name` is in the process list.
    pub fn is_running(&self, name: &str) -> bool {
        let filter = format!("name=^{}$", name);
        match self
            .runtime
            .run(&["ps", "--filter", &filter, "--format", "{{.Names}}"])
        {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|l| l.trim() == name),
            _ => false,
        }
    }

    /// Last `n` lines of container output. Empty (never an error) when the
    /// container is missing.
    pub fn logs_tail(&self, name: &str, n: usize) -> Vec<String> {
        let tail = n.to_string();
        match self.runtime.run(&["logs", "--tail", &tail, name]) {
            Ok(output) if output.status.success() => {
                // The bridge writes to both streams; keep them in order seen.
                let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::to_string)
                    .collect();
                lines.extend(
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .map(str::to_string),
                );
                let skip = lines.len().saturating_sub(n);
                lines.split_off(skip)
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::BindAddress;

    fn spec(bind: BindAddress) -> ContainerSpec {
        ContainerSpec {
            name: CONTAINER_NAME.to_string(),
            image: "bbernhard/signal-cli-rest-api:0.93".to_string(),
            bind,
            volume: PathBuf::from("/opt/bot/signal-cli-config"),
            mode: BridgeMode::Normal,
            post_link_mode: BridgeMode::JsonRpc,
        }
    }

    #[test]
    fn run_args_publish_on_chosen_bind() {
        let args = spec(BindAddress::Loopback).run_args();
        assert!(args.contains(&"127.0.0.1:8080:8080".to_string()));

        let args = spec(BindAddress::AllInterfaces).run_args();
        assert!(args.contains(&"0.0.0.0:8080:8080".to_string()));
    }

    #[test]
    fn run_args_mount_credentials_and_set_mode() {
        let args = spec(BindAddress::Loopback).run_args();
        assert!(args
            .contains(&"/opt/bot/signal-cli-config:/home/.local/share/signal-cli".to_string()));
        assert!(args.contains(&"MODE=normal".to_string()));
        assert!(args.contains(&"--restart".to_string()));
        assert!(args.contains(&"unless-stopped".to_string()));
        // Image comes last so flags cannot be swallowed by the runtime.
        assert_eq!(args.last().unwrap(), "bbernhard/signal-cli-rest-api:0.93");
    }

    #[test]
    fn bridge_modes_render_env_values() {
        assert_eq!(BridgeMode::Normal.as_str(), "normal");
        assert_eq!(BridgeMode::JsonRpc.as_str(), "json-rpc");
    }
}
