//! Backend command execution.
//!
//! An entity is observed and controlled through one of two backends: a
//! containerized process (commands run inside the container's namespace) or a
//! remote device reachable only through its console. Both expose the same
//! `CommandRunner` capability; everything above this module is
//! backend-agnostic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::WaitConfig;
use crate::console::{PROMPT_RE, PROMPT_TIMEOUT, SharedConsole};
use crate::error::{BackendError, Result};

/// Default timeout for a single backend command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Uniform command-execution capability both backends expose.
///
/// Command failures are propagated to the caller rather than interpreted:
/// callers may need the raw output regardless of exit status, and the core
/// does not understand command semantics beyond transport.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` on the device and return its raw output.
    async fn run(&self, argv: &[&str]) -> Result<String>;
}

/// Containerized backend: commands execute inside the container's namespace
/// via `docker exec`.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    name: String,
    timeout_secs: u64,
}

impl ContainerBackend {
    /// Create a backend for the named container.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }

    /// Create a backend for the named container, tuned by the harness wait
    /// settings.
    #[must_use]
    pub fn from_config(name: impl Into<String>, wait: &WaitConfig) -> Self {
        Self::new(name).with_timeout(wait.command_timeout_secs)
    }

    /// Override the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-command timeout in seconds.
    #[must_use]
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

#[async_trait]
impl CommandRunner for ContainerBackend {
    async fn run(&self, argv: &[&str]) -> Result<String> {
        let mut args = Vec::with_capacity(argv.len() + 2);
        args.push("exec");
        args.push(self.name.as_str());
        args.extend_from_slice(argv);
        run_docker(&args, self.timeout_secs).await
    }
}

/// Console backend: a command is one line sent over the session; the output
/// is everything captured up to the next prompt.
pub struct ConsoleBackend {
    session: SharedConsole,
}

impl ConsoleBackend {
    /// Create a backend over a shared console session.
    #[must_use]
    pub fn new(session: SharedConsole) -> Self {
        Self { session }
    }

    /// Clone the session handle (for log sources sharing this console).
    #[must_use]
    pub fn session(&self) -> SharedConsole {
        Arc::clone(&self.session)
    }
}

#[async_trait]
impl CommandRunner for ConsoleBackend {
    async fn run(&self, argv: &[&str]) -> Result<String> {
        let line = argv.join(" ");
        let mut session = self.session.lock().await;
        session.send_line(&line).await?;
        // A missing prompt is tolerated: the caller still gets whatever
        // output was buffered, same as a non-zero exit on the container side.
        let prompt = session.expect(&PROMPT_RE, PROMPT_TIMEOUT).await?;
        if prompt.is_none() {
            warn!(command = %line, "console prompt not seen after command");
        }
        Ok(session.before().to_string())
    }
}

/// Run a raw container-runtime command with a timeout.
async fn run_docker(args: &[&str], timeout_secs: u64) -> Result<String> {
    let mut cmd = Command::new("docker");
    cmd.args(args);

    let output = match timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
        Ok(result) => result.map_err(|e| categorize_io_error(&e))?,
        Err(_) => return Err(BackendError::Timeout(timeout_secs).into()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(BackendError::CommandFailed(stderr).into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn categorize_io_error(e: &std::io::Error) -> BackendError {
    match e.kind() {
        std::io::ErrorKind::NotFound => BackendError::RuntimeNotFound,
        _ => BackendError::CommandFailed(e.to_string()),
    }
}

/// Resolve the bridge interface of a container network.
///
/// If the first inspection fails the network is assumed not provisioned yet:
/// it is created once and re-inspected. A second failure escalates with the
/// full inspection payload. No further retries.
pub async fn bridge_interface(network: &str) -> Result<String> {
    let payload = match run_docker(&["network", "inspect", network], DEFAULT_COMMAND_TIMEOUT_SECS)
        .await
    {
        Ok(payload) => payload,
        Err(err) => {
            debug!(network, error = %err, "network inspect failed; creating it");
            run_docker(&["network", "create", network], DEFAULT_COMMAND_TIMEOUT_SECS).await?;
            run_docker(&["network", "inspect", network], DEFAULT_COMMAND_TIMEOUT_SECS)
                .await
                .map_err(|err| BackendError::NetworkInspect {
                    name: network.to_string(),
                    payload: err.to_string(),
                })?
        }
    };
    parse_bridge(network, &payload)
}

/// Extract the bridge interface name from a network inspection payload.
///
/// Some container engines add a `plugins` indirection that reports the bridge
/// directly; otherwise the interface name is derived from the network id.
pub fn parse_bridge(network: &str, payload: &str) -> Result<String> {
    let parsed: Value = serde_json::from_str(payload)?;
    let net = parsed.get(0).ok_or_else(|| BackendError::NetworkInspect {
        name: network.to_string(),
        payload: payload.to_string(),
    })?;

    if let Some(bridge) = net.pointer("/plugins/0/bridge").and_then(Value::as_str) {
        return Ok(bridge.to_string());
    }

    let id = net
        .get("Id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BackendError::NetworkInspect {
            name: network.to_string(),
            payload: payload.to_string(),
        })?;
    let short = &id[..id.len().min(12)];
    Ok(format!("br-{short}"))
}
