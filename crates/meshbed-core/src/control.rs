//! Control-protocol client.
//!
//! The control channel is an opaque command/response collaborator: the core
//! only needs "send a command, get a value back or fail". Commands are single
//! comma-separated lines; the device answers with status lines, the last of
//! which carries a comma-separated key/value payload.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ControlError, Result};

/// Default timeout for one command/response exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 10;

/// Request/response operations a device's control endpoint provides.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Query a device parameter by name (e.g. `ALid`).
    async fn dev_get_parameter(&self, name: &str) -> Result<String>;

    /// Send a raw command and return the completion payload.
    async fn cmd_reply(&self, command: &str) -> Result<String>;

    /// Ask the device to send a 1905.1 message to `dest_mac`.
    async fn dev_send_1905(&self, dest_mac: &str, message_type: u16, tlvs: &str) -> Result<String>;

    /// Start WPS registration on the given band.
    async fn start_wps_registration(&self, band: &str) -> Result<String>;
}

/// TCP implementation of the control channel.
///
/// One connection per exchange: connect, send the command line, read status
/// lines until the device reports completion or a terminal error.
#[derive(Debug, Clone)]
pub struct CapiSocket {
    host: String,
    port: u16,
    timeout_secs: u64,
}

impl CapiSocket {
    /// Create a client for the control endpoint at `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_secs: DEFAULT_EXCHANGE_TIMEOUT_SECS,
        }
    }

    /// Override the exchange timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Endpoint as `host:port`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// One command/response exchange. Returns the payload following the
    /// completion status.
    pub async fn exchange(&self, command: &str) -> Result<String> {
        let endpoint = self.endpoint();
        debug!(endpoint = %endpoint, command, "control exchange");
        let fut = async {
            let stream =
                TcpStream::connect(&endpoint)
                    .await
                    .map_err(|e| ControlError::Connect {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    })?;
            let (read, mut write) = stream.into_split();
            write.write_all(command.as_bytes()).await?;
            write.write_all(b"\r\n").await?;

            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() || line.starts_with("status,RUNNING") {
                    continue;
                }
                if let Some(payload) = line.strip_prefix("status,COMPLETE") {
                    return Ok(payload.trim_start_matches(',').trim().to_string());
                }
                if line.starts_with("status,") {
                    return Err(ControlError::CommandFailed(line.to_string()).into());
                }
            }
            Err(ControlError::CommandFailed(
                "connection closed before completion".to_string(),
            )
            .into())
        };

        match timeout(Duration::from_secs(self.timeout_secs), fut).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout(self.timeout_secs).into()),
        }
    }
}

/// Look up `name` in a comma-separated key/value payload.
fn parameter_from_payload(payload: &str, name: &str) -> Option<String> {
    let fields: Vec<&str> = payload.split(',').map(str::trim).collect();
    fields
        .chunks_exact(2)
        .find(|pair| pair[0].eq_ignore_ascii_case(name) || pair[0].eq_ignore_ascii_case("parameter"))
        .map(|pair| pair[1].to_string())
}

#[async_trait]
impl ControlChannel for CapiSocket {
    async fn dev_get_parameter(&self, name: &str) -> Result<String> {
        let payload = self
            .exchange(&format!("dev_get_parameter,parameter,{name}"))
            .await?;
        parameter_from_payload(&payload, name)
            .ok_or_else(|| ControlError::MissingParameter(name.to_string()).into())
    }

    async fn cmd_reply(&self, command: &str) -> Result<String> {
        self.exchange(command).await
    }

    async fn dev_send_1905(&self, dest_mac: &str, message_type: u16, tlvs: &str) -> Result<String> {
        let mut command = format!("dev_send_1905,destalid,{dest_mac},messagetypevalue,{message_type:#06x}");
        if !tlvs.is_empty() {
            command.push(',');
            command.push_str(tlvs);
        }
        self.exchange(&command).await
    }

    async fn start_wps_registration(&self, band: &str) -> Result<String> {
        self.exchange(&format!("start_wps_registration,band,{band},WpsConfigMethod,PBC"))
            .await
    }
}
