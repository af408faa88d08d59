//! Minimal QMP (QEMU Machine Protocol) client.
//!
//! QMP is line-delimited JSON over a Unix socket. Each command opens a
//! fresh connection: read the greeting, negotiate with `qmp_capabilities`,
//! send the command, and read lines until a `return`/`error` arrives
//! (asynchronous event lines are skipped).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Errors raised by the QMP control channel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QmpError {
    /// Connecting or talking to the socket failed.
    #[error("qmp connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// The peer did not speak QMP.
    #[error("qmp protocol error: {0}")]
    Protocol(String),

    /// The command was rejected.
    #[error("qmp command failed ({class}): {desc}")]
    Command {
        /// QMP error class.
        class: String,
        /// Human-readable description.
        desc: String,
    },
}

/// Command line sent to QEMU.
#[derive(Serialize)]
struct QmpCommand<'a> {
    /// Command name.
    execute: &'a str,
    /// Optional arguments object.
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

/// Response line received from QEMU.
#[derive(Deserialize)]
struct QmpResponse {
    /// Success payload.
    #[serde(rename = "return")]
    ret: Option<Value>,
    /// Error payload.
    error: Option<QmpResponseError>,
    /// Present on asynchronous event lines; those are skipped.
    event: Option<String>,
}

/// Error payload of a rejected command.
#[derive(Deserialize)]
struct QmpResponseError {
    /// QMP error class.
    class: String,
    /// Human-readable description.
    desc: String,
}

/// Handle to a VM's QMP control socket.
#[derive(Debug, Clone)]
pub struct QmpClient {
    /// Socket path, created by QEMU with `server=on,wait=off`.
    socket_path: PathBuf,
}

impl QmpClient {
    /// Creates a client for the given control socket.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Runs one command over a fresh connection.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let mut reader = BufReader::new(stream);

        // Greeting: {"QMP": {...}}
        let greeting = read_json_line(&mut reader).await?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::Protocol("missing QMP greeting".into()));
        }

        send_command(&mut reader, "qmp_capabilities", None).await?;
        read_response(&mut reader).await?;

        send_command(&mut reader, command, arguments).await?;
        read_response(&mut reader).await
    }

    /// `query-status` → QEMU run-state string (`running`, `paused`, …).
    pub async fn query_status(&self) -> Result<String, QmpError> {
        let ret = self.execute("query-status", None).await?;
        ret.get("status")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| QmpError::Protocol("query-status without status field".into()))
    }

    /// Asks the guest to power down via ACPI.
    pub async fn system_powerdown(&self) -> Result<(), QmpError> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// Pauses guest execution.
    pub async fn pause(&self) -> Result<(), QmpError> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Resumes guest execution.
    pub async fn resume(&self) -> Result<(), QmpError> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// Terminates QEMU immediately.
    pub async fn quit(&self) -> Result<(), QmpError> {
        self.execute("quit", None).await.map(|_| ())
    }
}

/// Writes one command line.
async fn send_command(
    stream: &mut BufReader<UnixStream>,
    execute: &str,
    arguments: Option<Value>,
) -> Result<(), QmpError> {
    let mut line = serde_json::to_string(&QmpCommand { execute, arguments })
        .map_err(|e| QmpError::Protocol(e.to_string()))?;
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().flush().await?;
    Ok(())
}

/// Reads one JSON line.
async fn read_json_line(stream: &mut BufReader<UnixStream>) -> Result<Value, QmpError> {
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Err(QmpError::Protocol("connection closed".into()));
    }
    serde_json::from_str(&line).map_err(|e| QmpError::Protocol(e.to_string()))
}

/// Reads lines until a command response arrives, skipping event lines.
async fn read_response(stream: &mut BufReader<UnixStream>) -> Result<Value, QmpError> {
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(QmpError::Protocol("connection closed".into()));
        }
        let response: QmpResponse =
            serde_json::from_str(&line).map_err(|e| QmpError::Protocol(e.to_string()))?;
        if response.event.is_some() {
            continue;
        }
        if let Some(err) = response.error {
            return Err(QmpError::Command {
                class: err.class,
                desc: err.desc,
            });
        }
        if let Some(ret) = response.ret {
            return Ok(ret);
        }
        return Err(QmpError::Protocol("response without return or error".into()));
    }
}
