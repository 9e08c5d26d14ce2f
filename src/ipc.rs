use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::errors::{ErrorKind, ServiceError};
use crate::lifecycle::{StartReport, StopReport};
use crate::status::ServiceStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Ping,
    Shutdown,
    List,
    Status {
        name: String,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        operator: Option<String>,
    },
    Restart {
        name: String,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        operator: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub ok: bool,
    pub message: String,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub statuses: Vec<ServiceStatus>,
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    #[serde(default)]
    pub start: Option<StartReport>,
    #[serde(default)]
    pub stop: Option<StopReport>,
}

impl IpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            error_kind: None,
            statuses: Vec::new(),
            status: None,
            start: None,
            stop: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            ..Self::ok(message)
        }
    }

    pub fn service_error(err: &ServiceError) -> Self {
        Self {
            error_kind: Some(err.kind()),
            ..Self::error(err.to_string())
        }
    }
}

pub async fn send_request(daemon_addr: &str, request: &IpcRequest) -> Result<IpcResponse> {
    let mut stream = TcpStream::connect(daemon_addr)
        .await
        .with_context(|| format!("failed to connect to daemon at {daemon_addr}"))?;
    write_json_line(&mut stream, request).await?;
    read_json_line(&mut stream).await
}

pub async fn read_json_line<T, S>(stream: &mut S) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read from IPC stream")?;

    if bytes == 0 {
        anyhow::bail!("daemon closed IPC connection unexpectedly");
    }

    serde_json::from_str::<T>(line.trim_end())
        .context("failed to decode daemon response/request payload")
}

pub async fn write_json_line<T, S>(stream: &mut S, value: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(value)?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .await
        .context("failed to write IPC payload")?;
    stream
        .flush()
        .await
        .context("failed to flush IPC payload")?;
    Ok(())
}
