use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a lifecycle operation. Every variant maps to exactly one
/// [`ErrorKind`] so callers never have to parse messages.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("service {name} is already running on port {port}")]
    AlreadyRunning { name: String, port: u16 },
    #[error("service {0} is not running")]
    NotRunning(String),
    #[error("service {name} (pid {pid}) did not exit in time; retry with force")]
    NotResponding { name: String, pid: u32 },
    #[error("service {name} stopped but port {port} is still occupied")]
    PortOccupied { name: String, port: u16 },
    #[error("service {name} stopped but port {port} was re-occupied, possibly by an external supervisor{}", listener_suffix(.listener))]
    PossibleAutoRestart {
        name: String,
        port: u16,
        listener: Option<u32>,
    },
    #[error("refusing to stop {0}: it hosts this manager")]
    SelfStopForbidden(String),
    #[error("failed to launch service {name}: {message}")]
    SpawnFailure { name: String, message: String },
    #[error("failed to probe port {port}: {message}")]
    ProbeFailure { port: u16, message: String },
    #[error("failed to stop service {name} via {target}: {message}")]
    SignalFailure {
        name: String,
        target: String,
        message: String,
    },
}

fn listener_suffix(listener: &Option<u32>) -> String {
    listener
        .map(|pid| format!(" (listener pid {pid})"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownService,
    AlreadyRunning,
    NotRunning,
    NotResponding,
    PortOccupied,
    PossibleAutoRestart,
    SelfStopForbidden,
    SpawnFailure,
    ProbeFailure,
    SignalFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ErrorKind::UnknownService => "unknown_service",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::NotResponding => "not_responding",
            ErrorKind::PortOccupied => "port_occupied",
            ErrorKind::PossibleAutoRestart => "possible_auto_restart",
            ErrorKind::SelfStopForbidden => "self_stop_forbidden",
            ErrorKind::SpawnFailure => "spawn_failure",
            ErrorKind::ProbeFailure => "probe_failure",
            ErrorKind::SignalFailure => "signal_failure",
        };
        write!(f, "{value}")
    }
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::UnknownService => 404,
            ErrorKind::SelfStopForbidden => 403,
            ErrorKind::AlreadyRunning
            | ErrorKind::NotRunning
            | ErrorKind::PortOccupied
            | ErrorKind::PossibleAutoRestart => 409,
            ErrorKind::NotResponding => 503,
            ErrorKind::SpawnFailure | ErrorKind::ProbeFailure | ErrorKind::SignalFailure => 500,
        }
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::UnknownService(_) => ErrorKind::UnknownService,
            ServiceError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            ServiceError::NotRunning(_) => ErrorKind::NotRunning,
            ServiceError::NotResponding { .. } => ErrorKind::NotResponding,
            ServiceError::PortOccupied { .. } => ErrorKind::PortOccupied,
            ServiceError::PossibleAutoRestart { .. } => ErrorKind::PossibleAutoRestart,
            ServiceError::SelfStopForbidden(_) => ErrorKind::SelfStopForbidden,
            ServiceError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            ServiceError::ProbeFailure { .. } => ErrorKind::ProbeFailure,
            ServiceError::SignalFailure { .. } => ErrorKind::SignalFailure,
        }
    }
}
