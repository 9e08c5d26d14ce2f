use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::catalog::{ServiceCatalog, ServiceDescriptor};
use crate::errors::ServiceError;
use crate::platform::{self, ProcessControl};
use crate::probe::PortProbe;
use crate::registry::ProcessRegistry;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    Starting,
    Unknown,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Unknown => "unknown",
        };
        write!(f, "{value}")
    }
}

/// Point-in-time view of one service. Recomputed on every query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceStatus {
    pub service_name: String,
    pub display_name: String,
    pub port: u16,
    pub description: String,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceStatus {
    fn new(service: &ServiceDescriptor, state: ServiceState) -> Self {
        Self {
            service_name: service.name.clone(),
            display_name: service.display_name.clone(),
            port: service.port,
            description: service.description.clone(),
            state,
            pid: None,
            cpu_percent: None,
            memory_mb: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Per-process resource inspection. `None` when the process vanished or
/// cannot be inspected.
pub trait ProcessInspector: Send + Sync {
    fn inspect(&self, pid: u32) -> Option<ProcessMetrics>;
}

/// Inspector backed by a long-lived `sysinfo::System`, so CPU usage is the
/// delta since the previous query of the same process.
pub struct SysinfoInspector {
    system: Mutex<System>,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn inspect(&self, pid: u32) -> Option<ProcessMetrics> {
        let mut system = self.system.lock().ok()?;
        let sys_pid = SysPid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system.process(sys_pid).map(|process| ProcessMetrics {
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        })
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    catalog: Arc<ServiceCatalog>,
    registry: Arc<ProcessRegistry>,
    probe: Arc<dyn PortProbe>,
    processes: Arc<dyn ProcessControl>,
    inspector: Arc<dyn ProcessInspector>,
}

impl StatusReporter {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        registry: Arc<ProcessRegistry>,
        probe: Arc<dyn PortProbe>,
        processes: Arc<dyn ProcessControl>,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        Self {
            catalog,
            registry,
            probe,
            processes,
            inspector,
        }
    }

    pub async fn get_status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        let service = self.catalog.get(name)?.clone();
        Ok(self.describe_blocking(service).await)
    }

    /// Status of every catalog service, in catalog order. Services are
    /// described concurrently; a failing port check only degrades its own
    /// record.
    pub async fn get_status_all(&self) -> Vec<ServiceStatus> {
        let pending: Vec<_> = self
            .catalog
            .iter()
            .map(|service| {
                let reporter = self.clone();
                let service = service.clone();
                tokio::spawn(async move { reporter.describe_blocking(service).await })
            })
            .collect();

        let mut statuses = Vec::with_capacity(pending.len());
        for (service, handle) in self.catalog.iter().zip(pending) {
            match handle.await {
                Ok(status) => statuses.push(status),
                Err(err) => {
                    statuses.push(unknown(service, format!("status task failed: {err}")));
                }
            }
        }
        statuses
    }

    /// Runs `describe` on the blocking pool, since socket enumeration and
    /// process inspection block on the OS.
    async fn describe_blocking(&self, service: ServiceDescriptor) -> ServiceStatus {
        let reporter = self.clone();
        let fallback = service.clone();
        tokio::task::spawn_blocking(move || reporter.describe(&service))
            .await
            .unwrap_or_else(|err| unknown(&fallback, format!("status task failed: {err}")))
    }

    fn describe(&self, service: &ServiceDescriptor) -> ServiceStatus {
        let listening = match self.probe.is_listening(service.port) {
            Ok(listening) => listening,
            Err(err) => {
                warn!(
                    "status check for {} on port {} failed: {err}",
                    service.name, service.port
                );
                return unknown(service, format!("failed to probe port {}: {err}", service.port));
            }
        };

        let tracked_pid = self.live_tracked_pid(service);

        if !listening {
            return match tracked_pid {
                Some(_) => ServiceStatus::new(service, ServiceState::Starting),
                None => ServiceStatus::new(service, ServiceState::Stopped),
            };
        }

        let mut status = ServiceStatus::new(service, ServiceState::Running);
        let pid = self
            .probe
            .find_listener_pid(service.port)
            .or(tracked_pid);
        status.pid = pid;

        if let Some(pid) = pid {
            match self.inspector.inspect(pid) {
                Some(metrics) => {
                    status.cpu_percent = Some(metrics.cpu_percent);
                    status.memory_mb = Some(metrics.memory_mb);
                }
                None => debug!("pid {pid} of {} could not be inspected", service.name),
            }
        }

        status
    }

    fn live_tracked_pid(&self, service: &ServiceDescriptor) -> Option<u32> {
        let entry = match self.registry.get(&service.name) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("failed to read registry entry for {}: {err:#}", service.name);
                return None;
            }
        };
        entry
            .flatten()
            .filter(|pid| platform::runs_service(self.processes.as_ref(), service, *pid))
    }
}

fn unknown(service: &ServiceDescriptor, error: String) -> ServiceStatus {
    let mut status = ServiceStatus::new(service, ServiceState::Unknown);
    status.error = Some(error);
    status
}
