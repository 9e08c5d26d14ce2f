use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{ExternalManager, ServiceCatalog, ServiceDescriptor};
use crate::errors::ServiceError;
use crate::platform::{self, ProcessControl};
use crate::probe::PortProbe;
use crate::registry::ProcessRegistry;

/// Bounds for every wait the controller performs. None of these are
/// protocol constants; they only trade responsiveness for patience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    pub release_timeout: Duration,
    pub auto_restart_window: Duration,
    pub restart_settle: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            release_timeout: Duration::from_secs(5),
            auto_restart_window: Duration::from_secs(3),
            restart_settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Running,
    /// Launched, but the port did not become live within the start timeout.
    Starting,
}

impl std::fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            StartOutcome::Running => "running",
            StartOutcome::Starting => "starting",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartReport {
    pub service_name: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub status: StartOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopReport {
    pub service_name: String,
    pub pid: Option<u32>,
    pub status: StopOutcome,
    pub port_free: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub adopted: Vec<(String, u32)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.adopted.is_empty()
    }
}

enum BindWait {
    Live,
    Pending,
    Exited,
}

/// Start/stop/restart state machine. Operations on the same service are
/// serialised by a per-name lock; different services proceed in parallel.
pub struct LifecycleController {
    catalog: Arc<ServiceCatalog>,
    registry: Arc<ProcessRegistry>,
    probe: Arc<dyn PortProbe>,
    processes: Arc<dyn ProcessControl>,
    timings: LifecycleTimings,
    locks: HashMap<String, Mutex<()>>,
}

impl LifecycleController {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        registry: Arc<ProcessRegistry>,
        probe: Arc<dyn PortProbe>,
        processes: Arc<dyn ProcessControl>,
        timings: LifecycleTimings,
    ) -> Self {
        let locks = catalog
            .iter()
            .map(|service| (service.name.clone(), Mutex::new(())))
            .collect();

        Self {
            catalog,
            registry,
            probe,
            processes,
            timings,
            locks,
        }
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub async fn start(&self, name: &str) -> Result<StartReport, ServiceError> {
        let service = self.catalog.get(name)?;
        let _guard = self.lock_for(name)?.lock().await;
        self.start_locked(service).await
    }

    pub async fn stop(
        &self,
        name: &str,
        force: bool,
        operator: Option<&str>,
    ) -> Result<StopReport, ServiceError> {
        let service = self.catalog.get(name)?;
        let _guard = self.lock_for(name)?.lock().await;
        self.stop_locked(service, force, operator).await
    }

    /// Stop (a service that is not running is fine), settle, start. The
    /// service lock is held throughout so no other operation interleaves.
    pub async fn restart(
        &self,
        name: &str,
        force: bool,
        operator: Option<&str>,
    ) -> Result<StartReport, ServiceError> {
        let service = self.catalog.get(name)?;
        let _guard = self.lock_for(name)?.lock().await;
        info!(
            "restarting service {name}, force={force}, operator={}",
            operator.unwrap_or("unknown")
        );

        match self.stop_locked(service, force, operator).await {
            Ok(_) => {}
            Err(ServiceError::NotRunning(_)) => {
                debug!("service {name} was not running; restart continues with start");
            }
            Err(err) => return Err(err),
        }

        sleep(self.timings.restart_settle).await;
        self.start_locked(service).await
    }

    /// Drops registry entries whose process died without being stopped and
    /// records listeners that are running untracked.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for service in self.catalog.iter() {
            let Ok(lock) = self.lock_for(&service.name) else {
                continue;
            };
            let _guard = lock.lock().await;

            let entry = match self.registry.get(&service.name) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("reconcile skipped {}: {err:#}", service.name);
                    continue;
                }
            };

            let recorded = match entry {
                // Owned by an external supervisor.
                Some(None) => continue,
                Some(Some(pid)) => Some(pid),
                None => None,
            };
            if let Some(pid) = recorded {
                if self.runs_service(service, pid).await {
                    continue;
                }
            }

            let listening = match self.listening(service.port).await {
                Ok(listening) => listening,
                Err(err) => {
                    debug!(
                        "reconcile check of port {} for {} failed: {err}",
                        service.port, service.name
                    );
                    continue;
                }
            };

            if listening {
                if let Some(listener) = self.listener_pid(service.port).await {
                    // The port holder is authoritative, even when it was not launched by us.
                    if recorded != Some(listener) {
                        info!(
                            "adopting untracked listener pid {listener} for service {} on port {}",
                            service.name, service.port
                        );
                        self.remember(&service.name, Some(listener));
                        report.adopted.push((service.name.clone(), listener));
                    }
                    continue;
                }
            }

            if let Some(pid) = recorded {
                info!(
                    "removing stale registry entry for {} (pid {pid} is gone or runs something else)",
                    service.name
                );
                self.forget(&service.name);
                report.removed.push(service.name.clone());
            }
        }

        report
    }

    async fn start_locked(&self, service: &ServiceDescriptor) -> Result<StartReport, ServiceError> {
        let name = service.name.as_str();
        if self.is_listening(service.port).await? {
            return Err(ServiceError::AlreadyRunning {
                name: name.to_string(),
                port: service.port,
            });
        }
        if let Some(pid) = self.owned_pid(service).await {
            debug!("service {name} has live pid {pid} that has not bound its port yet");
            return Err(ServiceError::AlreadyRunning {
                name: name.to_string(),
                port: service.port,
            });
        }

        let pid = match (&service.external, &service.launch) {
            (Some(external), _) => {
                self.run_external(external.start_command())
                    .await
                    .map_err(|message| ServiceError::SpawnFailure {
                        name: name.to_string(),
                        message,
                    })?;
                info!("start requested from {} for service {name}", external.label());
                None
            }
            (None, Some(launch)) => {
                info!("starting service {name}: {}", launch.display());
                let pid = self
                    .processes
                    .spawn_detached(name, launch)
                    .map_err(|err| ServiceError::SpawnFailure {
                        name: name.to_string(),
                        message: err.to_string(),
                    })?;
                info!("service {name} spawned with pid {pid}");
                Some(pid)
            }
            (None, None) => {
                return Err(ServiceError::SpawnFailure {
                    name: name.to_string(),
                    message: "no launch command configured".to_string(),
                })
            }
        };
        self.remember(name, pid);

        let status = match self.wait_for_bind(service.port, pid).await {
            BindWait::Live => StartOutcome::Running,
            BindWait::Pending => StartOutcome::Starting,
            BindWait::Exited => {
                self.forget(name);
                return Err(ServiceError::SpawnFailure {
                    name: name.to_string(),
                    message: format!(
                        "process {} exited before binding port {}",
                        pid.unwrap_or_default(),
                        service.port
                    ),
                });
            }
        };
        info!("service {name} start result: {status}");

        Ok(StartReport {
            service_name: name.to_string(),
            pid,
            port: service.port,
            status,
        })
    }

    async fn stop_locked(
        &self,
        service: &ServiceDescriptor,
        force: bool,
        operator: Option<&str>,
    ) -> Result<StopReport, ServiceError> {
        let operator = operator.unwrap_or("unknown");
        let pid = match &service.external {
            Some(external) => self.stop_external(service, external, force, operator).await?,
            None => Some(self.stop_local(service, force, operator).await?),
        };

        self.forget(&service.name);
        self.confirm_release(service).await?;
        info!(
            "service {} stopped and port {} released",
            service.name, service.port
        );

        Ok(StopReport {
            service_name: service.name.clone(),
            pid,
            status: StopOutcome::Stopped,
            port_free: true,
        })
    }

    async fn stop_local(
        &self,
        service: &ServiceDescriptor,
        force: bool,
        operator: &str,
    ) -> Result<u32, ServiceError> {
        let name = service.name.as_str();
        let pid = self.stop_target(service).await?;
        info!("stopping service {name} (pid {pid}), force={force}, operator={operator}");

        self.processes
            .terminate(pid)
            .map_err(|err| signal_failure(name, pid, err))?;
        if self.wait_for_exit(pid, self.timings.stop_timeout).await {
            return Ok(pid);
        }

        if !force {
            warn!("service {name} (pid {pid}) did not exit and force is not set; leaving it running");
            return Err(ServiceError::NotResponding {
                name: name.to_string(),
                pid,
            });
        }

        warn!("service {name} (pid {pid}) did not respond, killing it (force=true)");
        self.processes
            .kill(pid)
            .map_err(|err| signal_failure(name, pid, err))?;
        if self.wait_for_exit(pid, self.timings.kill_grace).await {
            Ok(pid)
        } else {
            Err(ServiceError::NotResponding {
                name: name.to_string(),
                pid,
            })
        }
    }

    async fn stop_external(
        &self,
        service: &ServiceDescriptor,
        external: &ExternalManager,
        force: bool,
        operator: &str,
    ) -> Result<Option<u32>, ServiceError> {
        let name = service.name.as_str();
        if !self.is_listening(service.port).await? {
            return Err(ServiceError::NotRunning(name.to_string()));
        }

        let pid = self.listener_pid(service.port).await;
        info!(
            "stopping service {name} via {}, force={force}, operator={operator}",
            external.label()
        );
        self.run_external(external.stop_command())
            .await
            .map_err(|message| ServiceError::SignalFailure {
                name: name.to_string(),
                target: external.label(),
                message,
            })?;
        Ok(pid)
    }

    /// The process bound to the port wins; the recorded PID is only used
    /// when nothing is listening yet and it still runs the service.
    async fn stop_target(&self, service: &ServiceDescriptor) -> Result<u32, ServiceError> {
        if let Some(pid) = self.listener_pid(service.port).await {
            return Ok(pid);
        }
        if let Some(pid) = self.owned_pid(service).await {
            return Ok(pid);
        }
        if self.is_listening(service.port).await? {
            return Err(ServiceError::PortOccupied {
                name: service.name.clone(),
                port: service.port,
            });
        }
        Err(ServiceError::NotRunning(service.name.clone()))
    }

    /// Waits for the port to be released. When it stays bound, a second
    /// observation window separates slow socket teardown from a relaunch.
    async fn confirm_release(&self, service: &ServiceDescriptor) -> Result<(), ServiceError> {
        let port = service.port;
        if self.wait_for_port(port, false, self.timings.release_timeout).await {
            return Ok(());
        }
        warn!(
            "service {} stopped but port {port} is still occupied",
            service.name
        );

        let deadline = Instant::now() + self.timings.auto_restart_window;
        let mut continuously_occupied = true;
        let occupied = loop {
            let occupied = self.probe_or(port, true).await;
            if !occupied {
                continuously_occupied = false;
            }
            let now = Instant::now();
            if now >= deadline {
                break occupied;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        };

        if !occupied {
            return Ok(());
        }
        if continuously_occupied {
            let listener = self.listener_pid(port).await;
            warn!(
                "service {} may have been relaunched by an external supervisor (listener {:?})",
                service.name, listener
            );
            return Err(ServiceError::PossibleAutoRestart {
                name: service.name.clone(),
                port,
                listener,
            });
        }
        Err(ServiceError::PortOccupied {
            name: service.name.clone(),
            port,
        })
    }

    async fn wait_for_bind(&self, port: u16, pid: Option<u32>) -> BindWait {
        let deadline = Instant::now() + self.timings.start_timeout;
        loop {
            if self.probe_or(port, false).await {
                return BindWait::Live;
            }
            if let Some(pid) = pid {
                if !self.is_alive(pid).await {
                    return BindWait::Exited;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return BindWait::Pending;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_for_port(&self, port: u16, listening: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe_or(port, !listening).await == listening {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive(pid).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn is_listening(&self, port: u16) -> Result<bool, ServiceError> {
        self.listening(port)
            .await
            .map_err(|err| ServiceError::ProbeFailure {
                port,
                message: err.to_string(),
            })
    }

    /// Port check inside a polling loop, where a failed check counts as
    /// "not the state we are waiting for".
    async fn probe_or(&self, port: u16, fallback: bool) -> bool {
        match self.listening(port).await {
            Ok(listening) => listening,
            Err(err) => {
                debug!("check of port {port} failed while polling: {err}");
                fallback
            }
        }
    }

    // Socket enumeration and process inspection block on the OS, so they run
    // on the blocking pool rather than a runtime worker.

    async fn listening(&self, port: u16) -> io::Result<bool> {
        let probe = Arc::clone(&self.probe);
        tokio::task::spawn_blocking(move || probe.is_listening(port))
            .await
            .unwrap_or_else(|err| Err(io::Error::other(err)))
    }

    async fn listener_pid(&self, port: u16) -> Option<u32> {
        let probe = Arc::clone(&self.probe);
        tokio::task::spawn_blocking(move || probe.find_listener_pid(port))
            .await
            .unwrap_or_else(|err| {
                warn!("listener lookup for port {port} did not complete: {err}");
                None
            })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let processes = Arc::clone(&self.processes);
        tokio::task::spawn_blocking(move || processes.is_alive(pid))
            .await
            .unwrap_or(false)
    }

    async fn runs_service(&self, service: &ServiceDescriptor, pid: u32) -> bool {
        let processes = Arc::clone(&self.processes);
        let service = service.clone();
        tokio::task::spawn_blocking(move || {
            platform::runs_service(processes.as_ref(), &service, pid)
        })
        .await
        .unwrap_or(false)
    }

    /// Recorded PID of `service`, provided it still runs the service. A
    /// stale record (process gone, or PID reused by something else) is
    /// ignored.
    async fn owned_pid(&self, service: &ServiceDescriptor) -> Option<u32> {
        let pid = self.tracked_pid(&service.name)?;
        if self.runs_service(service, pid).await {
            Some(pid)
        } else {
            debug!("ignoring stale registry pid {pid} for {}", service.name);
            None
        }
    }

    async fn run_external(&self, argv: Vec<String>) -> Result<(), String> {
        let processes = Arc::clone(&self.processes);
        let display = argv.join(" ");
        match tokio::task::spawn_blocking(move || processes.run_external(&argv)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(format!("`{display}` did not complete: {err}")),
        }
    }

    fn lock_for(&self, name: &str) -> Result<&Mutex<()>, ServiceError> {
        self.locks
            .get(name)
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))
    }

    fn tracked_pid(&self, name: &str) -> Option<u32> {
        match self.registry.get(name) {
            Ok(entry) => entry.flatten(),
            Err(err) => {
                warn!("failed to read registry entry for {name}: {err:#}");
                None
            }
        }
    }

    fn remember(&self, name: &str, pid: Option<u32>) {
        if let Err(err) = self.registry.record(name, pid) {
            warn!("failed to record pid for {name}: {err:#}");
        }
    }

    fn forget(&self, name: &str) {
        if let Err(err) = self.registry.remove(name) {
            warn!("failed to remove registry entry for {name}: {err:#}");
        }
    }
}

fn signal_failure(name: &str, pid: u32, err: std::io::Error) -> ServiceError {
    ServiceError::SignalFailure {
        name: name.to_string(),
        target: format!("pid {pid}"),
        message: err.to_string(),
    }
}
