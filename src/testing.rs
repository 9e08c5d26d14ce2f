//! In-memory host for controller tests: fake processes, fake listeners and
//! a fake supervisor, all driven by the tokio clock so paused-time tests
//! stay deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::catalog::{LaunchCommand, ServiceCatalog, ServiceDescriptor};
use crate::lifecycle::{LifecycleController, LifecycleTimings};
use crate::platform::ProcessControl;
use crate::probe::PortProbe;
use crate::registry::ProcessRegistry;
use crate::status::{ProcessInspector, ProcessMetrics, StatusReporter};
use crate::surface::CommandSurface;

/// How a fake service process reacts once spawned.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Delay before the port is bound; `None` never binds.
    pub bind_delay: Option<Duration>,
    pub ignore_term: bool,
    /// A supervisor relaunches the service as soon as it dies.
    pub respawn_on_exit: bool,
    pub exit_after: Option<Duration>,
    pub spawn_error: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            bind_delay: Some(Duration::ZERO),
            ignore_term: false,
            respawn_on_exit: false,
            exit_after: None,
            spawn_error: false,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeProcess {
    service: Option<String>,
    argv: Vec<String>,
    port: Option<u16>,
    bound_at: Option<Instant>,
    exits_at: Option<Instant>,
    ignore_term: bool,
    respawn_on_exit: bool,
}

#[derive(Debug, Clone)]
struct Occupation {
    port: u16,
    pid: u32,
    from: Instant,
    until: Option<Instant>,
}

#[derive(Debug, Default)]
struct HostState {
    next_pid: u32,
    processes: HashMap<u32, FakeProcess>,
    occupations: Vec<Occupation>,
    ports: HashMap<String, u16>,
    commands: HashMap<String, Vec<String>>,
    behaviors: HashMap<String, Behavior>,
    spawns: HashMap<String, usize>,
    failing_probes: HashSet<u16>,
    uninspectable: HashSet<u32>,
    external_ports: HashMap<String, u16>,
    external_calls: Vec<Vec<String>>,
    probe_calls: usize,
}

impl HostState {
    fn allocate_pid(&mut self) -> u32 {
        self.next_pid += 1;
        self.next_pid
    }

    fn alive(&self, pid: u32, now: Instant) -> bool {
        self.processes
            .get(&pid)
            .map(|process| process.exits_at.map(|at| now < at).unwrap_or(true))
            .unwrap_or(false)
    }

    fn listener(&self, port: u16, now: Instant) -> Option<u32> {
        let managed = self
            .processes
            .iter()
            .filter(|(pid, process)| {
                process.port == Some(port)
                    && process.bound_at.map(|at| now >= at).unwrap_or(false)
                    && self.alive(**pid, now)
            })
            .map(|(pid, _)| *pid)
            .min();
        managed.or_else(|| {
            self.occupations
                .iter()
                .find(|occupation| {
                    occupation.port == port
                        && now >= occupation.from
                        && occupation.until.map(|until| now < until).unwrap_or(true)
                })
                .map(|occupation| occupation.pid)
        })
    }

    fn insert_bound(
        &mut self,
        service: Option<String>,
        argv: Vec<String>,
        port: u16,
        respawn_on_exit: bool,
    ) -> u32 {
        let pid = self.allocate_pid();
        self.processes.insert(
            pid,
            FakeProcess {
                service,
                argv,
                port: Some(port),
                bound_at: Some(Instant::now()),
                exits_at: None,
                ignore_term: false,
                respawn_on_exit,
            },
        );
        pid
    }

    fn end(&mut self, pid: u32) {
        let Some(process) = self.processes.remove(&pid) else {
            return;
        };
        if process.respawn_on_exit {
            if let Some(port) = process.port {
                self.insert_bound(process.service, process.argv, port, true);
            }
        }
    }
}

#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new(catalog: &ServiceCatalog) -> Self {
        let state = HostState {
            next_pid: 1000,
            ports: catalog
                .iter()
                .map(|service| (service.name.clone(), service.port))
                .collect(),
            commands: catalog
                .iter()
                .filter_map(|service| {
                    let launch = service.launch.as_ref()?;
                    Some((service.name.clone(), launch_argv(launch)))
                })
                .collect(),
            ..HostState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("fake host lock poisoned")
    }

    pub fn set_behavior(&self, service: &str, behavior: Behavior) {
        self.state().behaviors.insert(service.to_string(), behavior);
    }

    /// Binds `port` with an unrelated, permanently running process.
    pub fn occupy(&self, port: u16) -> u32 {
        self.state()
            .insert_bound(None, unrelated_argv(port), port, false)
    }

    /// Binds `port` for a window relative to now.
    pub fn occupy_between(&self, port: u16, from: Duration, until: Option<Duration>) -> u32 {
        let now = Instant::now();
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.occupations.push(Occupation {
            port,
            pid,
            from: now + from,
            until: until.map(|until| now + until),
        });
        pid
    }

    /// A live process of `service` that has not bound its port.
    pub fn spawn_unbound(&self, service: &str) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        let port = state.ports.get(service).copied();
        let argv = state.commands.get(service).cloned().unwrap_or_default();
        state.processes.insert(
            pid,
            FakeProcess {
                service: Some(service.to_string()),
                argv,
                port,
                bound_at: None,
                exits_at: None,
                ignore_term: false,
                respawn_on_exit: false,
            },
        );
        pid
    }

    /// Supervisor program/unit `target` binds `port` when started.
    pub fn bind_external(&self, target: &str, port: u16) {
        self.state()
            .external_ports
            .insert(target.to_string(), port);
    }

    pub fn fail_probe(&self, port: u16) {
        self.state().failing_probes.insert(port);
    }

    pub fn hide_from_inspection(&self, pid: u32) {
        self.state().uninspectable.insert(pid);
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.state().alive(pid, Instant::now())
    }

    pub fn spawn_count(&self, service: &str) -> usize {
        self.state().spawns.get(service).copied().unwrap_or(0)
    }

    pub fn total_spawns(&self) -> usize {
        self.state().spawns.values().sum()
    }

    pub fn probe_calls(&self) -> usize {
        self.state().probe_calls
    }

    pub fn external_calls(&self) -> Vec<Vec<String>> {
        self.state().external_calls.clone()
    }
}

impl PortProbe for FakeHost {
    fn is_listening(&self, port: u16) -> io::Result<bool> {
        let mut state = self.state();
        state.probe_calls += 1;
        if state.failing_probes.contains(&port) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "socket table unavailable",
            ));
        }
        Ok(state.listener(port, Instant::now()).is_some())
    }

    fn find_listener_pid(&self, port: u16) -> Option<u32> {
        let mut state = self.state();
        state.probe_calls += 1;
        if state.failing_probes.contains(&port) {
            return None;
        }
        state.listener(port, Instant::now())
    }
}

impl ProcessControl for FakeHost {
    fn spawn_detached(&self, name: &str, launch: &LaunchCommand) -> io::Result<u32> {
        let mut state = self.state();
        let behavior = state.behaviors.get(name).cloned().unwrap_or_default();
        *state.spawns.entry(name.to_string()).or_insert(0) += 1;
        if behavior.spawn_error {
            return Err(io::Error::new(io::ErrorKind::NotFound, "program not found"));
        }

        let now = Instant::now();
        let pid = state.allocate_pid();
        let port = state.ports.get(name).copied();
        state.processes.insert(
            pid,
            FakeProcess {
                service: Some(name.to_string()),
                argv: launch_argv(launch),
                port,
                bound_at: behavior.bind_delay.map(|delay| now + delay),
                exits_at: behavior.exit_after.map(|delay| now + delay),
                ignore_term: behavior.ignore_term,
                respawn_on_exit: behavior.respawn_on_exit,
            },
        );
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.is_running(pid)
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        let state = self.state();
        if !state.alive(pid, Instant::now()) {
            return None;
        }
        state.processes.get(&pid).map(|process| process.argv.clone())
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state();
        let ignores = state
            .processes
            .get(&pid)
            .map(|process| process.ignore_term)
            .unwrap_or(false);
        if !ignores {
            state.end(pid);
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.state().end(pid);
        Ok(())
    }

    fn run_external(&self, argv: &[String]) -> io::Result<()> {
        let mut state = self.state();
        state.external_calls.push(argv.to_vec());

        let (Some(verb), Some(target)) = (argv.get(1), argv.get(2)) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad supervisor call"));
        };
        let Some(port) = state.external_ports.get(target).copied() else {
            return Err(io::Error::other(format!("no such program: {target}")));
        };

        match verb.as_str() {
            "start" => {
                state.insert_bound(None, vec![target.clone()], port, false);
            }
            "stop" => {
                let pids: Vec<u32> = state
                    .processes
                    .iter()
                    .filter(|(_, process)| process.port == Some(port))
                    .map(|(pid, _)| *pid)
                    .collect();
                for pid in pids {
                    state.end(pid);
                }
            }
            other => {
                return Err(io::Error::other(format!("unsupported verb {other}")));
            }
        }
        Ok(())
    }
}

impl ProcessInspector for FakeHost {
    fn inspect(&self, pid: u32) -> Option<ProcessMetrics> {
        let state = self.state();
        if !state.alive(pid, Instant::now()) || state.uninspectable.contains(&pid) {
            return None;
        }
        Some(ProcessMetrics {
            cpu_percent: 1.5,
            memory_mb: 42.0,
        })
    }
}

fn launch_argv(launch: &LaunchCommand) -> Vec<String> {
    std::iter::once(launch.program.clone())
        .chain(launch.args.iter().cloned())
        .collect()
}

fn unrelated_argv(port: u16) -> Vec<String> {
    vec!["nc".to_string(), "-l".to_string(), port.to_string()]
}

/// Catalog of `sleep` services on the given ports.
pub fn sleeper_catalog(services: &[(&str, u16)], host: Option<&str>) -> ServiceCatalog {
    let services = services
        .iter()
        .map(|(name, port)| ServiceDescriptor {
            name: name.to_string(),
            display_name: format!("{name} service"),
            description: String::new(),
            port: *port,
            launch: Some(LaunchCommand {
                program: "sleep".to_string(),
                args: vec!["60".to_string()],
                cwd: None,
                env: BTreeMap::new(),
            }),
            external: None,
        })
        .collect();
    ServiceCatalog::new(services, host.map(str::to_string)).expect("invalid test catalog")
}

/// Controller, reporter and surface wired to one fake host and a registry
/// file in a fresh temp directory.
pub struct Harness {
    pub host: Arc<FakeHost>,
    pub registry: Arc<ProcessRegistry>,
    pub controller: Arc<LifecycleController>,
    pub reporter: Arc<StatusReporter>,
    pub surface: CommandSurface,
    dir: PathBuf,
}

impl Harness {
    pub fn new(prefix: &str, catalog: ServiceCatalog) -> Self {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("svcmgr-harness-{prefix}-{nonce}"));

        let host = Arc::new(FakeHost::new(&catalog));
        let catalog = Arc::new(catalog);
        let registry = Arc::new(ProcessRegistry::new(dir.join("service_pids.json")));
        let controller = Arc::new(LifecycleController::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            host.clone(),
            host.clone(),
            LifecycleTimings::default(),
        ));
        let reporter = Arc::new(StatusReporter::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            host.clone(),
            host.clone(),
            host.clone(),
        ));
        let surface = CommandSurface::new(Arc::clone(&controller), Arc::clone(&reporter));

        Self {
            host,
            registry,
            controller,
            reporter,
            surface,
            dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
