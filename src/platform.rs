use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::catalog::{LaunchCommand, ServiceDescriptor};
use crate::logging::{open_log_writers, service_logs};

/// OS capability for launching and signalling detached service processes.
/// Backends are selected at compile time; callers never branch on the OS.
pub trait ProcessControl: Send + Sync {
    /// Starts `launch` in its own session with stdio detached from the
    /// caller. Must be called from within a tokio runtime, which reaps the
    /// child once it exits.
    fn spawn_detached(&self, name: &str, launch: &LaunchCommand) -> io::Result<u32>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Argument vector of `pid`, `None` when the process is gone.
    fn command_line(&self, pid: u32) -> Option<Vec<String>>;

    /// Graceful termination request. `Ok` when the process is already gone.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forced termination. `Ok` when the process is already gone.
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Runs a supervisor command (`systemctl`, `supervisorctl`) to completion.
    fn run_external(&self, argv: &[String]) -> io::Result<()>;
}

/// Whether a recorded `pid` still belongs to `service`. Beyond liveness, the
/// process must still run the service's launch command, since a PID persisted
/// before a reboot can be handed to an unrelated process.
pub fn runs_service(
    processes: &dyn ProcessControl,
    service: &ServiceDescriptor,
    pid: u32,
) -> bool {
    if !processes.is_alive(pid) {
        return false;
    }
    match (&service.external, &service.launch) {
        (None, Some(launch)) => processes
            .command_line(pid)
            .is_some_and(|argv| matches_launch(launch, &argv)),
        // Supervisor-owned processes have no launch command to compare.
        _ => true,
    }
}

/// Looks for the launch program (by file name) followed by its arguments
/// anywhere in `argv`, so interpreters running a script still match.
fn matches_launch(launch: &LaunchCommand, argv: &[String]) -> bool {
    let program = file_name(&launch.program);
    let width = launch.args.len() + 1;
    if argv.len() < width {
        return false;
    }

    argv.windows(width).any(|window| {
        file_name(&window[0]) == program && window[1..] == launch.args[..]
    })
}

fn file_name(program: &str) -> &str {
    std::path::Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

#[derive(Debug, Clone, Default)]
pub struct NativeProcessControl {
    log_dir: Option<PathBuf>,
    log_max_size_bytes: u64,
}

impl NativeProcessControl {
    pub fn new(log_dir: Option<PathBuf>, log_max_size_bytes: u64) -> Self {
        Self {
            log_dir,
            log_max_size_bytes,
        }
    }

    fn stdio_for(&self, name: &str) -> io::Result<(Stdio, Stdio)> {
        let Some(log_dir) = self.log_dir.as_ref() else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        let logs = service_logs(log_dir, name);
        let (stdout, stderr) = open_log_writers(&logs, self.log_max_size_bytes)?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }
}

impl ProcessControl for NativeProcessControl {
    fn spawn_detached(&self, name: &str, launch: &LaunchCommand) -> io::Result<u32> {
        let (stdout, stderr) = self.stdio_for(name)?;

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }
        detach(&mut command);

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned child has no pid"))?;

        let name = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("service {name} (pid {pid}) exited with {status}"),
                Err(err) => warn!("failed to reap service {name} (pid {pid}): {err}"),
            }
        });

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        process_exists(pid)
    }

    fn command_line(&self, pid: u32) -> Option<Vec<String>> {
        use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

        let sys_pid = SysPid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        system.process(sys_pid).map(|process| {
            process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect()
        })
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        terminate_pid(pid)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        kill_pid(pid)
    }

    fn run_external(&self, argv: &[String]) -> io::Result<()> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty supervisor command",
            ));
        };

        let status = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "`{}` exited with {status}",
                argv.join(" ")
            )))
        }
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    // New session: no controlling terminal, and signals aimed at the
    // manager's process group never reach the service.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_exists(pid: u32) -> bool {
    use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
    system.process(SysPid::from_u32(pid)).is_some()
}

/// Signals the process group led by `pid` when there is one, otherwise the
/// process itself.
#[cfg(unix)]
fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let os_pid = Pid::from_raw(pid as i32);
    let pgid = Pid::from_raw(-(pid as i32));

    match kill(pgid, signal) {
        Ok(()) => return Ok(()),
        Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!("failed to send {signal:?} to process group of pid {pid}: {err}");
        }
    }

    match kill(os_pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
    }
}

#[cfg(unix)]
fn terminate_pid(pid: u32) -> io::Result<()> {
    signal_pid(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> io::Result<()> {
    signal_pid(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let pid_string = pid.to_string();
    let mut args = vec!["/PID", pid_string.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let status = std::process::Command::new("taskkill")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() || !process_exists(pid) {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill for pid {pid} exited with {status}")))
    }
}

#[cfg(windows)]
fn terminate_pid(pid: u32) -> io::Result<()> {
    taskkill(pid, false)
}

#[cfg(windows)]
fn kill_pid(pid: u32) -> io::Result<()> {
    taskkill(pid, true)
}

#[cfg(not(any(unix, windows)))]
fn terminate_pid(_pid: u32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(not(any(unix, windows)))]
fn kill_pid(_pid: u32) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
