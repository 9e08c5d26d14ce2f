use std::io;
use std::net::TcpListener;

use tracing::debug;

/// Liveness signal for a service: is anything accepting connections on its port.
///
/// Implementations may block on OS calls; async callers go through
/// `spawn_blocking`.
pub trait PortProbe: Send + Sync {
    /// `Err` only when neither socket enumeration nor the bind fallback could
    /// give an answer.
    fn is_listening(&self, port: u16) -> io::Result<bool>;

    /// PID of the process bound to `port`, when it can be determined.
    fn find_listener_pid(&self, port: u16) -> Option<u32>;
}

/// Probe backed by the system-wide listener table from the `listeners` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortProbe;

impl PortProbe for SystemPortProbe {
    fn is_listening(&self, port: u16) -> io::Result<bool> {
        let enumerated = listener_pids(port);
        match &enumerated {
            Ok(pids) if !pids.is_empty() => return Ok(true),
            Ok(_) => {}
            Err(err) => {
                debug!("listener enumeration for port {port} failed ({err}); falling back to bind");
            }
        }

        // Sockets owned by other users are not always visible to enumeration.
        match bind_probe(port) {
            Ok(listening) => Ok(listening),
            Err(bind_err) => match enumerated {
                Ok(_) => {
                    debug!("bind check for port {port} failed ({bind_err}); trusting enumeration");
                    Ok(false)
                }
                Err(_) => Err(bind_err),
            },
        }
    }

    fn find_listener_pid(&self, port: u16) -> Option<u32> {
        // Forked workers share the listening socket; the lowest PID is the parent.
        listener_pids(port).ok()?.into_iter().min()
    }
}

/// PIDs of every process with a socket listening on `port`.
fn listener_pids(port: u16) -> io::Result<Vec<u32>> {
    let all = listeners::get_all().map_err(|err| io::Error::other(err.to_string()))?;
    Ok(all
        .into_iter()
        .filter(|listener| listener.socket.port() == port)
        .map(|listener| listener.process.pid)
        .collect())
}

/// Attempts to bind `port` on all interfaces. A successful bind means
/// nothing was listening; the socket is released immediately.
pub fn bind_probe(port: u16) -> io::Result<bool> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            Ok(false)
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Ok(true),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::{bind_probe, PortProbe, SystemPortProbe};

    fn bound_port(listener: &TcpListener) -> u16 {
        listener
            .local_addr()
            .expect("failed to resolve listener addr")
            .port()
    }

    #[test]
    fn system_probe_tracks_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test listener");
        let port = bound_port(&listener);

        let probe = SystemPortProbe;
        assert!(probe.is_listening(port).expect("port check failed"));
        assert!(bind_probe(port).expect("bind check failed"));

        drop(listener);
        assert!(!probe.is_listening(port).expect("port check failed"));
    }

    #[test]
    fn system_probe_finds_own_pid_for_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test listener");
        let port = bound_port(&listener);

        let probe = SystemPortProbe;
        assert_eq!(probe.find_listener_pid(port), Some(std::process::id()));
    }

    #[test]
    fn free_port_has_no_listener_pid() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test listener");
        let port = bound_port(&listener);
        drop(listener);

        assert_eq!(SystemPortProbe.find_listener_pid(port), None);
    }
}
