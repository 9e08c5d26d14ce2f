use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::lifecycle::LifecycleTimings;

const PORT_RANGE_START: u16 = 40000;
const PORT_RANGE_LEN: u16 = 20000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub daemon_addr: String,
    pub api_addr: String,
    pub catalog_path: PathBuf,
    pub registry_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_max_size_bytes: u64,
    /// Overrides the catalog's `host_service` when set.
    pub host_service: Option<String>,
    pub timings: LifecycleTimings,
    pub reconcile_interval: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env_string("SVCMGR_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                env::current_dir()
                    .unwrap_or_else(|_| env::temp_dir())
                    .join(".svcmgr")
            });
        let port = daemon_port();
        let daemon_addr = env_string("SVCMGR_DAEMON_ADDR")
            .unwrap_or_else(|| format!("127.0.0.1:{port}"));
        let api_addr = env_string("SVCMGR_API_ADDR")
            .unwrap_or_else(|| format!("127.0.0.1:{}", api_port(port)));
        let catalog_path = env_string("SVCMGR_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("services.toml"));
        let registry_path = base_dir.join("service_pids.json");
        let log_dir = base_dir.join("logs");
        let log_max_size_bytes = env_u64("SVCMGR_LOG_MAX_SIZE_MB", 20)
            .max(1)
            .saturating_mul(1024 * 1024);

        let defaults = LifecycleTimings::default();
        let timings = LifecycleTimings {
            poll_interval: env_duration_ms("SVCMGR_POLL_INTERVAL_MS", defaults.poll_interval)
                .max(Duration::from_millis(10)),
            start_timeout: env_duration_ms("SVCMGR_START_TIMEOUT_MS", defaults.start_timeout),
            stop_timeout: env_duration_ms("SVCMGR_STOP_TIMEOUT_MS", defaults.stop_timeout),
            kill_grace: env_duration_ms("SVCMGR_KILL_GRACE_MS", defaults.kill_grace),
            release_timeout: env_duration_ms(
                "SVCMGR_RELEASE_TIMEOUT_MS",
                defaults.release_timeout,
            ),
            auto_restart_window: env_duration_ms(
                "SVCMGR_AUTO_RESTART_WINDOW_MS",
                defaults.auto_restart_window,
            ),
            restart_settle: env_duration_ms("SVCMGR_RESTART_SETTLE_MS", defaults.restart_settle),
        };
        let reconcile_interval = Duration::from_secs(env_u64("SVCMGR_RECONCILE_SECS", 30).max(1));

        let config = Self {
            base_dir,
            daemon_addr,
            api_addr,
            catalog_path,
            registry_path,
            log_dir,
            log_max_size_bytes,
            host_service: env_string("SVCMGR_HOST_SERVICE"),
            timings,
            reconcile_interval,
        };
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(())
    }
}

fn daemon_port() -> u16 {
    let identity = current_identity();
    let mut hash = 2166136261_u32;
    for byte in identity.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }

    // Keep daemon ports in a high, non-privileged range.
    PORT_RANGE_START + (hash % PORT_RANGE_LEN as u32) as u16
}

/// The port right after the daemon's, wrapping inside the same range.
fn api_port(daemon_port: u16) -> u16 {
    let offset = (daemon_port - PORT_RANGE_START + 1) % PORT_RANGE_LEN;
    PORT_RANGE_START + offset
}

fn current_identity() -> String {
    #[cfg(unix)]
    {
        format!("uid-{}", nix::unistd::Uid::effective().as_raw())
    }

    #[cfg(windows)]
    {
        let username = env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string());
        format!("win-{username}")
    }

    #[cfg(not(any(unix, windows)))]
    {
        "svcmgr-generic".to_string()
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    let millis = env_u64(key, default.as_millis() as u64).max(1);
    Duration::from_millis(millis)
}
