use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

const DEFAULT_HOST_SERVICE: &str = "admin";

/// Program, arguments and environment used to spawn a service locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl LaunchCommand {
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        shell_words::join(parts)
    }
}

/// Supervisor that owns a service's process instead of this manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "manager", rename_all = "snake_case")]
pub enum ExternalManager {
    Systemd { unit: String },
    Supervisor { program: String },
}

impl ExternalManager {
    pub fn start_command(&self) -> Vec<String> {
        self.command("start")
    }

    pub fn stop_command(&self) -> Vec<String> {
        self.command("stop")
    }

    pub fn label(&self) -> String {
        match self {
            ExternalManager::Systemd { unit } => format!("systemd:{unit}"),
            ExternalManager::Supervisor { program } => format!("supervisor:{program}"),
        }
    }

    fn command(&self, verb: &str) -> Vec<String> {
        match self {
            ExternalManager::Systemd { unit } => {
                vec!["systemctl".to_string(), verb.to_string(), unit.clone()]
            }
            ExternalManager::Supervisor { program } => {
                vec!["supervisorctl".to_string(), verb.to_string(), program.clone()]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub port: u16,
    pub launch: Option<LaunchCommand>,
    pub external: Option<ExternalManager>,
}

/// Static name -> descriptor table. Names and ports are unique.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    services: Vec<ServiceDescriptor>,
    index: HashMap<String, usize>,
    host_service: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCatalog {
    host_service: Option<String>,
    root: Option<PathBuf>,
    #[serde(default)]
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    name: String,
    display_name: Option<String>,
    description: Option<String>,
    port: u16,
    command: Option<RawCommand>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    external: Option<ExternalManager>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

impl ServiceCatalog {
    pub fn new(services: Vec<ServiceDescriptor>, host_service: Option<String>) -> Result<Self> {
        let mut index = HashMap::with_capacity(services.len());
        let mut ports = HashSet::with_capacity(services.len());

        for (idx, service) in services.iter().enumerate() {
            validate_service_name(&service.name)?;
            if service.port == 0 {
                anyhow::bail!("service {} must declare a non-zero port", service.name);
            }
            if index.insert(service.name.clone(), idx).is_some() {
                anyhow::bail!("duplicate service name: {}", service.name);
            }
            if !ports.insert(service.port) {
                anyhow::bail!(
                    "port {} of service {} is already used by another service",
                    service.port,
                    service.name
                );
            }
            if service.launch.is_none() && service.external.is_none() {
                anyhow::bail!(
                    "service {} needs either a command or an external manager",
                    service.name
                );
            }
        }

        if let Some(host) = host_service.as_deref() {
            if !index.contains_key(host) {
                anyhow::bail!("host service {host} is not defined in the catalog");
            }
        }

        Ok(Self {
            services,
            index,
            host_service,
        })
    }

    /// Reads the catalog file, or falls back to the built-in deployment when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::builtin();
        }

        let payload = fs::read_to_string(path)
            .with_context(|| format!("failed to read service catalog {}", path.display()))?;
        Self::from_toml_str(&payload)
            .with_context(|| format!("invalid service catalog {}", path.display()))
    }

    pub fn from_toml_str(payload: &str) -> Result<Self> {
        let raw: RawCatalog = toml::from_str(payload).context("failed to parse catalog TOML")?;
        let root = raw.root;

        let mut services = Vec::with_capacity(raw.services.len());
        for service in raw.services {
            let launch = match service.command {
                Some(command) => Some(resolve_launch(
                    &service.name,
                    command,
                    service.port,
                    service.cwd.or_else(|| root.clone()),
                    service.env,
                )?),
                None => None,
            };

            services.push(ServiceDescriptor {
                display_name: service
                    .display_name
                    .unwrap_or_else(|| service.name.clone()),
                description: service.description.unwrap_or_default(),
                name: service.name,
                port: service.port,
                launch,
                external: service.external,
            });
        }

        Self::new(services, raw.host_service)
    }

    /// The stock deployment (admin console plus four sibling services); ports follow the
    /// `<NAME>_SERVICE_PORT` environment variables.
    pub fn builtin() -> Result<Self> {
        let entries = [
            ("admin", "Admin Service", "Admin console", "admin_service.app.main:app", 8000),
            ("crawler", "Crawler Service", "Crawler", "crawler_service.app.main:app", 8001),
            ("system", "System Service", "System information", "system_service.app.main:app", 8002),
            ("ai", "AI Service", "AI chat proxy", "ai_service.app.main:app", 8003),
            ("gateway", "Gateway Service", "API gateway", "gateway_service.app.main:app", 8999),
        ];

        let services = entries
            .into_iter()
            .map(|(name, display_name, description, module, default_port)| {
                let port = env_port(&format!("{}_SERVICE_PORT", name.to_ascii_uppercase()))
                    .unwrap_or(default_port);
                let port_text = port.to_string();
                ServiceDescriptor {
                    name: name.to_string(),
                    display_name: display_name.to_string(),
                    description: description.to_string(),
                    port,
                    launch: Some(LaunchCommand {
                        program: "python".to_string(),
                        args: [
                            "-m",
                            "uvicorn",
                            module,
                            "--host",
                            "0.0.0.0",
                            "--port",
                            port_text.as_str(),
                            "--log-level",
                            "info",
                        ]
                        .iter()
                        .map(|value| value.to_string())
                        .collect(),
                        cwd: None,
                        env: BTreeMap::new(),
                    }),
                    external: None,
                }
            })
            .collect();

        Self::new(services, Some(DEFAULT_HOST_SERVICE.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&ServiceDescriptor, ServiceError> {
        self.index
            .get(name)
            .map(|idx| &self.services[*idx])
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn host_service(&self) -> Option<&str> {
        self.host_service.as_deref()
    }

    pub fn with_host_service(mut self, host: Option<String>) -> Result<Self> {
        if let Some(host) = host {
            if !self.index.contains_key(&host) {
                anyhow::bail!("host service {host} is not defined in the catalog");
            }
            self.host_service = Some(host);
        }
        Ok(self)
    }
}

fn resolve_launch(
    name: &str,
    command: RawCommand,
    port: u16,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
) -> Result<LaunchCommand> {
    let tokens = match command {
        RawCommand::Line(line) => shell_words::split(&line)
            .with_context(|| format!("invalid command for service {name}"))?,
        RawCommand::Argv(argv) => argv,
    };

    let port_text = port.to_string();
    let mut tokens = tokens
        .into_iter()
        .map(|token| token.replace("{port}", &port_text));

    let program = tokens
        .next()
        .filter(|program| !program.trim().is_empty())
        .with_context(|| format!("command for service {name} cannot be empty"))?;

    Ok(LaunchCommand {
        program,
        args: tokens.collect(),
        cwd,
        env,
    })
}

fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("service name cannot be empty");
    }

    let valid = name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if !valid {
        anyhow::bail!("invalid service name: {name}");
    }
    Ok(())
}

fn env_port(key: &str) -> Option<u16> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
}
