use std::collections::HashMap;
use std::env;
use std::process::Stdio;
use std::str;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::catalog::ServiceCatalog;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::ipc::{read_json_line, write_json_line, IpcRequest, IpcResponse};
use crate::lifecycle::LifecycleController;
use crate::platform::NativeProcessControl;
use crate::probe::SystemPortProbe;
use crate::registry::ProcessRegistry;
use crate::status::{StatusReporter, SysinfoInspector};
use crate::surface::CommandSurface;

const OPERATOR_HEADER: &str = "x-svcmgr-operator";

pub async fn run_foreground(config: AppConfig) -> Result<()> {
    config.ensure_layout()?;
    let surface = Arc::new(build_surface(&config)?);
    let listener = bind_listener(&config.daemon_addr).await?;
    let api_listener = bind_api_listener(&config.api_addr).await?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

    log_reconcile(&surface.controller().reconcile().await);
    let mut reconcile_tick = tokio::time::interval(config.reconcile_interval);
    reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    reconcile_tick.tick().await;
    let mut reconcile_task: Option<JoinHandle<()>> = None;

    info!("svcmgr daemon started at {}", config.daemon_addr);
    info!("svcmgr HTTP API started at {}", config.api_addr);

    loop {
        tokio::select! {
            incoming = listener.accept() => {
                match incoming {
                    Ok((stream, _)) => {
                        let surface = Arc::clone(&surface);
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, surface, shutdown_tx).await {
                                error!("failed to handle IPC client: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("IPC accept failed: {err}");
                    }
                }
            }
            incoming = api_listener.accept() => {
                match incoming {
                    Ok((stream, _)) => {
                        let surface = Arc::clone(&surface);
                        tokio::spawn(async move {
                            if let Err(err) = handle_api_client(stream, surface).await {
                                error!("failed to handle HTTP API client: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("HTTP API accept failed: {err}");
                    }
                }
            }
            _ = reconcile_tick.tick() => {
                if reconcile_task.as_ref().is_some_and(|task| !task.is_finished()) {
                    continue;
                }
                let surface = Arc::clone(&surface);
                reconcile_task = Some(tokio::spawn(async move {
                    log_reconcile(&surface.controller().reconcile().await);
                }));
            }
            Some(_) = shutdown_rx.recv() => {
                info!("shutdown requested via IPC; managed services keep running");
                break;
            }
            ctrl = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl {
                    warn!("failed to wait for CTRL-C signal: {err}");
                }
                info!("received shutdown signal; managed services keep running");
                break;
            }
        }
    }

    Ok(())
}

pub fn build_surface(config: &AppConfig) -> Result<CommandSurface> {
    let catalog = ServiceCatalog::load(&config.catalog_path)?
        .with_host_service(config.host_service.clone())?;
    let catalog = Arc::new(catalog);
    let registry = Arc::new(ProcessRegistry::new(config.registry_path.clone()));
    let probe = Arc::new(SystemPortProbe);
    let processes = Arc::new(NativeProcessControl::new(
        Some(config.log_dir.clone()),
        config.log_max_size_bytes,
    ));

    let controller = Arc::new(LifecycleController::new(
        Arc::clone(&catalog),
        Arc::clone(&registry),
        probe.clone(),
        processes.clone(),
        config.timings,
    ));
    let reporter = Arc::new(StatusReporter::new(
        catalog,
        registry,
        probe,
        processes,
        Arc::new(SysinfoInspector::new()),
    ));
    Ok(CommandSurface::new(controller, reporter))
}

fn log_reconcile(report: &crate::lifecycle::ReconcileReport) {
    if report.is_empty() {
        return;
    }
    info!(
        "reconciled registry: removed {:?}, adopted {:?}",
        report.removed, report.adopted
    );
}

pub async fn ensure_daemon_running(config: &AppConfig) -> Result<()> {
    if daemon_socket_available(&config.daemon_addr).await {
        return Ok(());
    }

    let executable = env::current_exe().context("failed to locate current executable")?;
    Command::new(executable)
        .arg("daemon")
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn daemon")?;

    for _ in 0..50 {
        if daemon_socket_available(&config.daemon_addr).await {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("daemon did not become ready in time")
}

pub async fn daemon_socket_available(daemon_addr: &str) -> bool {
    match timeout(Duration::from_millis(250), TcpStream::connect(daemon_addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

async fn bind_listener(daemon_addr: &str) -> Result<TcpListener> {
    if daemon_socket_available(daemon_addr).await {
        anyhow::bail!("svcmgr daemon is already running at {daemon_addr}");
    }

    TcpListener::bind(daemon_addr)
        .await
        .with_context(|| format!("failed to bind daemon endpoint at {daemon_addr}"))
}

async fn bind_api_listener(api_addr: &str) -> Result<TcpListener> {
    TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind HTTP API endpoint at {api_addr}"))
}

async fn handle_client(
    mut stream: TcpStream,
    surface: Arc<CommandSurface>,
    shutdown_tx: mpsc::UnboundedSender<()>,
) -> Result<()> {
    let request = read_json_line::<IpcRequest, _>(&mut stream).await?;
    let response = execute_request(request, &surface, &shutdown_tx).await;
    write_json_line(&mut stream, &response).await
}

async fn execute_request(
    request: IpcRequest,
    surface: &CommandSurface,
    shutdown_tx: &mpsc::UnboundedSender<()>,
) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::ok("pong"),
        IpcRequest::Shutdown => {
            let _ = shutdown_tx.send(());
            IpcResponse::ok("daemon shutdown scheduled")
        }
        IpcRequest::List => {
            let mut response = IpcResponse::ok("ok");
            response.statuses = surface.list().await;
            response
        }
        IpcRequest::Status { name } => match surface.status(&name).await {
            Ok(status) => {
                let mut response = IpcResponse::ok("ok");
                response.status = Some(status);
                response
            }
            Err(err) => IpcResponse::service_error(&err),
        },
        IpcRequest::Start { name } => match surface.start(&name).await {
            Ok(report) => {
                let mut response =
                    IpcResponse::ok(format!("started {} ({})", report.service_name, report.status));
                response.start = Some(report);
                response
            }
            Err(err) => IpcResponse::service_error(&err),
        },
        IpcRequest::Stop {
            name,
            force,
            operator,
        } => match surface.stop(&name, force, operator.as_deref()).await {
            Ok(report) => {
                let mut response = IpcResponse::ok(format!("stopped {}", report.service_name));
                response.stop = Some(report);
                response
            }
            Err(err) => IpcResponse::service_error(&err),
        },
        IpcRequest::Restart {
            name,
            force,
            operator,
        } => match surface.restart(&name, force, operator.as_deref()).await {
            Ok(report) => {
                let mut response = IpcResponse::ok(format!(
                    "restarted {} ({})",
                    report.service_name, report.status
                ));
                response.start = Some(report);
                response
            }
            Err(err) => IpcResponse::service_error(&err),
        },
    }
}

async fn handle_api_client(mut stream: TcpStream, surface: Arc<CommandSurface>) -> Result<()> {
    let request = read_http_request(&mut stream).await?;
    let response = execute_api_request(request, &surface).await;
    write_http_response(&mut stream, response.status_code, &response.body).await
}

async fn execute_api_request(request: HttpRequest, surface: &CommandSurface) -> HttpResponse {
    let (path, query) = request
        .path
        .split_once('?')
        .unwrap_or((request.path.as_str(), ""));
    let segments: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let operator = request.headers.get(OPERATOR_HEADER).map(String::as_str);

    let expected_method = match segments.as_slice() {
        ["status"] | ["status", _] => "GET",
        ["start", _] | ["stop", _] | ["restart", _] => "POST",
        _ => return HttpResponse::error(404, "not_found", "not found"),
    };
    if request.method != expected_method {
        return HttpResponse::error(405, "method_not_allowed", "method not allowed");
    }

    let force = match query_flag(query, "force") {
        Ok(force) => force,
        Err(message) => return HttpResponse::error(400, "bad_request", message),
    };

    match segments.as_slice() {
        ["status"] => HttpResponse::data(&surface.list().await),
        ["status", name] => HttpResponse::from_result(surface.status(name).await),
        ["start", name] => HttpResponse::from_result(surface.start(name).await),
        ["stop", name] => HttpResponse::from_result(surface.stop(name, force, operator).await),
        ["restart", name] => {
            HttpResponse::from_result(surface.restart(name, force, operator).await)
        }
        _ => HttpResponse::error(404, "not_found", "not found"),
    }
}

/// Boolean query parameter; absent means `false`.
fn query_flag(query: &str, key: &str) -> std::result::Result<bool, String> {
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, "true"));
        if name != key {
            continue;
        }
        return match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(format!("invalid value for {key}: {other}")),
        };
    }
    Ok(false)
}

async fn read_http_request<S>(stream: &mut S) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    const MAX_HEADER_BYTES: usize = 16 * 1024;
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];

    loop {
        let read = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .context("timed out while reading HTTP request")?
            .context("failed to read HTTP request")?;

        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);

        if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            anyhow::bail!("HTTP request headers exceed maximum size");
        }
    }

    let raw = str::from_utf8(&buffer).context("HTTP request is not valid UTF-8")?;
    let header_end = raw
        .find("\r\n\r\n")
        .context("malformed HTTP request headers")?;
    let head = &raw[..header_end];

    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .context("missing HTTP request line")?
        .trim()
        .to_string();
    let mut request_parts = request_line.split_whitespace();
    let method = request_parts
        .next()
        .context("missing HTTP request method")?
        .to_ascii_uppercase();
    let path = request_parts
        .next()
        .context("missing HTTP request path")?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(HttpRequest {
        method,
        path,
        headers,
    })
}

async fn write_http_response<S>(
    stream: &mut S,
    status_code: u16,
    body: &serde_json::Value,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = match status_code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "OK",
    };
    let body_text = serde_json::to_string(body).context("failed to encode HTTP response")?;
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        reason,
        body_text.len(),
        body_text
    );

    stream
        .write_all(response.as_bytes())
        .await
        .context("failed to write HTTP response")?;
    stream
        .flush()
        .await
        .context("failed to flush HTTP response")
}

struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

struct HttpResponse {
    status_code: u16,
    body: serde_json::Value,
}

impl HttpResponse {
    fn data<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                status_code: 200,
                body: json!({
                    "ok": true,
                    "data": data
                }),
            },
            Err(err) => Self::error(500, "internal", format!("failed to encode response: {err}")),
        }
    }

    fn from_result<T: Serialize>(result: std::result::Result<T, ServiceError>) -> Self {
        match result {
            Ok(data) => Self::data(&data),
            Err(err) => {
                let kind = err.kind();
                Self::error(kind.http_status(), &kind.to_string(), err.to_string())
            }
        }
    }

    fn error(status_code: u16, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status_code,
            body: json!({
                "ok": false,
                "error": {
                    "kind": kind,
                    "message": message.into()
                }
            }),
        }
    }
}
