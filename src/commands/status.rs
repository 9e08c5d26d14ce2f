use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::{expect_ok, pid_cell};

pub(crate) async fn run(config: &AppConfig, name: String) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Status { name }).await?;
    let response = expect_ok(response)?;

    let status = response
        .status
        .context("daemon returned no status for status command")?;

    println!("Name:        {}", status.service_name);
    println!("Display:     {}", status.display_name);
    if !status.description.is_empty() {
        println!("Description: {}", status.description);
    }
    println!("Port:        {}", status.port);
    println!("State:       {}", status.state);
    println!("PID:         {}", pid_cell(status.pid));
    if let Some(cpu) = status.cpu_percent {
        println!("CPU:         {cpu:.1}%");
    }
    if let Some(memory) = status.memory_mb {
        println!("RAM:         {memory:.1} MB");
    }
    if let Some(error) = status.error {
        println!("Error:       {error}");
    }

    Ok(())
}
