use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};

use super::common::{expect_ok, pid_cell};

pub(crate) async fn run(config: &AppConfig, name: String) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::Start { name }).await?;
    let response = expect_ok(response)?;
    println!("{}", response.message);
    if let Some(report) = response.start {
        println!("port={} pid={}", report.port, pid_cell(report.pid));
    }

    Ok(())
}
