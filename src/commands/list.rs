use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::status::ServiceStatus;

use super::common::{expect_ok, pid_cell};

pub(crate) async fn run(config: &AppConfig) -> Result<()> {
    let response = send_request(&config.daemon_addr, &IpcRequest::List).await?;
    let response = expect_ok(response)?;
    print_service_table(response.statuses);

    Ok(())
}

fn print_service_table(statuses: Vec<ServiceStatus>) {
    if statuses.is_empty() {
        println!("No services in catalog.");
        return;
    }

    let headers = ["NAME", "DISPLAY", "PORT", "STATE", "PID", "CPU%", "RAM(MB)"];
    let rows: Vec<[String; 7]> = statuses.into_iter().map(table_row).collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.len());
        }
    }

    print_border(&widths);
    print_row(&headers, &widths);
    print_border(&widths);
    for row in &rows {
        let cells: [&str; 7] = [
            &row[0], &row[1], &row[2], &row[3], &row[4], &row[5], &row[6],
        ];
        print_row(&cells, &widths);
    }
    print_border(&widths);
}

fn table_row(status: ServiceStatus) -> [String; 7] {
    [
        status.service_name,
        status.display_name,
        status.port.to_string(),
        status.state.to_string(),
        pid_cell(status.pid),
        status
            .cpu_percent
            .map_or_else(|| "-".to_string(), |value| format!("{value:.1}")),
        status
            .memory_mb
            .map_or_else(|| "-".to_string(), |value| format!("{value:.1}")),
    ]
}

fn print_border(widths: &[usize; 7]) {
    print!("+");
    for width in widths {
        print!("-{}-+", "-".repeat(*width));
    }
    println!();
}

fn print_row(cells: &[&str; 7], widths: &[usize; 7]) {
    print!("|");
    for (idx, cell) in cells.iter().enumerate() {
        print!(" {:<width$} |", cell, width = widths[idx]);
    }
    println!();
}
