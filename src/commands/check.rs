use anyhow::Result;

use crate::catalog::{ServiceCatalog, ServiceDescriptor};
use crate::config::AppConfig;

pub(crate) fn run(config: &AppConfig) -> Result<()> {
    let source = if config.catalog_path.exists() {
        config.catalog_path.display().to_string()
    } else {
        "built-in defaults".to_string()
    };
    let catalog = ServiceCatalog::load(&config.catalog_path)?
        .with_host_service(config.host_service.clone())?;

    println!("Catalog:     {source}");
    println!(
        "Host:        {}",
        catalog.host_service().unwrap_or("-")
    );
    for line in describe_catalog(&catalog) {
        println!("{line}");
    }
    println!("{} service(s) ok", catalog.iter().count());

    Ok(())
}

fn describe_catalog(catalog: &ServiceCatalog) -> Vec<String> {
    catalog.iter().map(describe_service).collect()
}

fn describe_service(service: &ServiceDescriptor) -> String {
    let launch = match (&service.external, &service.launch) {
        (Some(manager), _) => manager.label(),
        (None, Some(command)) => command.display(),
        (None, None) => "-".to_string(),
    };
    format!("  {:<12} {:>5}  {}", service.name, service.port, launch)
}
