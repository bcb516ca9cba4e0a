// src/main.rs

//! The main entry point for the virt-topo-agent engine.
//!
//! Concrete `Virt` backends and `Manager` destinations are pluggable
//! extension points (out of scope here); this binary wires up
//! configuration loading, logging, and the Executor's supervision loop,
//! and leaves the backend/destination registries for an embedder to
//! populate.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};
use virt_topo_agent::config::{Config, DestinationConfig};
use virt_topo_agent::core::errors::ManagerError;
use virt_topo_agent::core::manager::{CheckInResult, Manager, SendOptions};
use virt_topo_agent::core::report::{DomainListReport, HostGuestAssociationReport, ReportState};
use virt_topo_agent::core::virt::VirtRegistry;
use virt_topo_agent::{Executor, RunOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("virt-topo-agent version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let initial_log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| config.log_level.clone().unwrap_or_else(|| "info".to_string()));
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let _reload_handle = Arc::new(reload_handle);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, stopping all workers");
            let _ = shutdown_tx.send(true);
        }
    });

    // No trigger pushes `true` here today (no SIGHUP handler, no admin
    // socket); it exists so an embedder can request a reload the same way
    // the Executor observes a fatal manager error.
    let (reload_signal_tx, reload_signal_rx) = watch::channel(false);

    let manager_factory = Arc::new(|_dest: &DestinationConfig| Arc::new(UnconfiguredManager) as Arc<dyn Manager>);

    loop {
        // No concrete `Virt` backends ship with the engine (out of scope);
        // an embedder registers its own before running this binary for real.
        let executor = Executor::new(config.clone(), VirtRegistry::new(), manager_factory.clone());
        match executor.run(shutdown_rx.clone(), reload_signal_rx.clone()).await {
            Ok(RunOutcome::Completed) => break,
            Ok(RunOutcome::ReloadRequested) => {
                if *shutdown_rx.borrow() {
                    break;
                }
                let _ = reload_signal_tx.send(false);
                info!("reloading configuration from \"{config_path}\"");
                config = match Config::from_file(config_path) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        error!("failed to reload configuration: {e}");
                        break;
                    }
                };
            }
            Err(e) => {
                error!("engine error: {e}");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Placeholder `Manager` used until an embedder registers a real
/// destination backend; every call fails fatally so misconfiguration is
/// obvious rather than silently dropping reports.
struct UnconfiguredManager;

#[async_trait::async_trait]
impl Manager for UnconfiguredManager {
    async fn hypervisor_check_in(
        &self,
        _report: &HostGuestAssociationReport,
        _options: &SendOptions,
    ) -> Result<CheckInResult, ManagerError> {
        Err(ManagerError::Fatal("no manager backend configured for this destination".into()))
    }

    async fn check_report_state(
        &self,
        _job: &virt_topo_agent::core::manager::AsyncJob,
    ) -> Result<ReportState, ManagerError> {
        Err(ManagerError::Fatal("no manager backend configured for this destination".into()))
    }

    async fn send_virt_guests(&self, _report: &DomainListReport, _options: &SendOptions) -> Result<(), ManagerError> {
        Err(ManagerError::Fatal("no manager backend configured for this destination".into()))
    }
}
