//! End-to-end coverage exercising `Executor::run` against in-memory
//! `Virt`/`Manager` fixtures: a source worker publishing into the
//! datastore, a destination worker pulling and submitting from it, and
//! the Executor's wait/terminate/reload supervision around both.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use virt_topo_agent::config::{Config, DestinationConfig, DestinationKind, SourceConfig};
use virt_topo_agent::core::errors::{ManagerError, VirtError};
use virt_topo_agent::core::manager::{AsyncJob, CheckInResult, Manager, SendOptions};
use virt_topo_agent::core::report::{DomainListReport, Guest, GuestState, HostGuestAssociationReport, Hypervisor, ReportState};
use virt_topo_agent::core::virt::{HostGuestMapping, Virt};
use virt_topo_agent::{Executor, RunOutcome};
use virt_topo_agent::core::virt::VirtRegistry;

struct OneHypervisorVirt;

#[async_trait]
impl Virt for OneHypervisorVirt {
    fn config_type(&self) -> &'static str {
        "one-hypervisor"
    }

    async fn get_host_guest_mapping(&self) -> Result<HostGuestMapping, VirtError> {
        let hyp = Hypervisor::new("hv1").with_guests(vec![Guest::new("g1", "esx", GuestState::Running)]);
        Ok(HostGuestMapping { hypervisors: vec![hyp] })
    }
}

struct DomainListVirt;

#[async_trait]
impl Virt for DomainListVirt {
    fn config_type(&self) -> &'static str {
        "domain-list"
    }

    fn is_hypervisor(&self) -> bool {
        false
    }

    async fn list_domains(&self) -> Result<Vec<Guest>, VirtError> {
        Ok(vec![Guest::new("g1", "esx", GuestState::Running)])
    }
}

#[derive(Default)]
struct RecordingManager {
    check_in_calls: Mutex<Vec<HostGuestAssociationReport>>,
    domain_list_calls: Mutex<Vec<DomainListReport>>,
    fail_first_check_in: Mutex<bool>,
}

#[async_trait]
impl Manager for RecordingManager {
    async fn hypervisor_check_in(&self, report: &HostGuestAssociationReport, _options: &SendOptions) -> Result<CheckInResult, ManagerError> {
        let mut fail_first = self.fail_first_check_in.lock().unwrap();
        if *fail_first {
            *fail_first = false;
            return Err(ManagerError::Fatal("destination rejected this consumer".into()));
        }
        self.check_in_calls.lock().unwrap().push(report.clone());
        Ok(CheckInResult::Sync(ReportState::Finished))
    }

    async fn check_report_state(&self, _job: &AsyncJob) -> Result<ReportState, ManagerError> {
        Ok(ReportState::Finished)
    }

    async fn send_virt_guests(&self, report: &DomainListReport, _options: &SendOptions) -> Result<(), ManagerError> {
        self.domain_list_calls.lock().unwrap().push(report.clone());
        Ok(())
    }
}

fn registry_with(config_type: &'static str, factory: fn() -> Box<dyn Virt>) -> VirtRegistry {
    let mut registry = VirtRegistry::new();
    registry.register(config_type, factory);
    registry
}

/// S1: a single source's host/guest association report reaches the
/// destination's `hypervisor_check_in` exactly once in oneshot mode.
#[tokio::test]
async fn oneshot_run_delivers_hypervisor_report_to_destination() {
    let config = Config {
        log_level: None,
        oneshot: true,
        sources: vec![SourceConfig::new("s1", "one-hypervisor")],
        destinations: vec![DestinationConfig::new("d1", DestinationKind::Satellite6, vec!["s1".into()])],
    };

    let manager = Arc::new(RecordingManager::default());
    let manager_for_factory = manager.clone();
    let executor = Executor::new(
        config,
        registry_with("one-hypervisor", || Box::new(OneHypervisorVirt)),
        Arc::new(move |_: &DestinationConfig| manager_for_factory.clone() as Arc<dyn Manager>),
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_reload_tx, reload_rx) = watch::channel(false);
    let outcome = executor.run(shutdown_rx, reload_rx).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let calls = manager.check_in_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].association().len(), 1);
}

/// S4: a fatal manager error in continuous mode stops every worker
/// immediately, but does not by itself reload — the run stays pending
/// until the caller pushes an explicit reload signal, at which point it
/// surfaces as `ReloadRequested`.
#[tokio::test]
async fn continuous_mode_blocks_for_explicit_reload_after_fatal_manager_error() {
    let config = Config {
        log_level: None,
        oneshot: false,
        sources: vec![SourceConfig::new("s1", "one-hypervisor")],
        destinations: vec![DestinationConfig::new("d1", DestinationKind::Satellite6, vec!["s1".into()])],
    };

    let manager = Arc::new(RecordingManager::default());
    *manager.fail_first_check_in.lock().unwrap() = true;
    let manager_for_factory = manager.clone();
    let executor = Executor::new(
        config,
        registry_with("one-hypervisor", || Box::new(OneHypervisorVirt)),
        Arc::new(move |_: &DestinationConfig| manager_for_factory.clone() as Arc<dyn Manager>),
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = watch::channel(false);
    let run = tokio::spawn(executor.run(shutdown_rx, reload_rx));

    // Nobody has pushed a reload token yet: a fatal error alone must not
    // auto-reload, so the run stays pending.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!run.is_finished());

    reload_tx.send(true).unwrap();
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), run)
        .await
        .expect("run should resolve promptly once the reload signal arrives")
        .unwrap()
        .unwrap();

    assert_eq!(outcome, RunOutcome::ReloadRequested);
    assert!(manager.check_in_calls.lock().unwrap().is_empty());
}

/// Configuration referencing an unknown source key is rejected before
/// any worker is ever spawned.
#[tokio::test]
async fn config_validation_rejects_destination_with_unknown_source_key() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
oneshot = true

[[sources]]
name = "s1"
type = "one-hypervisor"

[[destinations]]
name = "d1"
kind = "satellite6"
source_keys = ["does-not-exist"]
"#
    )
    .unwrap();

    let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("does-not-exist") || format!("{err:#}").contains("does-not-exist"));
}

/// S6: a Satellite-5 destination drops DomainListReports rather than
/// calling `send_virt_guests`, and still completes in oneshot mode.
#[tokio::test]
async fn satellite5_destination_drops_domain_list_reports_end_to_end() {
    let config = Config {
        log_level: None,
        oneshot: true,
        sources: vec![SourceConfig::new("s1", "domain-list")],
        destinations: vec![DestinationConfig::new("d1", DestinationKind::Satellite5, vec!["s1".into()])],
    };

    let manager = Arc::new(RecordingManager::default());
    let manager_for_factory = manager.clone();
    let executor = Executor::new(
        config,
        registry_with("domain-list", || Box::new(DomainListVirt)),
        Arc::new(move |_: &DestinationConfig| manager_for_factory.clone() as Arc<dyn Manager>),
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_reload_tx, reload_rx) = watch::channel(false);
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), executor.run(shutdown_rx, reload_rx))
        .await
        .expect("oneshot run should complete promptly")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(manager.domain_list_calls.lock().unwrap().is_empty());
}
