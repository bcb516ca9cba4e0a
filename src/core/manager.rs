// src/core/manager.rs

//! The `Manager` trait: the interface a destination worker uses to talk
//! to a remote subscription-management endpoint (Satellite-5,
//! Satellite-6/Candlepin). Concrete wire protocols are out of scope
//! (`spec.md` §1); only the trait contract is in scope (`spec.md` §6).

use async_trait::async_trait;

use crate::core::errors::ManagerError;
use crate::core::report::{DomainListReport, HostGuestAssociationReport, ReportState};

/// Options threaded through to a `Manager` call. The original passes an
/// `options` bag (including print-mode and similar CLI-derived flags);
/// CLI/env layering is out of scope here, so this only carries the one
/// piece of per-call context destination workers need.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub owner: Option<String>,
}

/// Outcome of a `hypervisor_check_in` call: either the destination
/// processed the report synchronously and returned a terminal state, or
/// it handed back an opaque job handle to poll via `check_report_state`
/// (`spec.md` §4.5, §6).
#[derive(Debug, Clone)]
pub enum CheckInResult {
    Sync(ReportState),
    Async(AsyncJob),
}

/// An opaque async job handle plus its last known state.
#[derive(Debug, Clone)]
pub struct AsyncJob {
    pub job_id: String,
    pub state: ReportState,
}

/// A remote subscription-management destination.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Submits a (possibly batched) host/guest association report.
    async fn hypervisor_check_in(
        &self,
        report: &HostGuestAssociationReport,
        options: &SendOptions,
    ) -> Result<CheckInResult, ManagerError>;

    /// Polls and returns the latest state of a previously submitted async
    /// job.
    async fn check_report_state(&self, job: &AsyncJob) -> Result<ReportState, ManagerError>;

    /// Submits a domain-list report (non-hypervisor sources).
    async fn send_virt_guests(
        &self,
        report: &DomainListReport,
        options: &SendOptions,
    ) -> Result<(), ManagerError>;

    /// Fallback hostname lookup used on a socket error when the
    /// destination config has no `rhsm_hostname` set, mirroring the
    /// original's `rhsm_config.get("server", "hostname")` (`SPEC_FULL.md`
    /// §3). Most implementations have no such fallback.
    fn fallback_hostname(&self) -> Option<String> {
        None
    }
}
