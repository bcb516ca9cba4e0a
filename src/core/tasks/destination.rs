// src/core/tasks/destination.rs

//! The destination worker: pulls reports for a fixed set of source keys
//! from the datastore, batches/dedups them, and submits them to a remote
//! `Manager`, handling 429 back-off and async job polling (`spec.md`
//! §4.5).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{DestinationConfig, SourceConfig};
use crate::core::datastore::{CONSUMERS_KEY, Datastore, Value};
use crate::core::errors::ManagerError;
use crate::core::manager::{CheckInResult, Manager, SendOptions};
use crate::core::report::{HostGuestAssociationReport, Report, ReportState};
use crate::core::tasks::interval::{IntervalTask, Terminator, handle_429, run_interval_loop};

/// Signals a destination worker raises for the Executor to act on
/// (`spec.md` §4.6, §7): a fatal manager error in continuous mode.
#[derive(Debug, Clone)]
pub enum Signal {
    ManagerFatal { destination: String },
}

pub struct DestinationWorker {
    config: DestinationConfig,
    datastore: Arc<Datastore>,
    manager: Arc<dyn Manager>,
    source_configs: Arc<HashMap<String, SourceConfig>>,
    source_keys: Vec<String>,
    last_report_for_source: HashMap<String, String>,
    is_initial_run: bool,
    oneshot: bool,
    owner: Option<String>,
    signal_tx: mpsc::Sender<Signal>,
    /// Print-mode: gather and dedup as usual but never actually submit to
    /// `manager`; accumulate what would have been sent instead
    /// (`SPEC_FULL.md` §3, the original's `options.print_`).
    dry_run: bool,
    dry_run_reports: Vec<Report>,
}

impl DestinationWorker {
    pub fn new(
        config: DestinationConfig,
        datastore: Arc<Datastore>,
        manager: Arc<dyn Manager>,
        source_configs: Arc<HashMap<String, SourceConfig>>,
        oneshot: bool,
        signal_tx: mpsc::Sender<Signal>,
    ) -> Self {
        let source_keys = config.source_keys.clone();
        Self {
            config,
            datastore,
            manager,
            source_configs,
            source_keys,
            last_report_for_source: HashMap::new(),
            is_initial_run: true,
            oneshot,
            owner: None,
            signal_tx,
            dry_run: false,
            dry_run_reports: Vec::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reports that would have been submitted, collected instead of sent
    /// while `dry_run` is set.
    pub fn dry_run_reports(&self) -> &[Report] {
        &self.dry_run_reports
    }

    /// Runs the destination worker until `term` is terminated, via the
    /// shared interval skeleton (`spec.md` §4.3, §4.5). A single
    /// pull/dispatch cycle fully resolves every currently-known source in
    /// oneshot mode, since dispatch's own retry loops don't return until
    /// each report is finally accepted, throttled away, or fatally
    /// rejected.
    pub async fn run(self, term: Terminator) {
        let interval = self.config.interval();
        let oneshot = self.oneshot;
        run_interval_loop(self, term, interval, oneshot).await;
    }

    async fn pull(&mut self, term: &Terminator) -> HashMap<String, Report> {
        if self.is_initial_run {
            self.get_data_initial(term).await
        } else {
            self.get_data_common(&self.source_keys.clone(), false, true)
        }
    }

    /// Polls every source key once per second until each has produced a
    /// report or the full interval elapses; duplicates are not suppressed
    /// on this first pull (`spec.md` §4.5).
    async fn get_data_initial(&mut self, term: &Terminator) -> HashMap<String, Report> {
        let mut reports = HashMap::new();
        while reports.is_empty() && !term.is_terminated() {
            let mut remaining: std::collections::HashSet<String> = self.source_keys.iter().cloned().collect();
            let mut time_waited = 0u64;
            while !remaining.is_empty() && time_waited < self.config.interval() && !term.is_terminated() {
                let keys: Vec<String> = remaining.iter().cloned().collect();
                let found = self.get_data_common(&keys, true, false);
                for key in found.keys() {
                    remaining.remove(key);
                }
                reports.extend(found);
                if !remaining.is_empty() {
                    term.wait(1).await;
                    time_waited += 1;
                }
            }
        }
        self.is_initial_run = false;
        reports
    }

    /// Reads each of `source_keys` once, skipping ones whose current
    /// report hash equals the last one successfully submitted for that
    /// key (unless `ignore_duplicates`).
    fn get_data_common(&self, source_keys: &[String], ignore_duplicates: bool, log_missing: bool) -> HashMap<String, Report> {
        let mut reports = HashMap::new();
        for key in source_keys {
            let Some(value) = self.datastore.get(key) else {
                if log_missing {
                    debug!("no report available for source: {key}");
                }
                continue;
            };
            let Some(report) = value.as_report() else {
                continue;
            };
            if !ignore_duplicates
                && let Some(hash) = report.hash()
                && self.last_report_for_source.get(key) == Some(&hash)
            {
                debug!("duplicate report found for config '{key}', ignoring");
                continue;
            }
            reports.insert(key.clone(), report.clone());
        }
        reports
    }

    async fn dispatch(&mut self, data: HashMap<String, Report>, term: &Terminator) {
        if data.is_empty() {
            debug!("no data to send, waiting for next interval");
            return;
        }

        self.update_consumers(&data);

        if self.dry_run {
            self.run_dry(data);
        } else if self.config.kind == crate::config::DestinationKind::Satellite5 {
            self.send_data_satellite5(data, term).await;
        } else {
            self.send_data_default(data, term).await;
        }
    }

    /// Records what would have been sent instead of calling `manager`
    /// (`SPEC_FULL.md` §3).
    fn run_dry(&mut self, data: HashMap<String, Report>) {
        let mut sources_sent = Vec::new();
        for (source_key, report) in data {
            debug!("dry run: would send report for source '{source_key}'");
            if let Some(hash) = report.hash() {
                self.last_report_for_source.insert(source_key.clone(), hash);
            }
            self.dry_run_reports.push(report);
            sources_sent.push(source_key);
        }
        self.finish_cycle(sources_sent, Vec::new());
    }

    fn update_consumers(&self, data: &HashMap<String, Report>) {
        let Some(hostname) = &self.config.rhsm_hostname else {
            return;
        };
        let relevant: Vec<Vec<String>> = data
            .values()
            .filter_map(|r| match r {
                Report::HostGuestAssociation(a) => Some(
                    a.association()
                        .into_iter()
                        .map(|h| h.hypervisor_id.clone())
                        .collect::<Vec<_>>(),
                ),
                _ => None,
            })
            .collect();
        if relevant.is_empty() {
            return;
        }
        let hostname = hostname.clone();
        self.datastore.update(CONSUMERS_KEY, Value::Consumers(HashMap::new()), move |current| {
            let mut consumers = match current {
                Value::Consumers(m) => m,
                _ => HashMap::new(),
            };
            for hyp_ids in &relevant {
                for hyp_id in hyp_ids {
                    let list = consumers.entry(hyp_id.clone()).or_default();
                    if !list.contains(&hostname) {
                        list.push(hostname.clone());
                    }
                }
            }
            Value::Consumers(consumers)
        });
    }

    fn remove_unreachable_consumer(&self) {
        let Some(hostname) = self.config.rhsm_hostname.clone().or_else(|| self.manager.fallback_hostname()) else {
            return;
        };
        self.datastore.update(CONSUMERS_KEY, Value::Consumers(HashMap::new()), move |current| {
            let mut consumers = match current {
                Value::Consumers(m) => m,
                _ => HashMap::new(),
            };
            for list in consumers.values_mut() {
                list.retain(|h| h != &hostname);
            }
            Value::Consumers(consumers)
        });
    }

    fn adopt_owner(&mut self, source_key: &str) {
        if self.owner.is_some() {
            return;
        }
        if let Some(cfg) = self.source_configs.get(source_key) {
            self.owner = cfg.owner.clone();
        }
    }

    async fn send_data_default(&mut self, data: HashMap<String, Report>, term: &Terminator) {
        let mut all_hypervisors = Vec::new();
        let mut domain_list_reports = Vec::new();
        let mut reports_batched = Vec::new();
        let mut sources_sent = Vec::new();
        let mut sources_erred = Vec::new();

        for (source_key, report) in &data {
            self.adopt_owner(source_key);
            match report {
                Report::DomainList(_) => domain_list_reports.push(source_key.clone()),
                Report::HostGuestAssociation(assoc) => {
                    all_hypervisors.extend(assoc.association().into_iter().cloned());
                    reports_batched.push(source_key.clone());
                }
                Report::Error(_) => {
                    debug!("ErrorReport received for source: {source_key}");
                    if self.oneshot {
                        sources_erred.push(source_key.clone());
                    }
                }
            }
        }

        if !all_hypervisors.is_empty() {
            let batch = HostGuestAssociationReport::with_filters(&self.config.name, all_hypervisors, None, None);
            let options = SendOptions { owner: self.owner.clone() };

            let mut num_429 = 0u64;
            let mut check_in_result = None;
            loop {
                if term.is_terminated() {
                    break;
                }
                match self.manager.hypervisor_check_in(&batch, &options).await {
                    Ok(result) => {
                        check_in_result = Some(result);
                        break;
                    }
                    Err(ManagerError::Throttle { retry_after }) => {
                        if self.oneshot {
                            error!("429 encountered during hypervisor checkin, fatal in oneshot mode");
                            sources_erred.extend(reports_batched.iter().cloned());
                            break;
                        }
                        num_429 += 1;
                        let wait = handle_429(retry_after, num_429);
                        debug!("429 encountered, trying again in {wait}s");
                        term.wait(wait).await;
                    }
                    Err(ManagerError::Recoverable(msg)) => {
                        error!("error during hypervisor checkin: {msg}");
                        if self.oneshot {
                            sources_erred.extend(reports_batched.iter().cloned());
                        }
                        break;
                    }
                    Err(ManagerError::Fatal(msg)) => {
                        error!("fatal error during hypervisor checkin: {msg}");
                        if self.oneshot {
                            sources_erred.extend(reports_batched.iter().cloned());
                        } else {
                            let _ = self
                                .signal_tx
                                .send(Signal::ManagerFatal { destination: self.config.name.clone() })
                                .await;
                        }
                        break;
                    }
                    Err(ManagerError::Socket(msg)) => {
                        error!("network error reaching destination: {msg}");
                        self.remove_unreachable_consumer();
                        break;
                    }
                }
            }

            if let Some(result) = check_in_result {
                let final_state = match result {
                    CheckInResult::Sync(state) => state,
                    CheckInResult::Async(job) => {
                        let job_id = job.job_id;
                        let mut state = job.state;
                        let mut num_429_poll = 0u64;
                        let mut first_poll = true;
                        loop {
                            if matches!(state, ReportState::Canceled | ReportState::Failed | ReportState::Finished) {
                                break;
                            }
                            if term.is_terminated() {
                                break;
                            }
                            if !first_poll {
                                term.wait(self.config.polling_interval()).await;
                            }
                            first_poll = false;
                            let job = crate::core::manager::AsyncJob { job_id: job_id.clone(), state };
                            match self.manager.check_report_state(&job).await {
                                Ok(new_state) => state = new_state,
                                Err(ManagerError::Throttle { retry_after }) => {
                                    if self.oneshot {
                                        error!("429 encountered while checking job state, fatal in oneshot mode");
                                        sources_erred.extend(reports_batched.iter().cloned());
                                        break;
                                    }
                                    num_429_poll += 1;
                                    let wait = handle_429(retry_after, num_429_poll);
                                    debug!("429 encountered while checking job state, checking again in {wait}s");
                                    term.wait(wait).await;
                                }
                                Err(_) => {
                                    error!("error during job state check");
                                    if self.oneshot {
                                        sources_erred.extend(reports_batched.iter().cloned());
                                    }
                                    break;
                                }
                            }
                        }
                        state
                    }
                };
                if final_state == ReportState::Finished {
                    for key in &reports_batched {
                        if let Some(hash) = data[key].hash() {
                            self.last_report_for_source.insert(key.clone(), hash);
                        }
                        sources_sent.push(key.clone());
                    }
                }
            }
        }

        for source_key in &domain_list_reports {
            let Report::DomainList(report) = &data[source_key] else { unreachable!() };
            let options = SendOptions { owner: self.owner.clone() };
            let mut num_429 = 0u64;
            loop {
                if term.is_terminated() {
                    break;
                }
                match self.manager.send_virt_guests(report, &options).await {
                    Ok(()) => {
                        sources_sent.push(source_key.clone());
                        self.last_report_for_source.insert(source_key.clone(), report.hash());
                        break;
                    }
                    Err(ManagerError::Throttle { retry_after }) => {
                        if self.oneshot {
                            error!("429 encountered sending virt guests, fatal in oneshot mode");
                            sources_erred.push(source_key.clone());
                            break;
                        }
                        num_429 += 1;
                        let wait = handle_429(retry_after, num_429);
                        debug!("429 encountered sending virt guests, retrying after {wait}s");
                        term.wait(wait).await;
                    }
                    Err(ManagerError::Fatal(msg)) if !self.oneshot => {
                        error!("fatal error sending virt guests: {msg}");
                        let _ = self
                            .signal_tx
                            .send(Signal::ManagerFatal { destination: self.config.name.clone() })
                            .await;
                        break;
                    }
                    Err(e) => {
                        error!("error sending virt guests: {e}");
                        if self.oneshot {
                            sources_erred.push(source_key.clone());
                        }
                        break;
                    }
                }
            }
        }

        self.finish_cycle(sources_sent, sources_erred);
    }

    /// Satellite-5 deviations (`spec.md` §4.5): DomainListReports are
    /// unsupported (drop with a warning); HostGuestAssociationReports are
    /// submitted unbatched, one `hypervisor_check_in` per report; an
    /// ErrorReport whose source is this worker's own config triggers
    /// immediate shutdown.
    async fn send_data_satellite5(&mut self, data: HashMap<String, Report>, term: &Terminator) {
        let mut sources_sent = Vec::new();
        let mut sources_erred = Vec::new();

        for (source_key, report) in &data {
            match report {
                Report::DomainList(_) => {
                    warn!(
                        "virt-who does not support sending local hypervisor data to satellite; dropping offending source '{source_key}'"
                    );
                    // Permanently unsupported, not a transient failure: treat
                    // as handled so the source is dropped rather than retried.
                    sources_sent.push(source_key.clone());
                }
                Report::HostGuestAssociation(assoc) => {
                    let options = SendOptions { owner: self.owner.clone() };
                    let mut num_429 = 0u64;
                    loop {
                        if term.is_terminated() {
                            break;
                        }
                        match self.manager.hypervisor_check_in(assoc, &options).await {
                            Ok(_) => {
                                self.last_report_for_source.insert(source_key.clone(), assoc.hash());
                                sources_sent.push(source_key.clone());
                                break;
                            }
                            Err(ManagerError::Throttle { retry_after }) => {
                                if self.oneshot {
                                    error!("429 encountered during hypervisor checkin, fatal in oneshot mode");
                                    sources_erred.push(source_key.clone());
                                    break;
                                }
                                num_429 += 1;
                                let wait = handle_429(retry_after, num_429);
                                debug!("429 encountered, trying again in {wait}s");
                                term.wait(wait).await;
                            }
                            Err(ManagerError::Fatal(msg)) => {
                                error!("fatal error during hypervisor checkin: {msg}");
                                sources_erred.push(source_key.clone());
                                break;
                            }
                            Err(e) => {
                                error!("error during hypervisor checkin: {e}");
                                sources_erred.push(source_key.clone());
                                break;
                            }
                        }
                    }
                }
                Report::Error(_) => {
                    debug!("ErrorReport received for source: {source_key}");
                    if source_key == &self.config.name {
                        term.stop();
                        return;
                    }
                    if self.oneshot {
                        sources_sent.push(source_key.clone());
                    }
                }
            }
        }

        self.finish_cycle(sources_sent, sources_erred);
    }

    /// Removes sent sources from `source_keys` in oneshot mode, and stops
    /// this worker once every originally-configured source has been sent
    /// or erred (`spec.md` §4.5).
    fn finish_cycle(&mut self, sources_sent: Vec<String>, sources_erred: Vec<String>) {
        let all_handled = self
            .source_keys
            .iter()
            .all(|k| sources_sent.contains(k) || sources_erred.contains(k));

        if self.oneshot {
            self.source_keys.retain(|k| !sources_sent.contains(k));
            if all_handled {
                debug!("at least one report for each connected source has been sent or dropped");
            }
        }
    }
}

#[async_trait]
impl IntervalTask for DestinationWorker {
    type Data = HashMap<String, Report>;

    async fn get_data(&mut self, term: &Terminator) -> Self::Data {
        self.pull(term).await
    }

    async fn send_data(&mut self, data: Self::Data, term: &Terminator) {
        self.dispatch(data, term).await;
    }
}
