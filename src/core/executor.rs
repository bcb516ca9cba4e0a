// src/core/executor.rs

//! The Executor: builds the datastore, spawns one source worker per
//! configured source and one destination worker per configured
//! destination, and supervises them for one run of the engine
//! (`spec.md` §4.6).
//!
//! The wait/terminate loop is grounded directly on the original's
//! `Executor.wait_on_threads`/`terminate_threads` (poll
//! `is_terminated()` per thread, sleeping between passes; `stop()` then
//! join every thread) rather than the teacher's `JoinSet`-based
//! supervisor, since the original test suite
//! (`TestExecutor.test_wait_on_threads`/`test_terminate_threads`) pins
//! down exactly this polling shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::{Config, DestinationConfig, SourceConfig};
use crate::core::datastore::Datastore;
use crate::core::errors::EngineError;
use crate::core::manager::Manager;
use crate::core::tasks::destination::{DestinationWorker, Signal as DestinationSignal};
use crate::core::tasks::interval::{Terminator, WorkerHandle};
use crate::core::tasks::source::SourceWorker;
use crate::core::virt::VirtRegistry;

/// How one `Executor::run` call ended. Replaces the original's
/// `ReloadRequest` exception with a typed return value (`spec.md` §9
/// REDESIGN FLAGS: "exception-driven reload").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every worker ran to completion (oneshot mode).
    Completed,
    /// A destination reported a fatal remote error; every worker has been
    /// stopped and the caller should rebuild the Executor with fresh
    /// configuration before calling `run` again.
    ReloadRequested,
}

/// Builds a `Manager` for a given destination config. Concrete wire
/// protocols are out of scope (`spec.md` §1); callers supply their own
/// factory, keyed on whatever the destination config needs to pick an
/// endpoint.
pub type ManagerFactory = Arc<dyn Fn(&DestinationConfig) -> Arc<dyn Manager> + Send + Sync>;

pub struct Executor {
    config: Config,
    virt_registry: VirtRegistry,
    manager_factory: ManagerFactory,
    datastore: Arc<Datastore>,
}

impl Executor {
    pub fn new(config: Config, virt_registry: VirtRegistry, manager_factory: ManagerFactory) -> Self {
        Self {
            config,
            virt_registry,
            manager_factory,
            datastore: Arc::new(Datastore::new()),
        }
    }

    /// Runs every configured worker until one of: every worker completes
    /// (oneshot mode), or `reload` is set to `true` by the caller to request
    /// reconfiguration (`spec.md` §4.6's pushed `"reload"` token). A fatal
    /// manager error stops every worker immediately but is *not* by itself
    /// a reload: it then blocks until the caller explicitly sets `reload`,
    /// mirroring the original's blocking queue read after a
    /// `ManagerFatalError` (`examples/original_source/tests/test_virtwho.py`'s
    /// `TestReload` cases). `shutdown` is the external, supervisor-wide
    /// terminate signal (e.g. wired to a process signal handler by the
    /// caller).
    pub async fn run(&self, shutdown: watch::Receiver<bool>, mut reload: watch::Receiver<bool>) -> Result<RunOutcome, EngineError> {
        if self.config.sources.is_empty() {
            return Err(EngineError::Config("no sources configured".into()));
        }

        let source_configs: Arc<HashMap<String, SourceConfig>> = Arc::new(
            self.config
                .sources
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
        );

        let (signal_tx, mut signal_rx) = mpsc::channel::<DestinationSignal>(16);
        let mut handles = Vec::new();

        for source in &self.config.sources {
            let virt = self
                .virt_registry
                .build(&source.config_type)
                .ok_or_else(|| EngineError::UnknownVirtType(source.config_type.clone()))?;
            info!("starting source worker '{}'", source.name);
            let worker = SourceWorker::new(source.clone(), self.datastore.clone(), virt, self.config.oneshot);
            let term = Terminator::new(shutdown.clone());
            let handle = WorkerHandle::new(term.internal_flag(), shutdown.clone(), tokio::spawn(worker.run(term)));
            handles.push(handle);
        }

        for dest in &self.config.destinations {
            let manager = (self.manager_factory)(dest);
            info!("starting destination worker '{}'", dest.name);
            let worker = DestinationWorker::new(
                dest.clone(),
                self.datastore.clone(),
                manager,
                source_configs.clone(),
                self.config.oneshot,
                signal_tx.clone(),
            );
            let term = Terminator::new(shutdown.clone());
            let handle = WorkerHandle::new(term.internal_flag(), shutdown.clone(), tokio::spawn(worker.run(term)));
            handles.push(handle);
        }
        drop(signal_tx);

        enum Event {
            Completed,
            Fatal(String),
            Reload,
        }

        let event = tokio::select! {
            () = wait_on_threads(&handles) => Event::Completed,
            signal = signal_rx.recv() => match signal {
                Some(DestinationSignal::ManagerFatal { destination }) => Event::Fatal(destination),
                None => Event::Completed,
            },
            Ok(()) = reload.changed(), if *reload.borrow() => Event::Reload,
        };

        let outcome = match event {
            Event::Completed => {
                terminate_threads(handles).await;
                RunOutcome::Completed
            }
            Event::Reload => {
                info!("reload requested, stopping all workers");
                terminate_threads(handles).await;
                RunOutcome::ReloadRequested
            }
            Event::Fatal(destination) => {
                warn!("destination '{destination}' reported a fatal error, stopping all workers");
                terminate_threads(handles).await;
                // A fatal error alone never triggers a reload: block until an
                // explicit reload token arrives, mirroring the original's
                // blocking `queue.get()` read after a ManagerFatalError.
                while reload.changed().await.is_ok() {
                    if *reload.borrow() {
                        break;
                    }
                }
                info!("reload signal received, reloading");
                RunOutcome::ReloadRequested
            }
        };

        Ok(outcome)
    }
}

/// Polls every handle once per second until all have terminated,
/// mirroring the original's `Executor.wait_on_threads`.
async fn wait_on_threads(handles: &[WorkerHandle]) {
    loop {
        if handles.iter().all(WorkerHandle::is_terminated) {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Stops and joins every handle, mirroring the original's
/// `Executor.terminate_threads`.
async fn terminate_threads(handles: Vec<WorkerHandle>) {
    for handle in &handles {
        handle.stop();
    }
    for handle in handles {
        handle.join().await;
    }
}
