// src/core/virt.rs

//! The `Virt` trait: the interface a concrete virtualization backend
//! adapter (ESX, Hyper-V, RHEV-M, libvirt, ...) must implement. Concrete
//! adapters are out of scope for this engine (`spec.md` §1); only the
//! trait contract and a dispatch table keyed by config tag are in scope.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::SourceConfig;
use crate::core::datastore::Datastore;
use crate::core::errors::VirtError;
use crate::core::report::{Guest, Hypervisor};
use crate::core::tasks::interval::Terminator;

/// Association of hypervisors to guests returned by a hypervisor backend.
#[derive(Debug, Clone, Default)]
pub struct HostGuestMapping {
    pub hypervisors: Vec<Hypervisor>,
}

/// A virtualization backend adapter. Implementors either answer
/// `is_hypervisor()` + one of `get_host_guest_mapping`/`list_domains`, or
/// override `run_event_driven` wholesale to replace periodic polling with
/// an event-driven discovery loop (`spec.md` §4.4, §6).
#[async_trait]
pub trait Virt: Send + Sync {
    /// The config `type` tag this implementation answers to.
    fn config_type(&self) -> &'static str;

    /// True when this backend represents a hypervisor environment (and
    /// thus reports host/guest associations) rather than a single guest
    /// reporting its own domain list.
    fn is_hypervisor(&self) -> bool {
        true
    }

    async fn get_host_guest_mapping(&self) -> Result<HostGuestMapping, VirtError> {
        Err(VirtError::Backend(
            "get_host_guest_mapping not implemented for this backend".into(),
        ))
    }

    async fn list_domains(&self) -> Result<Vec<Guest>, VirtError> {
        Err(VirtError::Backend(
            "list_domains not implemented for this backend".into(),
        ))
    }

    /// True for a backend that replaces the periodic poll entirely with
    /// `run_event_driven` (`spec.md` §4.4).
    fn is_event_driven(&self) -> bool {
        false
    }

    /// Overrides the source worker's periodic poll wholesale. The only
    /// contract: publish a report into `datastore` under `config.name` at
    /// most once per distinct observed state, and honor `term.is_terminated()`
    /// within one interval. The default polling loop never calls this.
    async fn run_event_driven(&mut self, _datastore: Arc<Datastore>, _config: &SourceConfig, _term: &Terminator) {}
}

/// Constructs a `Virt` instance from a config `type` tag. Replaces the
/// original's runtime subclass registration (`__subclasses__()`) with an
/// explicit table populated at startup (`spec.md` §9 "Polymorphic worker
/// dispatch"), grounded on the teacher's tag-driven construction pattern
/// (`examples/spineldb-spineldb/src/core/cluster/config.rs`).
pub type VirtFactory = fn() -> Box<dyn Virt>;

#[derive(Default)]
pub struct VirtRegistry {
    factories: std::collections::HashMap<&'static str, VirtFactory>,
}

impl VirtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config_type: &'static str, factory: VirtFactory) -> &mut Self {
        self.factories.insert(config_type, factory);
        self
    }

    pub fn build(&self, config_type: &str) -> Option<Box<dyn Virt>> {
        self.factories.get(config_type).map(|f| f())
    }

    pub fn supported_types(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}
