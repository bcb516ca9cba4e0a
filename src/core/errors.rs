// src/core/errors.rs

//! Error taxonomy for the engine: the manager-facing error kinds a
//! destination worker reacts to, and the engine-internal errors that a
//! source worker converts into an ErrorReport.

use thiserror::Error;

/// Errors a [`Manager`](crate::core::manager::Manager) implementation can
/// return from `hypervisor_check_in`, `check_report_state`, or
/// `send_virt_guests`.
///
/// This mirrors the distinction the original engine draws between a 429
/// throttle (retry with backoff), a recoverable error (abandon this cycle,
/// retry next cycle with the same content), and a fatal error (surface to
/// the supervisor).
#[derive(Error, Debug, Clone)]
pub enum ManagerError {
    /// HTTP 429 or equivalent: the destination asked us to slow down.
    #[error("destination throttled the request, retry after {retry_after:?}s")]
    Throttle { retry_after: Option<u64> },

    /// A recoverable error: log it, abandon this cycle, try again next time.
    #[error("recoverable manager error: {0}")]
    Recoverable(String),

    /// A fatal, non-recoverable error. In continuous mode this is surfaced
    /// to the Executor, which stops every worker and awaits a reload.
    #[error("fatal manager error: {0}")]
    Fatal(String),

    /// A raw network/socket failure talking to the destination. The
    /// destination's hostname is purged from the consumers map.
    #[error("network error reaching destination: {0}")]
    Socket(String),
}

impl ManagerError {
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ManagerError::Throttle { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, ManagerError::Throttle { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ManagerError::Fatal(_))
    }

    pub fn is_socket(&self) -> bool {
        matches!(self, ManagerError::Socket(_))
    }
}

/// Errors raised by a source's discovery routine (the `Virt` trait). These
/// never propagate out of the interval worker's loop; they are caught and
/// turned into an `ErrorReport` delivered to the datastore for that source.
#[derive(Error, Debug, Clone)]
pub enum VirtError {
    #[error("virtualization backend error: {0}")]
    Backend(String),

    #[error("backend connection error: {0}")]
    Connection(String),
}

/// Errors surfaced directly by engine plumbing: configuration, the
/// datastore, or worker construction. Not part of the steady-state
/// source/destination error taxonomy in spec.md §7, but needed for a
/// runnable binary (config loading is an ambient concern, see SPEC_FULL.md).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown virtualization backend type: {0}")]
    UnknownVirtType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}
