// src/config.rs

//! Manages engine configuration: loading from TOML, resolving defaults, and
//! validation. CLI/environment option layering is out of scope (see
//! `spec.md` §1); this module only covers the `Config`/`DestinationConfig`
//! data model and the minimal file-loading needed to run the engine.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// Lower bound on any worker's polling interval, in seconds. Configured
/// intervals below this are clamped up to it at load time (`spec.md` §6,
/// testable property 2).
pub const MIN_SEND_INTERVAL_SECS: u64 = 60;

/// Interval used when a source config does not specify one.
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;

/// Configuration for a single source (one virtualization backend
/// instance). `name` is unique and doubles as the datastore key the
/// corresponding source worker writes reports under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name; also the datastore key this source publishes under.
    pub name: String,
    /// Backend tag (e.g. "esx", "libvirt", "hyperv"); selects the `Virt`
    /// implementation from the registration table.
    #[serde(rename = "type")]
    pub config_type: String,
    /// Polling interval in seconds, clamped to at least
    /// [`MIN_SEND_INTERVAL_SECS`].
    #[serde(default = "default_interval")]
    interval_raw: u64,
    /// Owner account, filled in once by the first destination worker that
    /// sees a report from this source, if not already set here.
    #[serde(default)]
    pub owner: Option<String>,
    /// Hypervisor ids to drop unconditionally.
    #[serde(default)]
    pub exclude_hosts: Option<Vec<String>>,
    /// If set, only hypervisor ids matching one of these patterns survive.
    #[serde(default)]
    pub filter_hosts: Option<Vec<String>>,
    /// Hostname of the candlepin/RHSM server this source's destination
    /// reports belong to; used for consumers-map bookkeeping and as a
    /// socket-error fallback key.
    #[serde(default)]
    pub rhsm_hostname: Option<String>,
    /// How often to poll for async job completion; defaults to `interval`.
    #[serde(default)]
    polling_interval_raw: Option<u64>,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, config_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config_type: config_type.into(),
            interval_raw: DEFAULT_INTERVAL_SECS,
            owner: None,
            exclude_hosts: None,
            filter_hosts: None,
            rhsm_hostname: None,
            polling_interval_raw: None,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_raw = secs;
        self
    }

    /// The effective interval, clamped to [`MIN_SEND_INTERVAL_SECS`].
    pub fn interval(&self) -> u64 {
        self.interval_raw.max(MIN_SEND_INTERVAL_SECS)
    }

    /// The effective polling interval; falls back to `interval()` when
    /// unset, matching the original's `polling_interval or self.interval`.
    pub fn polling_interval(&self) -> u64 {
        self.polling_interval_raw
            .unwrap_or(self.interval_raw)
            .max(MIN_SEND_INTERVAL_SECS)
    }
}

/// Identifies one of the supported destination backends. The Executor maps
/// each variant to a concrete destination-worker construction (`spec.md`
/// §3/§4.6): `Satellite5` gets the unbatched, drop-DomainListReport
/// variant; everything else gets the generic batching worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationKind {
    Satellite5,
    Satellite6,
    Default,
}

/// Configuration for one destination (a remote subscription manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    pub kind: DestinationKind,
    /// The source keys this destination pulls reports for.
    pub source_keys: Vec<String>,
    #[serde(default = "default_interval")]
    interval_raw: u64,
    #[serde(default)]
    polling_interval_raw: Option<u64>,
    #[serde(default)]
    pub rhsm_hostname: Option<String>,
}

impl DestinationConfig {
    pub fn new(name: impl Into<String>, kind: DestinationKind, source_keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            source_keys,
            interval_raw: DEFAULT_INTERVAL_SECS,
            polling_interval_raw: None,
            rhsm_hostname: None,
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_raw = secs;
        self
    }

    pub fn interval(&self) -> u64 {
        self.interval_raw.max(MIN_SEND_INTERVAL_SECS)
    }

    pub fn polling_interval(&self) -> u64 {
        self.polling_interval_raw
            .unwrap_or(self.interval_raw)
            .max(MIN_SEND_INTERVAL_SECS)
    }
}

/// Top-level engine configuration: the set of sources and destinations the
/// Executor should build workers for, plus whether to run in oneshot mode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub oneshot: bool,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

impl Config {
    /// Loads and validates a `Config` from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("configuration must declare at least one source"));
        }
        if self.destinations.is_empty() {
            return Err(anyhow!(
                "configuration must declare at least one destination"
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(anyhow!("duplicate source name '{}'", source.name));
            }
        }
        for dest in &self.destinations {
            for key in &dest.source_keys {
                if !self.sources.iter().any(|s| &s.name == key) {
                    return Err(anyhow!(
                        "destination '{}' references unknown source key '{}'",
                        dest.name,
                        key
                    ));
                }
            }
        }
        Ok(())
    }
}
