// src/core/report.rs

//! Typed report payloads and the guest/hypervisor model they carry, plus
//! the stable content hashing dedup depends on (`spec.md` §3, §4.2).

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::SourceConfig;

/// State of one virtualization guest, mirroring the original's
/// `Guest.STATE_*` constants so the wire encoding (the discriminant value)
/// stays stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestState {
    Unknown = 0,
    Running = 1,
    Blocked = 2,
    Paused = 3,
    ShuttingDown = 4,
    ShutOff = 5,
    Crashed = 6,
    PmSuspended = 7,
}

impl GuestState {
    /// A guest counts as active for subscription purposes when it is
    /// running or paused (`spec.md` §3).
    pub fn is_active(self) -> bool {
        matches!(self, GuestState::Running | GuestState::Paused)
    }
}

/// One virtual machine running on some hypervisor. Immutable after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Guest {
    pub uuid: String,
    pub state: GuestStateRepr,
    pub attributes: GuestAttributes,
}

/// `GuestState` serializes as its integer discriminant (matching the
/// original wire format); this wrapper carries both the enum and its
/// serialized form without duplicating the `Serialize` impl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestStateRepr(pub GuestState);

impl Serialize for GuestStateRepr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.0 as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestAttributes {
    pub virt_who_type: String,
    pub active: u8,
}

impl Guest {
    pub fn new(uuid: impl Into<String>, virt_who_type: impl Into<String>, state: GuestState) -> Self {
        Self {
            uuid: uuid.into(),
            state: GuestStateRepr(state),
            attributes: GuestAttributes {
                virt_who_type: virt_who_type.into(),
                active: u8::from(state.is_active()),
            },
        }
    }

    /// Canonical form used both for direct serialization and as part of a
    /// hypervisor's canonical form; keys are emitted in a fixed, sorted
    /// order via `BTreeMap` so hashing is independent of field order.
    fn canonical(&self) -> BTreeMap<&'static str, serde_json::Value> {
        let mut m = BTreeMap::new();
        m.insert("guestId".into(), serde_json::Value::from(self.uuid.clone()));
        m.insert("state".into(), serde_json::json!(self.state.0 as u8));
        m.insert(
            "attributes".into(),
            serde_json::json!({
                "virtWhoType": self.attributes.virt_who_type,
                "active": self.attributes.active,
            }),
        );
        m
    }
}

/// A host running guests, identified by `hypervisor_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypervisor {
    pub hypervisor_id: String,
    pub guests: Vec<Guest>,
    pub name: Option<String>,
    pub facts: Option<BTreeMap<String, String>>,
}

impl Hypervisor {
    pub fn new(hypervisor_id: impl Into<String>) -> Self {
        Self {
            hypervisor_id: hypervisor_id.into(),
            guests: Vec::new(),
            name: None,
            facts: None,
        }
    }

    pub fn with_guests(mut self, guests: Vec<Guest>) -> Self {
        self.guests = guests;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Canonical form: `hypervisorId`, optional `name`, optional `facts`,
    /// and `guestIds` (guests sorted by `guestId`). Used both to compute
    /// this hypervisor's own hash and as an element of a batched
    /// association report.
    fn canonical(&self) -> BTreeMap<&'static str, serde_json::Value> {
        let mut guests = self.guests.clone();
        guests.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        let guest_ids: Vec<_> = guests.iter().map(Guest::canonical).collect();

        let mut m = BTreeMap::new();
        m.insert(
            "hypervisorId".into(),
            serde_json::Value::from(self.hypervisor_id.clone()),
        );
        if let Some(name) = &self.name {
            m.insert("name".into(), serde_json::Value::from(name.clone()));
        }
        if let Some(facts) = &self.facts {
            m.insert("facts".into(), serde_json::json!(facts));
        }
        m.insert("guestIds".into(), serde_json::json!(guest_ids));
        m
    }

    /// SHA-256 hex digest of the canonical form, serialized with sorted
    /// keys. Hashing is the sole equality predicate for dedup (`spec.md`
    /// §3, testable property 1).
    pub fn hash(&self) -> String {
        sha256_hex_of_canonical(&self.canonical())
    }
}

fn sha256_hex_of_canonical(value: &BTreeMap<&'static str, serde_json::Value>) -> String {
    // `BTreeMap` + `serde_json` already serializes keys in sorted order,
    // and JSON's rendering of a given value tree is whitespace-stable
    // under `to_string`, so this is enough to guarantee hash stability
    // regardless of construction order.
    let serialized = serde_json::to_string(value).expect("canonical form is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex_encode(hasher.finalize().as_slice())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

/// Lifecycle state of an in-flight report, mutable only by the destination
/// worker that owns the submission (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Created,
    Processing,
    Finished,
    Failed,
    Canceled,
}

/// A report published by a source worker and consumed by a destination
/// worker (`spec.md` §3).
#[derive(Debug, Clone)]
pub enum Report {
    DomainList(DomainListReport),
    HostGuestAssociation(HostGuestAssociationReport),
    Error(ErrorReport),
}

impl Report {
    pub fn config_name(&self) -> &str {
        match self {
            Report::DomainList(r) => &r.config_name,
            Report::HostGuestAssociation(r) => &r.config_name,
            Report::Error(r) => &r.config_name,
        }
    }

    pub fn state(&self) -> ReportState {
        match self {
            Report::DomainList(r) => r.state,
            Report::HostGuestAssociation(r) => r.state,
            Report::Error(r) => r.state,
        }
    }

    pub fn set_state(&mut self, state: ReportState) {
        match self {
            Report::DomainList(r) => r.state = state,
            Report::HostGuestAssociation(r) => r.state = state,
            Report::Error(r) => r.state = state,
        }
    }

    /// Content hash; `None` for `ErrorReport`, which carries no content to
    /// dedup against.
    pub fn hash(&self) -> Option<String> {
        match self {
            Report::DomainList(r) => Some(r.hash()),
            Report::HostGuestAssociation(r) => Some(r.hash()),
            Report::Error(_) => None,
        }
    }
}

/// Report from a non-hypervisor source about its own guest list.
#[derive(Debug, Clone)]
pub struct DomainListReport {
    pub config_name: String,
    pub guests: Vec<Guest>,
    pub hypervisor_id: Option<String>,
    pub state: ReportState,
}

impl DomainListReport {
    pub fn new(config_name: impl Into<String>, guests: Vec<Guest>, hypervisor_id: Option<String>) -> Self {
        Self {
            config_name: config_name.into(),
            guests,
            hypervisor_id,
            state: ReportState::Created,
        }
    }

    /// SHA-256 of the sorted serialized guest list concatenated with the
    /// hypervisor id string (`spec.md` §3).
    pub fn hash(&self) -> String {
        let mut guests = self.guests.clone();
        guests.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        let serialized: Vec<_> = guests.iter().map(Guest::canonical).collect();
        let json = serde_json::to_string(&serialized).expect("guest list is always serializable");
        let suffix = match &self.hypervisor_id {
            Some(id) => id.clone(),
            None => "None".to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hasher.update(suffix.as_bytes());
        hex_encode(hasher.finalize().as_slice())
    }
}

/// Report from a hypervisor source about host/guest associations, with
/// lazily-applied include/exclude filters (`spec.md` §4.2).
#[derive(Debug, Clone)]
pub struct HostGuestAssociationReport {
    pub config_name: String,
    pub hypervisors: Vec<Hypervisor>,
    pub exclude_hosts: Option<Vec<String>>,
    pub filter_hosts: Option<Vec<String>>,
    pub state: ReportState,
}

impl HostGuestAssociationReport {
    pub fn new(config_name: impl Into<String>, hypervisors: Vec<Hypervisor>, config: &SourceConfig) -> Self {
        Self {
            config_name: config_name.into(),
            hypervisors,
            exclude_hosts: config.exclude_hosts.clone(),
            filter_hosts: config.filter_hosts.clone(),
            state: ReportState::Created,
        }
    }

    /// Builds a report directly from already-known filters, bypassing a
    /// `SourceConfig` lookup. Used by tests and by a destination worker
    /// constructing a synthetic batched report out of several sources'
    /// already-filtered hypervisors (no further filtering applies there).
    pub fn with_filters(
        config_name: impl Into<String>,
        hypervisors: Vec<Hypervisor>,
        exclude_hosts: Option<Vec<String>>,
        filter_hosts: Option<Vec<String>>,
    ) -> Self {
        Self {
            config_name: config_name.into(),
            hypervisors,
            exclude_hosts,
            filter_hosts,
            state: ReportState::Created,
        }
    }

    /// Applies exclude-then-include filtering in order, per hypervisor
    /// (`spec.md` §4.2):
    /// 1. drop if an exclude pattern matches the hypervisor id;
    /// 2. else drop if an include list is present and nothing matches;
    /// 3. otherwise keep.
    pub fn association(&self) -> Vec<&Hypervisor> {
        self.hypervisors
            .iter()
            .filter(|h| {
                if let Some(exclude) = &self.exclude_hosts
                    && matches_any(&h.hypervisor_id, exclude)
                {
                    return false;
                }
                if let Some(include) = &self.filter_hosts
                    && !matches_any(&h.hypervisor_id, include)
                {
                    return false;
                }
                true
            })
            .collect()
    }

    /// SHA-256 of the filtered, serialized association (hypervisors sorted
    /// by `hypervisorId`).
    pub fn hash(&self) -> String {
        let mut filtered: Vec<_> = self.association().into_iter().cloned().collect();
        filtered.sort_by(|a, b| a.hypervisor_id.cmp(&b.hypervisor_id));
        let serialized: Vec<_> = filtered.iter().map(Hypervisor::canonical).collect();
        let mut m = BTreeMap::new();
        m.insert("hypervisors", serde_json::json!(serialized));
        sha256_hex_of_canonical(&m)
    }
}

/// A pattern matches case-insensitively if either the shell-style glob
/// matches the full id, or the string interpreted as an anchored regular
/// expression (`^pattern$`, case-insensitive) matches. A malformed regex is
/// treated as a non-match, never as an error (`spec.md` §4.2).
fn matches_pattern(host: &str, pattern: &str) -> bool {
    let lower_host = host.to_lowercase();
    let lower_pattern = pattern.to_lowercase();
    if wildmatch::WildMatch::new(&lower_pattern).matches(&lower_host) {
        return true;
    }
    let anchored = format!("^{pattern}$");
    match regex::RegexBuilder::new(&anchored)
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re.is_match(host),
        Err(_) => false,
    }
}

fn matches_any(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches_pattern(host, p))
}

/// Marker payload signalling that a source failed to produce data this
/// cycle.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub config_name: String,
    pub state: ReportState,
}

impl ErrorReport {
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            state: ReportState::Created,
        }
    }
}
