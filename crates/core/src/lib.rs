//! Mimir coordinator core types: relation snapshots, worker units, rendered views and pass results.

#![forbid(unsafe_code)]

pub mod diag;
pub mod role;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use diag::{Diagnostic, Severity};
pub use role::{WorkerRole, MINIMAL_DEPLOYMENT};

pub type UnitId = String;
pub type Payload = BTreeMap<String, String>;

/// External dependency the coordinator consumes through a relation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    #[serde(rename = "s3", alias = "object-storage")]
    ObjectStorage,
    #[serde(rename = "certificates")]
    Certificates,
    #[serde(rename = "ingress")]
    Ingress,
    #[serde(rename = "workload-tracing", alias = "tracing")]
    Tracing,
    #[serde(rename = "logging", alias = "logging-consumer")]
    Logging,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 5] = [
        DependencyKind::ObjectStorage,
        DependencyKind::Certificates,
        DependencyKind::Ingress,
        DependencyKind::Tracing,
        DependencyKind::Logging,
    ];

    pub fn relation_name(self) -> &'static str {
        match self {
            DependencyKind::ObjectStorage => "s3",
            DependencyKind::Certificates => "certificates",
            DependencyKind::Ingress => "ingress",
            DependencyKind::Tracing => "workload-tracing",
            DependencyKind::Logging => "logging",
        }
    }

    pub fn from_relation_name(name: &str) -> Option<Self> {
        match name {
            "s3" | "object-storage" => Some(DependencyKind::ObjectStorage),
            "certificates" => Some(DependencyKind::Certificates),
            "ingress" => Some(DependencyKind::Ingress),
            "workload-tracing" | "tracing" => Some(DependencyKind::Tracing),
            "logging" | "logging-consumer" => Some(DependencyKind::Logging),
            _ => None,
        }
    }

    /// Object storage is mandatory; everything else is optional.
    pub fn is_required(self) -> bool { matches!(self, DependencyKind::ObjectStorage) }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.relation_name()) }
}

/// One active relation as handed in by the boundary layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationSnapshot {
    pub kind: DependencyKind,
    pub id: String,
    #[serde(default)]
    pub data: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependency {
    pub kind: DependencyKind,
    /// A relation of this kind exists, valid or not.
    pub present: bool,
    pub satisfied: bool,
    /// Canonicalized payload when satisfied; empty otherwise.
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

impl Dependency {
    pub fn absent(kind: DependencyKind) -> Self {
        Self { kind, present: false, satisfied: false, payload: Payload::new(), problem: Some("relation absent".into()) }
    }

    pub fn invalid(kind: DependencyKind, problem: impl Into<String>) -> Self {
        Self { kind, present: true, satisfied: false, payload: Payload::new(), problem: Some(problem.into()) }
    }

    pub fn ready(kind: DependencyKind, payload: Payload) -> Self {
        Self { kind, present: true, satisfied: true, payload, problem: None }
    }

    pub fn is_absent(&self) -> bool { !self.present }

    /// Present but rejected by validation.
    pub fn is_invalid(&self) -> bool { self.present && !self.satisfied }
}

/// Dependency readiness for every kind, as evaluated at the start of a pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Capabilities(pub BTreeMap<DependencyKind, Dependency>);

impl Capabilities {
    pub fn get(&self, kind: DependencyKind) -> Option<&Dependency> { self.0.get(&kind) }

    /// Payload of a satisfied dependency.
    pub fn ready(&self, kind: DependencyKind) -> Option<&Payload> {
        self.0.get(&kind).filter(|d| d.satisfied).map(|d| &d.payload)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> { self.0.values() }
}

/// A connected worker peer as published on the cluster relation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerUnit {
    pub unit_id: UnitId,
    /// Raw role names (atomic or meta) as claimed by the unit.
    #[serde(default)]
    pub claimed_roles: SmallVec<[String; 4]>,
    #[serde(default)]
    pub address: String,
}

/// Everything one pass reads; internally consistent by contract of the boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InputSnapshot {
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub relations: Vec<RelationSnapshot>,
    #[serde(default)]
    pub workers: Vec<WorkerUnit>,
    #[serde(default)]
    pub options: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AssignedUnit {
    pub address: String,
    pub roles: BTreeSet<WorkerRole>,
}

/// Validated role-to-unit mapping; conflicting roles are absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Assignment {
    pub by_role: BTreeMap<WorkerRole, UnitId>,
    pub units: BTreeMap<UnitId, AssignedUnit>,
}

impl Assignment {
    pub fn address_of(&self, role: WorkerRole) -> Option<&str> {
        let unit = self.by_role.get(&role)?;
        self.units.get(unit).map(|u| u.address.as_str())
    }

    pub fn has(&self, role: WorkerRole) -> bool { self.by_role.contains_key(&role) }
}

pub type Conflicts = BTreeMap<WorkerRole, BTreeSet<UnitId>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Coherence {
    Complete,
    Incomplete { missing: Vec<WorkerRole> },
}

/// Canonical configuration for one pass. Replaced wholesale, never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Mimir config tree; objects keep sorted keys.
    pub document: serde_json::Value,
    /// Canonical YAML rendering of `document`.
    pub yaml: String,
    /// Reverse-proxy configuration text.
    pub proxy: String,
    pub hash: u64,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMaterial {
    pub certificate: String,
    pub private_key: String,
    pub ca: String,
}

/// Serialized per-worker view handed to the push transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedView {
    pub unit_id: UnitId,
    pub address: String,
    pub roles: Vec<WorkerRole>,
    pub config_yaml: String,
    /// Canonical JSON of the whole view (what the hash covers).
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
    pub hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "name", content = "reason", rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded(String),
    Blocked(String),
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Status::Healthy => "healthy",
            Status::Degraded(_) => "degraded",
            Status::Blocked(_) => "blocked",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Status::Healthy => None,
            Status::Degraded(r) | Status::Blocked(r) => Some(r),
        }
    }
}

/// Driver state machine; `Blocked` only lasts until the next pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Evaluating,
    Rendering,
    Distributing,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushFailed {
    pub unit: UnitId,
    pub reason: String,
}

/// Header Grafana sends to pick the tenant.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";
pub const DEFAULT_TENANT: &str = "anonymous";

/// Addresses the coordinator offers to clients: remote-write senders and Grafana.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Endpoints {
    /// Ingress URL when ingress is ready, otherwise the proxy's internal URL.
    pub external_url: String,
    pub remote_write_url: String,
    pub datasource_url: String,
}

impl Endpoints {
    pub fn from_external(external_url: &str) -> Self {
        let base = external_url.trim_end_matches('/');
        Self {
            external_url: base.to_string(),
            remote_write_url: format!("{}/api/v1/push", base),
            datasource_url: format!("{}/prometheus", base),
        }
    }

    /// Grafana Prometheus datasource pointing at the query path, with the tenant header set.
    pub fn datasource(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "prometheus",
            "url": self.datasource_url,
            "jsonData": { "httpHeaderName1": TENANT_HEADER },
            "secureJsonData": { "httpHeaderValue1": DEFAULT_TENANT },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub pass_id: String,
    pub epoch: u64,
    pub status: Status,
    pub phase: Phase,
    /// Workers whose view was pushed this pass.
    pub pushed: Vec<UnitId>,
    /// Workers whose view was unchanged since their last successful push.
    pub skipped: Vec<UnitId>,
    pub failures: Vec<PushFailed>,
    pub assignment: Assignment,
    pub conflicts: Conflicts,
    pub coherence: Coherence,
    pub diagnostics: Vec<Diagnostic>,
    pub config_version: Option<String>,
    pub endpoints: Endpoints,
    #[serde(skip)]
    pub config: Option<Arc<ClusterConfig>>,
}

impl ReconciliationResult {
    /// Human-readable list of unresolved diagnostics.
    pub fn messages(&self) -> Vec<String> { self.diagnostics.iter().map(|d| d.to_string()).collect() }
}

// ---- boundary events ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
    /// The source relisted everything under `key` (a prefix); the object is a `Listing`.
    Restarted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelationObject {
    Dependency(RelationSnapshot),
    Worker(WorkerUnit),
    Options(Payload),
    /// Every key the source currently holds under a prefix.
    Listing(BTreeSet<String>),
}

/// One change observed by the relation source, keyed by the backing object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: String,
    pub kind: DeltaKind,
    pub object: RelationObject,
}

// ---- boundary traits ----

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Delivers a rendered view to one worker.
#[async_trait::async_trait]
pub trait Pusher: Send + Sync {
    async fn push(&self, view: &RenderedView) -> Result<(), PushError>;
}

/// Surfaces a pass outcome to the host's user-visible status.
#[async_trait::async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, result: &ReconciliationResult) -> anyhow::Result<()>;
}

/// 64-bit FNV-1a over raw bytes; stable across runs and platforms.
pub fn content_hash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
    h
}

pub fn hash_hex(h: u64) -> String { format!("{:016x}", h) }

pub mod prelude {
    pub use super::{
        Assignment, Capabilities, ClusterConfig, Delta, DeltaKind, Dependency, DependencyKind, Diagnostic,
        Endpoints, InputSnapshot, Payload, Pusher, RelationObject, RelationSnapshot, RenderedView, ReconciliationResult,
        Severity, Status, StatusReporter, UnitId, WorkerRole, WorkerUnit,
    };
}
