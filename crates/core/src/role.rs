//! Worker roles: atomic Mimir components, meta-role expansion and the minimal deployment.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRole {
    OverridesExporter,
    QueryScheduler,
    Flusher,
    QueryFrontend,
    Querier,
    StoreGateway,
    Ingester,
    Distributor,
    Ruler,
    Alertmanager,
    Compactor,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 11] = [
        WorkerRole::OverridesExporter,
        WorkerRole::QueryScheduler,
        WorkerRole::Flusher,
        WorkerRole::QueryFrontend,
        WorkerRole::Querier,
        WorkerRole::StoreGateway,
        WorkerRole::Ingester,
        WorkerRole::Distributor,
        WorkerRole::Ruler,
        WorkerRole::Alertmanager,
        WorkerRole::Compactor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::OverridesExporter => "overrides-exporter",
            WorkerRole::QueryScheduler => "query-scheduler",
            WorkerRole::Flusher => "flusher",
            WorkerRole::QueryFrontend => "query-frontend",
            WorkerRole::Querier => "querier",
            WorkerRole::StoreGateway => "store-gateway",
            WorkerRole::Ingester => "ingester",
            WorkerRole::Distributor => "distributor",
            WorkerRole::Ruler => "ruler",
            WorkerRole::Alertmanager => "alertmanager",
            WorkerRole::Compactor => "compactor",
        }
    }

    /// Mimir `-target` spelling (underscores).
    pub fn target_name(self) -> String { self.as_str().replace('-', "_") }

    /// Every atomic role can be held by at most one unit.
    pub fn is_exclusive(self) -> bool { true }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown worker role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for WorkerRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        WorkerRole::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == norm)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// Meta-role shorthand a worker may claim instead of listing atomic roles.
const READ: &[WorkerRole] = &[WorkerRole::QueryFrontend, WorkerRole::Querier];
const WRITE: &[WorkerRole] = &[WorkerRole::Distributor, WorkerRole::Ingester];
const BACKEND: &[WorkerRole] = &[
    WorkerRole::StoreGateway,
    WorkerRole::Compactor,
    WorkerRole::Ruler,
    WorkerRole::Alertmanager,
    WorkerRole::QueryScheduler,
    WorkerRole::OverridesExporter,
];

/// Roles Mimir needs for a coherent deployment; alertmanager is added on top of upstream's list.
pub const MINIMAL_DEPLOYMENT: [WorkerRole; 8] = [
    WorkerRole::Compactor,
    WorkerRole::Distributor,
    WorkerRole::Ingester,
    WorkerRole::Querier,
    WorkerRole::QueryFrontend,
    WorkerRole::StoreGateway,
    WorkerRole::Ruler,
    WorkerRole::Alertmanager,
];

/// Expand one claimed role name (atomic or meta) into atomic roles.
pub fn expand_claim(name: &str) -> Result<SmallVec<[WorkerRole; 4]>, UnknownRole> {
    let norm = name.trim().to_ascii_lowercase();
    let meta: Option<&[WorkerRole]> = match norm.as_str() {
        "read" => Some(READ),
        "write" => Some(WRITE),
        "backend" => Some(BACKEND),
        "all" => Some(&WorkerRole::ALL[..]),
        _ => None,
    };
    match meta {
        Some(roles) => Ok(roles.iter().copied().collect()),
        None => Ok(smallvec::smallvec![name.parse::<WorkerRole>()?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_spellings() {
        assert_eq!("store-gateway".parse::<WorkerRole>().unwrap(), WorkerRole::StoreGateway);
        assert_eq!("store_gateway".parse::<WorkerRole>().unwrap(), WorkerRole::StoreGateway);
        assert_eq!(" Ingester ".parse::<WorkerRole>().unwrap(), WorkerRole::Ingester);
        assert!("gateway".parse::<WorkerRole>().is_err());
    }

    #[test]
    fn meta_roles_expand() {
        let w = expand_claim("write").unwrap();
        assert_eq!(w.as_slice(), &[WorkerRole::Distributor, WorkerRole::Ingester]);
        assert_eq!(expand_claim("all").unwrap().len(), WorkerRole::ALL.len());
        assert_eq!(expand_claim("backend").unwrap().len(), 6);
        assert_eq!(expand_claim("ruler").unwrap().as_slice(), &[WorkerRole::Ruler]);
        assert_eq!(expand_claim("nope").unwrap_err(), UnknownRole("nope".into()));
    }

    #[test]
    fn serde_uses_kebab_names() {
        let s = serde_json::to_string(&WorkerRole::QueryFrontend).unwrap();
        assert_eq!(s, "\"query-frontend\"");
        assert_eq!(WorkerRole::QueryFrontend.target_name(), "query_frontend");
    }
}
