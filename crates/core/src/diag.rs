//! Diagnostics produced during a reconciliation pass.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{DependencyKind, UnitId, WorkerRole};

/// How much a diagnostic weighs on the aggregate status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Degrading,
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    #[error("dependency {kind} unsatisfied: {reason}")]
    DependencyUnsatisfied { kind: DependencyKind, reason: String },
    #[error("missing required dependency: {kind}")]
    MissingRequiredDependency { kind: DependencyKind },
    #[error("role {role} claimed by multiple units: {}", .units.join(", "))]
    RoleConflict { role: WorkerRole, units: Vec<UnitId> },
    #[error("unit {unit} claims unknown role {role:?}")]
    UnknownRole { unit: UnitId, role: String },
    #[error("unit {unit} claims no valid roles; ignored")]
    UnitWithoutRoles { unit: UnitId },
    #[error("deployment incomplete; missing roles: {}", join_roles(.missing))]
    IncompleteDeployment { missing: Vec<WorkerRole> },
    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: String, reason: String },
    #[error("push to {unit} failed: {reason}")]
    PushFailure { unit: UnitId, reason: String },
    #[error("render failed: {reason}")]
    RenderFailed { reason: String },
}

fn join_roles(roles: &[WorkerRole]) -> String {
    roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(", ")
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::UnknownRole { .. }
            | Diagnostic::UnitWithoutRoles { .. }
            | Diagnostic::IncompleteDeployment { .. } => Severity::Warning,
            Diagnostic::DependencyUnsatisfied { kind, .. } if kind.is_required() => Severity::Blocking,
            Diagnostic::DependencyUnsatisfied { .. }
            | Diagnostic::RoleConflict { .. }
            | Diagnostic::PushFailure { .. } => Severity::Degrading,
            Diagnostic::MissingRequiredDependency { .. }
            | Diagnostic::InvalidOption { .. }
            | Diagnostic::RenderFailed { .. } => Severity::Blocking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        let d = Diagnostic::RoleConflict { role: WorkerRole::Distributor, units: vec!["unit2".into(), "unit3".into()] };
        assert_eq!(d.to_string(), "role distributor claimed by multiple units: unit2, unit3");
        assert_eq!(d.severity(), Severity::Degrading);

        let m = Diagnostic::MissingRequiredDependency { kind: DependencyKind::ObjectStorage };
        assert_eq!(m.to_string(), "missing required dependency: s3");
        assert_eq!(m.severity(), Severity::Blocking);
    }

    #[test]
    fn optional_dependency_problems_degrade() {
        let tls = Diagnostic::DependencyUnsatisfied { kind: DependencyKind::Certificates, reason: "bad pem".into() };
        assert_eq!(tls.severity(), Severity::Degrading);
        let s3 = Diagnostic::DependencyUnsatisfied { kind: DependencyKind::ObjectStorage, reason: "no bucket".into() };
        assert_eq!(s3.severity(), Severity::Blocking);
        let warn = Diagnostic::IncompleteDeployment { missing: vec![WorkerRole::Ruler, WorkerRole::Querier] };
        assert_eq!(warn.to_string(), "deployment incomplete; missing roles: ruler, querier");
        assert_eq!(warn.severity(), Severity::Warning);
    }
}
