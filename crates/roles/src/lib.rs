//! Mimir role assignment: maps claimed worker roles onto units and surfaces conflicts.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use mimir_core::role::expand_claim;
use mimir_core::{
    AssignedUnit, Assignment, Coherence, Conflicts, Diagnostic, UnitId, WorkerRole, WorkerUnit, MINIMAL_DEPLOYMENT,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub assignment: Assignment,
    pub conflicts: Conflicts,
    pub diagnostics: Vec<Diagnostic>,
}

/// Resolve claimed roles into an assignment. Roles claimed by more than one unit are
/// excluded and reported; the remaining roles are still assigned.
pub fn resolve(units: &[WorkerUnit]) -> Resolution {
    let mut sorted: Vec<&WorkerUnit> = units.iter().collect();
    sorted.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

    let mut diagnostics = Vec::new();
    let mut claims: BTreeMap<WorkerRole, BTreeSet<UnitId>> = BTreeMap::new();
    let mut addresses: BTreeMap<&str, &str> = BTreeMap::new();

    for unit in sorted {
        let mut valid = 0usize;
        for name in &unit.claimed_roles {
            match expand_claim(name) {
                Ok(roles) => {
                    for role in roles {
                        claims.entry(role).or_default().insert(unit.unit_id.clone());
                        valid += 1;
                    }
                }
                Err(_) => {
                    warn!(unit = %unit.unit_id, role = %name, "unknown role claimed");
                    diagnostics.push(Diagnostic::UnknownRole { unit: unit.unit_id.clone(), role: name.clone() });
                }
            }
        }
        if valid == 0 {
            debug!(unit = %unit.unit_id, "unit has no valid roles");
            diagnostics.push(Diagnostic::UnitWithoutRoles { unit: unit.unit_id.clone() });
            continue;
        }
        addresses.insert(unit.unit_id.as_str(), unit.address.as_str());
    }

    let mut assignment = Assignment::default();
    let mut conflicts = Conflicts::new();
    for (role, holders) in claims {
        if role.is_exclusive() && holders.len() > 1 {
            diagnostics.push(Diagnostic::RoleConflict { role, units: holders.iter().cloned().collect() });
            conflicts.insert(role, holders);
            continue;
        }
        for unit in holders {
            let address = addresses.get(unit.as_str()).copied().unwrap_or_default().to_string();
            assignment.units.entry(unit.clone()).or_insert_with(|| AssignedUnit { address, roles: BTreeSet::new() }).roles.insert(role);
            assignment.by_role.insert(role, unit);
        }
    }

    metrics::gauge!("roles_assigned", assignment.by_role.len() as f64);
    metrics::gauge!("roles_conflicting", conflicts.len() as f64);
    Resolution { assignment, conflicts, diagnostics }
}

/// Whether the assignment covers the minimal Mimir deployment.
pub fn coherence(assignment: &Assignment) -> Coherence {
    let missing: Vec<WorkerRole> = MINIMAL_DEPLOYMENT.iter().copied().filter(|r| !assignment.has(*r)).collect();
    if missing.is_empty() { Coherence::Complete } else { Coherence::Incomplete { missing } }
}

/// Warning-level diagnostic for an incomplete deployment, if any.
pub fn coherence_diagnostic(c: &Coherence) -> Option<Diagnostic> {
    match c {
        Coherence::Complete => None,
        Coherence::Incomplete { missing } => Some(Diagnostic::IncompleteDeployment { missing: missing.clone() }),
    }
}
