//! Mimir distribution engine.
//!
//! Derives one view per assigned worker from the pass's `ClusterConfig`, suppresses views
//! identical to the last one a worker acknowledged, and pushes the rest concurrently.

#![forbid(unsafe_code)]

use std::time::Instant;

use futures::future::join_all;
use mimir_core::{
    content_hash, hash_hex, AssignedUnit, Assignment, Capabilities, ClusterConfig, DependencyKind, PushFailed, Pusher,
    RenderedView, TlsMaterial, UnitId, WorkerRole,
};
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

/// Config sections only workers holding one of the listed roles receive.
const ROLE_SECTIONS: &[(&str, &[WorkerRole])] = &[
    ("ingester", &[WorkerRole::Ingester]),
    ("distributor", &[WorkerRole::Distributor]),
    ("ruler", &[WorkerRole::Ruler]),
    ("ruler_storage", &[WorkerRole::Ruler]),
    ("alertmanager", &[WorkerRole::Alertmanager]),
    ("alertmanager_storage", &[WorkerRole::Alertmanager]),
    ("compactor", &[WorkerRole::Compactor]),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Distribution {
    pub pushed: Vec<UnitId>,
    pub skipped: Vec<UnitId>,
    pub failures: Vec<PushFailed>,
}

/// Owns the last-acknowledged view hash per worker; the only state kept across passes.
#[derive(Debug, Default)]
pub struct Distributor {
    last: FxHashMap<UnitId, u64>,
}

impl Distributor {
    pub fn new() -> Self { Self::default() }

    pub fn last_pushed(&self, unit: &str) -> Option<u64> { self.last.get(unit).copied() }

    pub fn cached_units(&self) -> usize { self.last.len() }

    pub async fn distribute(
        &mut self,
        config: &ClusterConfig,
        assignment: &Assignment,
        caps: &Capabilities,
        pusher: &dyn Pusher,
    ) -> Distribution {
        let started = Instant::now();
        let before = self.last.len();
        self.last.retain(|unit, _| assignment.units.contains_key(unit));
        if self.last.len() != before {
            debug!(pruned = before - self.last.len(), "dropped cache entries for departed workers");
        }

        let mut out = Distribution::default();
        let mut pending = Vec::new();
        for (unit, assigned) in &assignment.units {
            match build_view(config, unit, assigned, caps) {
                Ok(view) if self.last.get(unit) == Some(&view.hash) => {
                    metrics::counter!("distribute_skip_total", 1u64);
                    out.skipped.push(unit.clone());
                }
                Ok(view) => pending.push(view),
                Err(reason) => {
                    warn!(unit = %unit, %reason, "worker view could not be built");
                    out.failures.push(PushFailed { unit: unit.clone(), reason });
                }
            }
        }

        let results = join_all(pending.iter().map(|view| async move { (view, pusher.push(view).await) })).await;
        for (view, res) in results {
            match res {
                Ok(()) => {
                    metrics::counter!("distribute_push_total", 1u64);
                    info!(unit = %view.unit_id, hash = %hash_hex(view.hash), "view pushed");
                    self.last.insert(view.unit_id.clone(), view.hash);
                    out.pushed.push(view.unit_id.clone());
                }
                Err(e) => {
                    metrics::counter!("distribute_push_err_total", 1u64);
                    warn!(unit = %view.unit_id, error = %e, "push failed");
                    out.failures.push(PushFailed { unit: view.unit_id.clone(), reason: e.to_string() });
                }
            }
        }

        out.pushed.sort();
        out.skipped.sort();
        out.failures.sort_by(|a, b| a.unit.cmp(&b.unit));
        metrics::histogram!("distribute_ms", started.elapsed().as_secs_f64() * 1000.0);
        out
    }
}

/// Build the serialized view for one worker. Errors only when the config cannot be encoded.
pub fn build_view(
    config: &ClusterConfig,
    unit: &str,
    assigned: &AssignedUnit,
    caps: &Capabilities,
) -> Result<RenderedView, String> {
    let roles: Vec<WorkerRole> = assigned.roles.iter().copied().collect();
    let target = roles.iter().map(|r| r.target_name()).collect::<Vec<_>>().join(",");

    let mut doc = match &config.document {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    for (section, holders) in ROLE_SECTIONS {
        if !holders.iter().any(|r| assigned.roles.contains(r)) {
            doc.remove(*section);
        }
    }
    doc.insert("target".into(), Value::String(target.clone()));
    let doc = Value::Object(doc);
    let config_yaml = serde_yaml::to_string(&doc).map_err(|e| format!("encode config: {}", e))?;

    let tls = caps.ready(DependencyKind::Certificates).and_then(|p| {
        Some(TlsMaterial {
            certificate: p.get("certificate")?.clone(),
            private_key: p.get("private_key")?.clone(),
            ca: p.get("ca")?.clone(),
        })
    });
    let tls_fingerprint = tls.as_ref().map(|t| {
        let mut all = String::new();
        for part in [&t.certificate, &t.private_key, &t.ca] {
            all.push_str(part);
            all.push('\0');
        }
        hash_hex(content_hash(all.as_bytes()))
    });
    let tracing_endpoint = caps.ready(DependencyKind::Tracing).and_then(|p| p.get("endpoint")).cloned();
    let logging: Vec<&String> = caps.ready(DependencyKind::Logging).map(|p| p.values().collect()).unwrap_or_default();

    let body_value = json!({
        "unit": unit,
        "address": assigned.address,
        "roles": roles,
        "target": target,
        "config": doc,
        "tls_fingerprint": tls_fingerprint,
        "tracing_endpoint": tracing_endpoint,
        "logging_endpoints": logging,
    });
    let body = serde_json::to_string(&body_value).map_err(|e| format!("encode view: {}", e))?;
    let hash = content_hash(body.as_bytes());

    Ok(RenderedView { unit_id: unit.to_string(), address: assigned.address.clone(), roles, config_yaml, body, tls, hash })
}
