//! Mimir reconciliation driver: evaluate, resolve, render, distribute, report.
//!
//! One `Reconciler` lives for the whole process and owns the only cross-pass state (the
//! distributor's cache). Every pass returns a `ReconciliationResult`; nothing here is fatal.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use mimir_core::{Diagnostic, InputSnapshot, Phase, Pusher, ReconciliationResult, Severity, Status};
use mimir_distribute::{Distribution, Distributor};
use mimir_render::{option_diagnostics, RenderError, Renderer};
use tracing::{debug, info, warn};

pub struct Reconciler {
    renderer: Renderer,
    distributor: Distributor,
    phase: Phase,
}

impl Reconciler {
    pub fn new(renderer: Renderer) -> Self { Self { renderer, distributor: Distributor::new(), phase: Phase::Idle } }

    pub fn phase(&self) -> Phase { self.phase }
    pub fn renderer(&self) -> &Renderer { &self.renderer }
    pub fn distributor(&self) -> &Distributor { &self.distributor }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    /// Run one full pass over `snap`, pushing changed views through `pusher`.
    pub async fn reconcile(&mut self, snap: &InputSnapshot, pusher: &dyn Pusher) -> ReconciliationResult {
        let started = Instant::now();
        let pass_id = uuid::Uuid::new_v4().to_string();
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        self.enter(Phase::Evaluating);
        let caps = mimir_registry::evaluate(&snap.relations);
        diagnostics.extend(mimir_registry::diagnostics(&caps));
        let resolution = mimir_roles::resolve(&snap.workers);
        diagnostics.extend(resolution.diagnostics.iter().cloned());
        let coherence = mimir_roles::coherence(&resolution.assignment);
        let endpoints = self.renderer.endpoints(&caps);
        diagnostics.extend(mimir_roles::coherence_diagnostic(&coherence));

        self.enter(Phase::Rendering);
        let mut distribution = Distribution::default();
        let mut config = None;
        match self.renderer.render(&snap.options, &caps, &resolution.assignment) {
            Err(e) => {
                warn!(pass = %pass_id, error = %e, "render blocked");
                // An invalid required relation is already reported by the registry.
                let reported = |d: &Diagnostic| match d {
                    Diagnostic::MissingRequiredDependency { kind } => caps.get(*kind).is_some_and(|dep| dep.is_invalid()),
                    _ => false,
                };
                diagnostics.extend(e.diagnostics().into_iter().filter(|d| !reported(d)));
                if matches!(e, RenderError::MissingRequiredDependency(_)) {
                    if let Err(errs) = self.renderer.schema().resolve(&snap.options) {
                        diagnostics.extend(option_diagnostics(&errs));
                    }
                }
                self.enter(Phase::Blocked);
            }
            Ok(cfg) => {
                self.enter(Phase::Distributing);
                let cfg = Arc::new(cfg);
                distribution = self.distributor.distribute(&cfg, &resolution.assignment, &caps, pusher).await;
                diagnostics.extend(
                    distribution
                        .failures
                        .iter()
                        .map(|f| Diagnostic::PushFailure { unit: f.unit.clone(), reason: f.reason.clone() }),
                );
                config = Some(cfg);
                self.enter(Phase::Idle);
            }
        }

        let status = decide_status(&diagnostics);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::counter!("reconcile_passes_total", 1u64, "status" => status.name());
        metrics::histogram!("reconcile_latency_ms", elapsed_ms);
        info!(
            pass = %pass_id,
            epoch = snap.epoch,
            status = status.name(),
            pushed = distribution.pushed.len(),
            skipped = distribution.skipped.len(),
            failed = distribution.failures.len(),
            diagnostics = diagnostics.len(),
            took_ms = %format!("{:.1}", elapsed_ms),
            "reconcile pass done"
        );

        ReconciliationResult {
            pass_id,
            epoch: snap.epoch,
            status,
            phase: self.phase,
            pushed: distribution.pushed,
            skipped: distribution.skipped,
            failures: distribution.failures,
            assignment: resolution.assignment,
            conflicts: resolution.conflicts,
            coherence,
            diagnostics,
            config_version: config.as_ref().map(|c| c.version.clone()),
            endpoints,
            config,
        }
    }
}

/// Blocking beats degrading beats healthy; the reason lists the deciding diagnostics.
pub fn decide_status(diagnostics: &[Diagnostic]) -> Status {
    let reason = |sev: Severity| {
        let msgs: Vec<String> = diagnostics.iter().filter(|d| d.severity() == sev).map(|d| d.to_string()).collect();
        if msgs.is_empty() { None } else { Some(msgs.join("; ")) }
    };
    if let Some(r) = reason(Severity::Blocking) {
        Status::Blocked(r)
    } else if let Some(r) = reason(Severity::Degrading) {
        Status::Degraded(r)
    } else {
        Status::Healthy
    }
}
