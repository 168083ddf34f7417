//! Mimir kubehub: relation watchers and server-side-apply transport against the Kubernetes API.
//!
//! Relations are modelled as ConfigMaps/Secrets carrying the `mimir.coordinator/relation`
//! label. Worker views and the coordinator status are written back as ConfigMaps (and a
//! Secret for TLS material) using server-side apply.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Resource, ResourceExt,
};
use mimir_core::{
    content_hash, hash_hex, Delta, DeltaKind, DependencyKind, Payload, PushError, Pusher, ReconciliationResult, RelationObject,
    RelationSnapshot, RenderedView, StatusReporter, WorkerUnit,
};
use serde_json::{json, Value as Json};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

pub const RELATION_LABEL: &str = "mimir.coordinator/relation";
pub const WORKER_LABEL: &str = "mimir.coordinator/worker";
pub const CLUSTER_RELATION: &str = "mimir-cluster";
pub const OPTIONS_RELATION: &str = "options";
pub const STATUS_CONFIGMAP: &str = "mimir-coordinator-status";

/// Delta key prefixes, one per watched kind.
pub const CONFIGMAP_PREFIX: &str = "configmap";
pub const SECRET_PREFIX: &str = "secret";

const WORKER_NAME_PREFIX: &str = "mimir-worker-";
// Leaves room for the `-tls` Secret suffix inside the 253-char object name limit.
const MAX_OBJECT_NAME: usize = 240;

fn field_manager() -> String {
    std::env::var("MIMIR_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "mimir-coordinator".into())
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client, created on first use from the default config.
pub async fn get_kube_client() -> Result<Client> {
    let c = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(c.clone())
}

// ---- relation source ----

/// Parse a worker's role list: a JSON array or a comma-separated list.
pub fn parse_roles(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        let v: Vec<String> = serde_json::from_str(raw).context("parsing roles as a JSON list")?;
        return Ok(v.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect());
    }
    Ok(raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
}

/// Interpret one labelled object. `Ok(None)` for label values this coordinator does not consume.
pub fn relation_object(label: &str, name: &str, data: Payload) -> Result<Option<RelationObject>> {
    match label {
        OPTIONS_RELATION => Ok(Some(RelationObject::Options(data))),
        CLUSTER_RELATION => {
            let unit_id = data.get("unit").cloned().unwrap_or_else(|| name.to_string());
            let claimed_roles = parse_roles(data.get("roles").map(String::as_str).unwrap_or(""))
                .with_context(|| format!("worker {}", name))?
                .into_iter()
                .collect();
            let address = data.get("address").cloned().unwrap_or_default();
            Ok(Some(RelationObject::Worker(WorkerUnit { unit_id, claimed_roles, address })))
        }
        other => Ok(DependencyKind::from_relation_name(other)
            .map(|kind| RelationObject::Dependency(RelationSnapshot { kind, id: name.to_string(), data }))),
    }
}

fn relation_key(prefix: &str, name: &str) -> String { format!("{}/{}", prefix, name) }

fn removal(key: String) -> Delta { Delta { key, kind: DeltaKind::Deleted, object: RelationObject::Options(Payload::new()) } }

fn delta_from_parts(prefix: &str, label: Option<&str>, name: &str, data: Payload, kind: DeltaKind) -> Result<Option<Delta>> {
    let key = relation_key(prefix, name);
    // Deletes only need the key; the final object may have lost its label or be malformed.
    if kind == DeltaKind::Deleted {
        return Ok(Some(removal(key)));
    }
    let Some(label) = label else { return Ok(Some(removal(key))) };
    match relation_object(label, name, data)? {
        Some(object) => Ok(Some(Delta { key, kind, object })),
        None => {
            debug!(%key, %label, "relation label not consumed; dropping any previous entry");
            Ok(Some(removal(key)))
        }
    }
}

pub fn delta_from_configmap(cm: &ConfigMap, kind: DeltaKind) -> Result<Option<Delta>> {
    let label = cm.labels().get(RELATION_LABEL).map(String::as_str);
    let data: Payload = cm.data.clone().unwrap_or_default();
    delta_from_parts(CONFIGMAP_PREFIX, label, &cm.name_any(), data, kind)
}

pub fn delta_from_secret(s: &Secret, kind: DeltaKind) -> Result<Option<Delta>> {
    let label = s.labels().get(RELATION_LABEL).map(String::as_str);
    if kind == DeltaKind::Deleted {
        return delta_from_parts(SECRET_PREFIX, label, &s.name_any(), Payload::new(), kind);
    }
    let mut data = Payload::new();
    for (k, v) in s.data.iter().flatten() {
        let text = String::from_utf8(v.0.clone()).with_context(|| format!("secret {} key {} is not utf-8", s.name_any(), k))?;
        data.insert(k.clone(), text);
    }
    for (k, v) in s.string_data.iter().flatten() {
        data.insert(k.clone(), v.clone());
    }
    delta_from_parts(SECRET_PREFIX, label, &s.name_any(), data, kind)
}

fn convert_or_skip<K: ResourceExt>(obj: &K, kind: DeltaKind, convert: fn(&K, DeltaKind) -> Result<Option<Delta>>) -> Option<Delta> {
    match convert(obj, kind) {
        Ok(d) => d,
        Err(e) => {
            warn!(name = %obj.name_any(), error = %e, "skipping malformed relation object");
            None
        }
    }
}

/// Deltas for a relist: the full key set under `prefix` first, then every listed object.
pub fn restart_deltas<K: ResourceExt>(prefix: &str, list: &[K], convert: fn(&K, DeltaKind) -> Result<Option<Delta>>) -> Vec<Delta> {
    let keys = list.iter().map(|o| relation_key(prefix, &o.name_any())).collect();
    let mut out = vec![Delta { key: prefix.to_string(), kind: DeltaKind::Restarted, object: RelationObject::Listing(keys) }];
    out.extend(list.iter().filter_map(|o| convert_or_skip(o, DeltaKind::Applied, convert)));
    out
}

async fn send_all(deltas: impl IntoIterator<Item = Delta>, tx: &mpsc::Sender<Delta>) -> Result<()> {
    for d in deltas {
        metrics::counter!("kubehub_deltas_total", 1u64);
        tx.send(d).await.map_err(|_| anyhow!("delta channel closed"))?;
    }
    Ok(())
}

async fn run_watcher<K>(
    api: Api<K>,
    prefix: &'static str,
    convert: fn(&K, DeltaKind) -> Result<Option<Delta>>,
    tx: mpsc::Sender<Delta>,
) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + Debug + Send + Sync + 'static,
{
    let cfg = watcher::Config::default().labels(RELATION_LABEL);
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = prefix, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => send_all(convert_or_skip(&o, DeltaKind::Applied, convert), &tx).await?,
            Event::Deleted(o) => send_all(convert_or_skip(&o, DeltaKind::Deleted, convert), &tx).await?,
            Event::Restarted(list) => {
                debug!(kind = prefix, count = list.len(), "watch restart");
                send_all(restart_deltas(prefix, &list, convert), &tx).await?;
            }
        }
    }
    warn!(kind = prefix, "watcher stream ended");
    Ok(())
}

/// Watch labelled ConfigMaps and Secrets in `namespace`, forwarding relation deltas into `tx`.
/// Returns when either watcher ends or the channel closes.
pub async fn watch_relations(namespace: &str, tx: mpsc::Sender<Delta>) -> Result<()> {
    let client = get_kube_client().await?;
    let cms: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let secrets: Api<Secret> = Api::namespaced(client, namespace);
    tokio::select! {
        r = run_watcher(cms, CONFIGMAP_PREFIX, delta_from_configmap, tx.clone()) => r,
        r = run_watcher(secrets, SECRET_PREFIX, delta_from_secret, tx) => r,
    }
}

// ---- push transport ----

/// Kubernetes object name for a unit id such as `mimir-worker/0`. The sanitized id is truncated
/// and suffixed with a hash of the raw id, so ids that sanitize alike still get distinct names.
pub fn object_name(unit: &str) -> String {
    let hash = hash_hex(content_hash(unit.as_bytes()));
    let suffix = &hash[..8];
    let room = MAX_OBJECT_NAME - WORKER_NAME_PREFIX.len() - suffix.len() - 1;
    let mut s: String = unit
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(room)
        .collect();
    while s.ends_with('-') {
        s.pop();
    }
    if s.is_empty() {
        return format!("{}{}", WORKER_NAME_PREFIX, suffix);
    }
    format!("{}{}-{}", WORKER_NAME_PREFIX, s, suffix)
}

pub fn worker_configmap(view: &RenderedView) -> Json {
    let roles: Vec<&str> = view.roles.iter().map(|r| r.as_str()).collect();
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": object_name(&view.unit_id),
            "labels": {
                "app.kubernetes.io/managed-by": "mimir-coordinator",
                WORKER_LABEL: hash_hex(content_hash(view.unit_id.as_bytes())),
            },
        },
        "data": {
            "mimir.yaml": view.config_yaml,
            "view.json": view.body,
            "roles": roles.join(","),
            "hash": hash_hex(view.hash),
            "address": view.address,
        },
    })
}

/// TLS material as a Secret next to the worker ConfigMap; `None` when TLS is off.
pub fn worker_tls_secret(view: &RenderedView) -> Option<Json> {
    let tls = view.tls.as_ref()?;
    Some(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": format!("{}-tls", object_name(&view.unit_id)),
            "labels": { "app.kubernetes.io/managed-by": "mimir-coordinator" },
        },
        "stringData": {
            "server.cert": tls.certificate,
            "private.key": tls.private_key,
            "ca.cert": tls.ca,
        },
    }))
}

fn push_error(e: kube::Error) -> PushError {
    match e {
        kube::Error::Api(resp) if (400..500).contains(&resp.code) => PushError::Rejected(resp.message),
        other => PushError::Transport(other.to_string()),
    }
}

/// Delivers worker views by server-side applying a ConfigMap (and TLS Secret) per worker.
pub struct ConfigMapPusher {
    configmaps: Api<ConfigMap>,
    secrets: Api<Secret>,
    params: PatchParams,
}

impl ConfigMapPusher {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
            params: PatchParams::apply(&field_manager()).force(),
        }
    }
}

#[async_trait::async_trait]
impl Pusher for ConfigMapPusher {
    async fn push(&self, view: &RenderedView) -> Result<(), PushError> {
        let t0 = std::time::Instant::now();
        let name = object_name(&view.unit_id);
        if let Some(secret) = worker_tls_secret(view) {
            self.secrets
                .patch(&format!("{}-tls", name), &self.params, &Patch::Apply(&secret))
                .await
                .map_err(push_error)?;
        }
        let cm = worker_configmap(view);
        self.configmaps.patch(&name, &self.params, &Patch::Apply(&cm)).await.map_err(push_error)?;
        metrics::histogram!("kubehub_push_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(unit = %view.unit_id, configmap = %name, "worker view applied");
        Ok(())
    }
}

// ---- status reporter ----

pub fn status_configmap(result: &ReconciliationResult) -> Json {
    let diagnostics = serde_json::to_string_pretty(&result.diagnostics).unwrap_or_else(|_| "[]".into());
    let datasource = serde_json::to_string_pretty(&result.endpoints.datasource()).unwrap_or_else(|_| "{}".into());
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": STATUS_CONFIGMAP,
            "labels": { "app.kubernetes.io/managed-by": "mimir-coordinator" },
        },
        "data": {
            "status": result.status.name(),
            "reason": result.status.reason().unwrap_or(""),
            "diagnostics": diagnostics,
            "version": result.config_version.clone().unwrap_or_default(),
            "pass": result.pass_id,
            "nginx.conf": result.config.as_ref().map(|c| c.proxy.clone()).unwrap_or_default(),
            "external_url": result.endpoints.external_url,
            "remote_write_url": result.endpoints.remote_write_url,
            "datasource.json": datasource,
        },
    })
}

/// Surfaces pass outcomes as the `mimir-coordinator-status` ConfigMap.
pub struct ConfigMapReporter {
    api: Api<ConfigMap>,
    params: PatchParams,
}

impl ConfigMapReporter {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), params: PatchParams::apply(&field_manager()).force() }
    }
}

#[async_trait::async_trait]
impl StatusReporter for ConfigMapReporter {
    async fn report(&self, result: &ReconciliationResult) -> Result<()> {
        let cm = status_configmap(result);
        self.api
            .patch(STATUS_CONFIGMAP, &self.params, &Patch::Apply(&cm))
            .await
            .with_context(|| format!("applying {}", STATUS_CONFIGMAP))?;
        info!(status = result.status.name(), version = ?result.config_version, "status reported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use mimir_core::{Assignment, Coherence, Endpoints, Phase, Status, TlsMaterial, WorkerRole};
    use std::collections::BTreeMap;

    fn labelled(name: &str, label: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            labels: Some(BTreeMap::from([(RELATION_LABEL.to_string(), label.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn roles_parse_from_json_or_commas() {
        assert_eq!(parse_roles(r#"["ingester", "write"]"#).unwrap(), vec!["ingester", "write"]);
        assert_eq!(parse_roles("querier, query_frontend,").unwrap(), vec!["querier", "query_frontend"]);
        assert!(parse_roles("").unwrap().is_empty());
        assert!(parse_roles("[not json").is_err());
    }

    #[test]
    fn worker_configmap_becomes_worker_delta() {
        let cm = ConfigMap {
            metadata: labelled("worker-0", CLUSTER_RELATION),
            data: Some(BTreeMap::from([
                ("unit".to_string(), "mimir-worker/0".to_string()),
                ("roles".to_string(), "[\"all\"]".to_string()),
                ("address".to_string(), "10.1.0.7".to_string()),
            ])),
            ..Default::default()
        };
        let d = delta_from_configmap(&cm, DeltaKind::Applied).unwrap().unwrap();
        assert_eq!(d.key, "configmap/worker-0");
        match d.object {
            RelationObject::Worker(w) => {
                assert_eq!(w.unit_id, "mimir-worker/0");
                assert_eq!(w.claimed_roles.as_slice(), &["all".to_string()]);
                assert_eq!(w.address, "10.1.0.7");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn secret_becomes_dependency_delta() {
        let s = Secret {
            metadata: labelled("minio", "s3"),
            data: Some(BTreeMap::from([("bucket".to_string(), ByteString(b"mimir".to_vec()))])),
            ..Default::default()
        };
        let d = delta_from_secret(&s, DeltaKind::Applied).unwrap().unwrap();
        match d.object {
            RelationObject::Dependency(r) => {
                assert_eq!(r.kind, DependencyKind::ObjectStorage);
                assert_eq!(r.id, "minio");
                assert_eq!(r.data["bucket"], "mimir");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unlabelled_or_unconsumed_objects_remove_their_key() {
        let plain = ConfigMap { metadata: ObjectMeta { name: Some("x".into()), ..Default::default() }, ..Default::default() };
        let d = delta_from_configmap(&plain, DeltaKind::Applied).unwrap().unwrap();
        assert_eq!((d.key.as_str(), d.kind), ("configmap/x", DeltaKind::Deleted));
        let unknown = ConfigMap { metadata: labelled("y", "grafana-source"), ..Default::default() };
        let d = delta_from_configmap(&unknown, DeltaKind::Applied).unwrap().unwrap();
        assert_eq!((d.key.as_str(), d.kind), ("configmap/y", DeltaKind::Deleted));
    }

    #[test]
    fn delete_without_label_still_deletes() {
        let unlabelled = Secret { metadata: ObjectMeta { name: Some("minio".into()), ..Default::default() }, ..Default::default() };
        let d = delta_from_secret(&unlabelled, DeltaKind::Deleted).unwrap().unwrap();
        assert_eq!(d.key, "secret/minio");
        assert_eq!(d.kind, DeltaKind::Deleted);

        let binary = Secret {
            metadata: labelled("tls", "certificates"),
            data: Some(BTreeMap::from([("key".to_string(), ByteString(vec![0xff, 0xfe]))])),
            ..Default::default()
        };
        assert!(delta_from_secret(&binary, DeltaKind::Applied).is_err());
        assert_eq!(delta_from_secret(&binary, DeltaKind::Deleted).unwrap().unwrap().key, "secret/tls");
    }

    #[test]
    fn restart_lists_every_key_before_applying() {
        let worker = ConfigMap {
            metadata: labelled("worker-0", CLUSTER_RELATION),
            data: Some(BTreeMap::from([("roles".to_string(), "ingester".to_string())])),
            ..Default::default()
        };
        let broken = ConfigMap {
            metadata: labelled("worker-1", CLUSTER_RELATION),
            data: Some(BTreeMap::from([("roles".to_string(), "[broken".to_string())])),
            ..Default::default()
        };
        let deltas = restart_deltas(CONFIGMAP_PREFIX, &[worker, broken], delta_from_configmap);
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].key, "configmap");
        assert_eq!(deltas[0].kind, DeltaKind::Restarted);
        match &deltas[0].object {
            RelationObject::Listing(keys) => {
                assert_eq!(keys.iter().map(String::as_str).collect::<Vec<_>>(), vec!["configmap/worker-0", "configmap/worker-1"])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!((deltas[1].key.as_str(), deltas[1].kind), ("configmap/worker-0", DeltaKind::Applied));
    }

    #[test]
    fn malformed_worker_still_deletes() {
        let cm = ConfigMap {
            metadata: labelled("worker-1", CLUSTER_RELATION),
            data: Some(BTreeMap::from([("roles".to_string(), "[broken".to_string())])),
            ..Default::default()
        };
        assert!(delta_from_configmap(&cm, DeltaKind::Applied).is_err());
        let d = delta_from_configmap(&cm, DeltaKind::Deleted).unwrap().unwrap();
        assert_eq!(d.kind, DeltaKind::Deleted);
        assert_eq!(d.key, "configmap/worker-1");
    }

    fn view(tls: bool) -> RenderedView {
        RenderedView {
            unit_id: "mimir-worker/0".into(),
            address: "10.1.0.7".into(),
            roles: vec![WorkerRole::Ingester, WorkerRole::Distributor],
            config_yaml: "target: ingester,distributor\n".into(),
            body: "{}".into(),
            tls: tls.then(|| TlsMaterial { certificate: "C".into(), private_key: "K".into(), ca: "A".into() }),
            hash: 0xabc,
        }
    }

    #[test]
    fn worker_objects_are_named_from_unit() {
        let name = object_name("mimir-worker/0");
        assert!(name.starts_with("mimir-worker-mimir-worker-0-"));
        let cm = worker_configmap(&view(false));
        assert_eq!(cm["metadata"]["name"], name.as_str());
        assert_eq!(cm["data"]["roles"], "ingester,distributor");
        assert_eq!(cm["data"]["hash"], "0000000000000abc");
        assert!(worker_tls_secret(&view(false)).is_none());
        let secret = worker_tls_secret(&view(true)).unwrap();
        assert_eq!(secret["metadata"]["name"], format!("{}-tls", name));
        assert_eq!(secret["stringData"]["private.key"], "K");
    }

    #[test]
    fn object_names_are_distinct_and_bounded() {
        assert_ne!(object_name("a/0"), object_name("a-0"));
        assert_eq!(object_name("a/0"), object_name("a/0"));
        let long = "w".repeat(400);
        let name = object_name(&long);
        assert!(name.len() + "-tls".len() <= 253);
        assert!(name.starts_with("mimir-worker-www"));
        assert_eq!(object_name("///").len(), "mimir-worker-".len() + 8);
    }

    #[test]
    fn status_configmap_carries_reason() {
        let result = ReconciliationResult {
            pass_id: "p1".into(),
            epoch: 3,
            status: Status::Blocked("missing required dependency: s3".into()),
            phase: Phase::Blocked,
            pushed: vec![],
            skipped: vec![],
            failures: vec![],
            assignment: Assignment::default(),
            conflicts: Default::default(),
            coherence: Coherence::Complete,
            diagnostics: vec![],
            config_version: None,
            endpoints: Endpoints::from_external("https://mimir.example/cos-mimir"),
            config: None,
        };
        let cm = status_configmap(&result);
        assert_eq!(cm["data"]["external_url"], "https://mimir.example/cos-mimir");
        assert_eq!(cm["data"]["remote_write_url"], "https://mimir.example/cos-mimir/api/v1/push");
        let ds: Json = serde_json::from_str(cm["data"]["datasource.json"].as_str().unwrap()).unwrap();
        assert_eq!(ds["url"], "https://mimir.example/cos-mimir/prometheus");
        assert_eq!(ds["jsonData"]["httpHeaderName1"], "X-Scope-OrgID");
        assert_eq!(cm["data"]["status"], "blocked");
        assert_eq!(cm["data"]["reason"], "missing required dependency: s3");
        assert_eq!(cm["data"]["version"], "");
        assert_eq!(cm["data"]["nginx.conf"], "");
    }
}
