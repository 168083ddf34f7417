//! Mimir persistence: small SQLite history of the views pushed to each worker.
//! Keeps the latest 3 per worker; enough to answer "what did this worker last get".

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use mimir_core::{hash_hex, PushError, Pusher, RenderedView};
use serde::{Deserialize, Serialize};
use tracing::warn;

const KEEP_PER_UNIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub unit: String,
    pub hash: String,
    pub roles: String,
    pub ts: i64,
    pub config_yaml: String,
}

impl ViewRecord {
    pub fn from_view(view: &RenderedView, ts: i64) -> Self {
        Self {
            unit: view.unit_id.clone(),
            hash: hash_hex(view.hash),
            roles: view.roles.iter().map(|r| r.as_str()).collect::<Vec<_>>().join(","),
            ts,
            config_yaml: view.config_yaml.clone(),
        }
    }
}

pub trait History: Send + Sync {
    fn record(&self, rec: &ViewRecord) -> Result<()>;
    fn recent(&self, unit: &str, limit: Option<usize>) -> Result<Vec<ViewRecord>>;
}

/// SQLite-backed history. Synchronous; writes are tiny and happen once per successful push.
pub struct SqliteHistory {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteHistory {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("MIMIR_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS view_history (
                unit   TEXT NOT NULL,
                hash   TEXT NOT NULL,
                roles  TEXT NOT NULL,
                ts     INTEGER NOT NULL,
                config BLOB NOT NULL
            )",
            [],
        )
        .context("creating view_history table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_view_history_unit_ts ON view_history(unit, ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("history db lock poisoned"))
    }
}

impl History for SqliteHistory {
    fn record(&self, rec: &ViewRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO view_history(unit, hash, roles, ts, config) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&rec.unit, &rec.hash, &rec.roles, rec.ts, maybe_compress(&rec.config_yaml)),
        )?;
        tx.execute(
            "DELETE FROM view_history
             WHERE unit = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM view_history WHERE unit = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&rec.unit, KEEP_PER_UNIT as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn recent(&self, unit: &str, limit: Option<usize>) -> Result<Vec<ViewRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(KEEP_PER_UNIT);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT hash, roles, ts, config FROM view_history WHERE unit = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((unit, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(3)?;
            out.push(ViewRecord {
                unit: unit.to_string(),
                hash: row.get(0)?,
                roles: row.get(1)?,
                ts: row.get(2)?,
                config_yaml: maybe_decompress(&blob),
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// Wraps a pusher and records every view the inner pusher accepted.
pub struct RecordingPusher {
    inner: Arc<dyn Pusher>,
    history: Arc<dyn History>,
}

impl RecordingPusher {
    pub fn new(inner: Arc<dyn Pusher>, history: Arc<dyn History>) -> Self { Self { inner, history } }
}

#[async_trait::async_trait]
impl Pusher for RecordingPusher {
    async fn push(&self, view: &RenderedView) -> Result<(), PushError> {
        self.inner.push(view).await?;
        if let Err(e) = self.history.record(&ViewRecord::from_view(view, now_ts())) {
            counter!("persist_put_err_total", 1u64);
            warn!(unit = %view.unit_id, error = %e, "history record failed");
        }
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".mimir");
        let _ = std::fs::create_dir_all(&p);
        p.push("coordinator.db");
        return p.to_string_lossy().to_string();
    }
    "mimir-coordinator.db".to_string()
}

/// Seconds since epoch.
pub fn now_ts() -> i64 { chrono::Utc::now().timestamp() }

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("MIMIR_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
