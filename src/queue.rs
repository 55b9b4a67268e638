use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use serde::Serialize;

use crate::config::Config;

const SCHEMA_VERSION: i32 = 1;
const QUEUE_DB_FILE: &str = "queue.db";
const SQLITE_MAX_BIND_PARAMS: usize = 999;

/// Durable queue of requests that failed offline, backed by one SQLite
/// database under the configured storage path. Every operation runs on the
/// blocking pool; the handle itself is cheap to clone.
#[derive(Debug, Clone)]
pub struct Queue {
    db_path: PathBuf,
}

/// One persisted request: absolute target URL, HTTP verb, and the body as the
/// ordered chunk sequence captured from the original request stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub body: Vec<Bytes>,
    pub created_at_unix_ms: i64,
}

impl QueuedRequest {
    /// Reassembles the stored chunk sequence into the single payload sent at
    /// replay time.
    pub fn concatenated_body(&self) -> Bytes {
        concat_chunks(&self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedRequestSummary {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub body_bytes: u64,
    pub created_at_unix_ms: i64,
}

pub fn concat_chunks(chunks: &[Bytes]) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let total: usize = chunks.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for chunk in chunks {
                buf.extend_from_slice(chunk);
            }
            buf.freeze()
        }
    }
}

pub fn now_unix_ms() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time before unix epoch")?;
    Ok(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

impl Queue {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(config.storage.path.join(QUEUE_DB_FILE))
    }

    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let queue = Self { db_path };
        queue.init()?;
        Ok(queue)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Appends one record; the auto-assigned key is returned. Storage failures
    /// propagate to the caller.
    pub async fn enqueue(
        &self,
        url: &str,
        method: &str,
        chunks: Vec<Bytes>,
    ) -> anyhow::Result<i64> {
        let db_path = self.db_path.clone();
        let url = url.to_owned();
        let method = method.to_owned();
        tokio::task::spawn_blocking(move || enqueue_blocking(&db_path, &url, &method, &chunks))
            .await
            .context("join enqueue task")?
    }

    /// Snapshot of every stored record in insertion order; the store is not
    /// mutated.
    pub async fn drain_all(&self) -> anyhow::Result<Vec<QueuedRequest>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || drain_all_blocking(&db_path))
            .await
            .context("join drain_all task")?
    }

    /// Removes exactly the named records; returns how many were deleted.
    pub async fn remove(&self, ids: &[i64]) -> anyhow::Result<usize> {
        let db_path = self.db_path.clone();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || remove_blocking(&db_path, &ids))
            .await
            .context("join remove task")?
    }

    /// Removes all records unconditionally.
    pub async fn clear(&self) -> anyhow::Result<usize> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || clear_blocking(&db_path))
            .await
            .context("join clear task")?
    }

    pub async fn count(&self) -> anyhow::Result<u64> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || count_blocking(&db_path))
            .await
            .context("join count task")?
    }

    pub async fn list(&self) -> anyhow::Result<Vec<QueuedRequestSummary>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || list_blocking(&db_path))
            .await
            .context("join list task")?
    }

    fn init(&self) -> anyhow::Result<()> {
        let conn = open_connection(&self.db_path)?;
        migrate(&conn)?;
        Ok(())
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS queued_requests (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  url TEXT NOT NULL,
                  method TEXT NOT NULL,
                  created_at_unix_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queued_request_chunks (
                  request_id INTEGER NOT NULL
                    REFERENCES queued_requests(id) ON DELETE CASCADE,
                  seq INTEGER NOT NULL,
                  data BLOB NOT NULL,
                  PRIMARY KEY (request_id, seq)
                );
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported queue.db schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn enqueue_blocking(
    path: &Path,
    url: &str,
    method: &str,
    chunks: &[Bytes],
) -> anyhow::Result<i64> {
    let mut conn = open_connection(path)?;
    let tx = conn.transaction().context("begin enqueue transaction")?;

    tx.execute(
        "INSERT INTO queued_requests (url, method, created_at_unix_ms) VALUES (?1, ?2, ?3)",
        params![url, method, now_unix_ms()?],
    )
    .context("insert queued request")?;
    let id = tx.last_insert_rowid();

    {
        let mut stmt = tx
            .prepare("INSERT INTO queued_request_chunks (request_id, seq, data) VALUES (?1, ?2, ?3)")
            .context("prepare insert request chunk")?;
        for (seq, chunk) in chunks.iter().enumerate() {
            stmt.execute(params![id, seq as i64, chunk.as_ref()])
                .with_context(|| format!("insert request chunk {seq}"))?;
        }
    }

    tx.commit().context("commit enqueue transaction")?;
    Ok(id)
}

fn drain_all_blocking(path: &Path) -> anyhow::Result<Vec<QueuedRequest>> {
    let conn = open_connection(path)?;

    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, url, method, created_at_unix_ms
            FROM queued_requests
            ORDER BY id ASC
            "#,
        )
        .context("prepare select queued requests")?;
    let mut rows = stmt.query([]).context("query queued requests")?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().context("iterate queued requests")? {
        records.push(QueuedRequest {
            id: row.get::<_, i64>(0).context("deserialize request id")?,
            url: row.get::<_, String>(1).context("deserialize request url")?,
            method: row
                .get::<_, String>(2)
                .context("deserialize request method")?,
            body: Vec::new(),
            created_at_unix_ms: row
                .get::<_, i64>(3)
                .context("deserialize created_at_unix_ms")?,
        });
    }
    drop(rows);
    drop(stmt);

    let mut chunk_stmt = conn
        .prepare(
            r#"
            SELECT data
            FROM queued_request_chunks
            WHERE request_id = ?1
            ORDER BY seq ASC
            "#,
        )
        .context("prepare select request chunks")?;
    for record in &mut records {
        let mut chunk_rows = chunk_stmt
            .query(params![record.id])
            .context("query request chunks")?;
        while let Some(row) = chunk_rows.next().context("iterate request chunks")? {
            let data = row.get::<_, Vec<u8>>(0).context("deserialize chunk data")?;
            record.body.push(Bytes::from(data));
        }
    }

    Ok(records)
}

fn remove_blocking(path: &Path, ids: &[i64]) -> anyhow::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut conn = open_connection(path)?;
    let tx = conn.transaction().context("begin remove transaction")?;
    let mut removed = 0;
    for chunk in ids.chunks(SQLITE_MAX_BIND_PARAMS) {
        let placeholders = (1..=chunk.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("DELETE FROM queued_requests WHERE id IN ({placeholders})");
        removed += tx
            .execute(&sql, params_from_iter(chunk.iter()))
            .context("delete queued requests")?;
    }
    tx.commit().context("commit remove transaction")?;
    Ok(removed)
}

fn clear_blocking(path: &Path) -> anyhow::Result<usize> {
    let conn = open_connection(path)?;
    conn.execute("DELETE FROM queued_requests", [])
        .context("clear queued requests")
}

fn count_blocking(path: &Path) -> anyhow::Result<u64> {
    let conn = open_connection(path)?;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM queued_requests", [], |row| row.get(0))
        .context("count queued requests")?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn list_blocking(path: &Path) -> anyhow::Result<Vec<QueuedRequestSummary>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
              r.id,
              r.url,
              r.method,
              r.created_at_unix_ms,
              COALESCE(SUM(LENGTH(c.data)), 0)
            FROM queued_requests r
            LEFT JOIN queued_request_chunks c ON c.request_id = r.id
            GROUP BY r.id
            ORDER BY r.id ASC
            "#,
        )
        .context("prepare list queued requests")?;

    let mut rows = stmt.query([]).context("query list queued requests")?;
    let mut summaries = Vec::new();
    while let Some(row) = rows.next().context("iterate list queued requests")? {
        summaries.push(QueuedRequestSummary {
            id: row.get::<_, i64>(0).context("deserialize request id")?,
            url: row.get::<_, String>(1).context("deserialize request url")?,
            method: row
                .get::<_, String>(2)
                .context("deserialize request method")?,
            created_at_unix_ms: row
                .get::<_, i64>(3)
                .context("deserialize created_at_unix_ms")?,
            body_bytes: u64::try_from(row.get::<_, i64>(4).context("deserialize body size")?)
                .unwrap_or(0),
        });
    }
    Ok(summaries)
}
