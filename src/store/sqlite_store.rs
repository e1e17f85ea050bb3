//! Embedded SQLite store for the rescan cursor.
use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{bip158::FilterHeader, hashes::Hash, BlockHash};
use rusqlite::{params, Connection};
use std::{path::PathBuf, str::FromStr};
use tokio::task;

use crate::{chain::ChainTip, store::Store};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS state (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// Simple key/value table:
///   state(key TEXT PRIMARY KEY, value TEXT NOT NULL)
///
/// Keys used:
///  - cursor_height        : u32 decimal string
///  - cursor_hash          : BlockHash display hex
///  - cursor_filter_header : hex of the raw 32 filter header bytes
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { path })
    }

    fn kv_get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
        let mut stmt = conn.prepare("SELECT value FROM state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            let v: String = row.get(0)?;
            Ok(Some(v))
        } else {
            Ok(None)
        }
    }

    fn kv_set(conn: &Connection, key: &str, val: &str) -> anyhow::Result<()> {
        conn.execute(
            "INSERT INTO state(key,value) VALUES(?1,?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, val],
        )?;
        Ok(())
    }

    fn decode_filter_header(s: &str) -> anyhow::Result<FilterHeader> {
        let bytes: [u8; 32] = hex::decode(s)
            .context("decode cursor_filter_header")?
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("filter header is {} bytes, expected 32", v.len()))?;
        Ok(FilterHeader::from_byte_array(bytes))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_cursor(&self) -> anyhow::Result<Option<ChainTip>> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let h = Self::kv_get(&conn, "cursor_height")?;
            let hh = Self::kv_get(&conn, "cursor_hash")?;
            let fh = Self::kv_get(&conn, "cursor_filter_header")?;
            match (h, hh, fh) {
                (Some(h), Some(hh), Some(fh)) => Ok(Some(ChainTip {
                    height: h.parse().context("parse cursor_height")?,
                    block_hash: BlockHash::from_str(&hh).context("parse cursor_hash")?,
                    filter_header: Self::decode_filter_header(&fh)?,
                })),
                _ => Ok(None),
            }
        })
        .await?
    }

    async fn save_cursor(&self, cursor: ChainTip) -> anyhow::Result<()> {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            let tx = conn.unchecked_transaction()?;
            Self::kv_set(&conn, "cursor_height", &cursor.height.to_string())?;
            Self::kv_set(&conn, "cursor_hash", &cursor.block_hash.to_string())?;
            Self::kv_set(
                &conn,
                "cursor_filter_header",
                &hex::encode(cursor.filter_header.to_byte_array()),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }
}
