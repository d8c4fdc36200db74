//! SQLite-based MailDb with zstd-compressed block documents

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use rusqlite_migration::{M, Migrations};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{FlushBatch, MailDb};
use crate::models::{Block, BlockId, BlockKind, BodyBlock, HeaderBlock, PersistedFolderInfo};

/// zstd level 3: good balance of speed vs compression
const COMPRESSION_LEVEL: i32 = 3;

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Persisted folder info (block indices, accuracy ranges, id counter)
            CREATE TABLE folders (
                folder_id TEXT PRIMARY KEY,
                info BLOB NOT NULL,  -- zstd compressed JSON
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Header and body blocks, one row per block
            CREATE TABLE blocks (
                folder_id TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('header', 'body')),
                block_id INTEGER NOT NULL,
                data BLOB NOT NULL,  -- zstd compressed JSON
                PRIMARY KEY (folder_id, kind, block_id),
                FOREIGN KEY (folder_id) REFERENCES folders(folder_id) ON DELETE CASCADE
            );
            "#,
        ),
    ])
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value).context("Failed to serialize document")?;
    zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL).context("Failed to compress document")
}

fn decode<T: DeserializeOwned>(compressed: &[u8]) -> Result<T> {
    let mut decoder = zstd::Decoder::new(compressed)?;
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .context("Failed to decompress document")?;
    serde_json::from_slice(&json).context("Failed to parse document")
}

/// SQLite-backed folder storage
///
/// Folder info and blocks are opaque compressed JSON documents; SQLite only
/// provides the transactions and the keyed lookup.
pub struct SqliteMailDb {
    conn: Mutex<Connection>,
}

impl SqliteMailDb {
    /// Open (or create) the database at `db_path` and bring its schema up to date
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed during a flush; NORMAL sync is safe with WAL.
        // foreign_keys is required for the blocks cascade.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_block<E: DeserializeOwned>(
        &self,
        folder_id: &str,
        kind: BlockKind,
        block_id: BlockId,
    ) -> Result<Option<Block<E>>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM blocks WHERE folder_id = ? AND kind = ? AND block_id = ?",
                params![folder_id, kind.as_str(), block_id.0 as i64],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|data| {
            decode(&data)
                .with_context(|| format!("Corrupt {} block {} in {}", kind, block_id, folder_id))
        })
        .transpose()
    }

    fn write_blocks<E: Serialize>(
        tx: &Transaction<'_>,
        folder_id: &str,
        kind: BlockKind,
        blocks: &BTreeMap<BlockId, Option<Block<E>>>,
    ) -> Result<()> {
        let mut upsert = tx.prepare(
            "INSERT INTO blocks (folder_id, kind, block_id, data) VALUES (?, ?, ?, ?)
             ON CONFLICT(folder_id, kind, block_id) DO UPDATE SET data = excluded.data",
        )?;
        let mut delete =
            tx.prepare("DELETE FROM blocks WHERE folder_id = ? AND kind = ? AND block_id = ?")?;

        for (id, block) in blocks {
            match block {
                Some(block) => {
                    upsert.execute(params![folder_id, kind.as_str(), id.0 as i64, encode(block)?])?;
                }
                None => {
                    delete.execute(params![folder_id, kind.as_str(), id.0 as i64])?;
                }
            }
        }
        Ok(())
    }
}

impl MailDb for SqliteMailDb {
    fn load_folder_info(&self, folder_id: &str) -> Result<Option<PersistedFolderInfo>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT info FROM folders WHERE folder_id = ?",
                [folder_id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|data| decode(&data).with_context(|| format!("Corrupt folder info for {}", folder_id)))
            .transpose()
    }

    fn load_header_block(&self, folder_id: &str, block_id: BlockId) -> Result<Option<HeaderBlock>> {
        self.load_block(folder_id, BlockKind::Header, block_id)
    }

    fn load_body_block(&self, folder_id: &str, block_id: BlockId) -> Result<Option<BodyBlock>> {
        self.load_block(folder_id, BlockKind::Body, block_id)
    }

    fn put_blocks(&self, folder_id: &str, batch: &FlushBatch) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO folders (folder_id, info, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(folder_id) DO UPDATE SET info = excluded.info, updated_at = excluded.updated_at",
            params![folder_id, encode(&batch.info)?],
        )?;
        Self::write_blocks(&tx, folder_id, BlockKind::Header, &batch.header_blocks)?;
        Self::write_blocks(&tx, folder_id, BlockKind::Body, &batch.body_blocks)?;

        tx.commit()
            .with_context(|| format!("Failed to commit flush for {}", folder_id))?;
        Ok(())
    }

    fn delete_blocks(&self, folder_id: &str, kind: BlockKind, block_ids: &[BlockId]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("DELETE FROM blocks WHERE folder_id = ? AND kind = ? AND block_id = ?")?;
            for id in block_ids {
                stmt.execute(params![folder_id, kind.as_str(), id.0 as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_folder(&self, folder_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM folders WHERE folder_id = ?", [folder_id])?;
        Ok(())
    }
}
