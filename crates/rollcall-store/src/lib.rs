//! rollcall-store: Persistent identities and attendance records.
//!
//! SQLite accessed through `tokio-rusqlite`, so every call runs on the
//! connection's own thread and never blocks the caller's runtime.

use rollcall_core::{AttendanceRecord, IdentityRecord};
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL UNIQUE,
    external_id  TEXT UNIQUE,
    embedding    TEXT,
    enrolled_at  TEXT NOT NULL,
    image_path   TEXT
);
CREATE TABLE IF NOT EXISTS attendance (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    external_id  TEXT NOT NULL,
    date         TEXT NOT NULL,
    time         TEXT NOT NULL,
    timestamp    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance(date);
";

const SELECT_IDENTITY: &str =
    "SELECT id, display_name, external_id, embedding, enrolled_at, image_path FROM identities";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("an identity with this name or external ID already exists")]
    DuplicateKey,
    #[error("store unavailable: {0}")]
    Unavailable(#[from] tokio_rusqlite::Error),
    #[error("embedding could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fields needed to create an identity; the store assigns the record ID.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub display_name: String,
    pub external_id: Option<String>,
    pub embedding: Vec<f32>,
    pub enrolled_at: String,
    pub image_path: Option<String>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened attendance store");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let rows = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(&format!("{SELECT_IDENTITY} ORDER BY id"))?;
                let rows = stmt
                    .query_map([], IdentityRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows.into_iter().map(IdentityRow::into_record).collect())
    }

    pub async fn find_identity(&self, external_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let external_id = external_id.to_string();
        let row = self
            .conn
            .call(move |c| {
                let row = c
                    .query_row(
                        &format!("{SELECT_IDENTITY} WHERE external_id = ?1"),
                        params![external_id],
                        IdentityRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        Ok(row.map(IdentityRow::into_record))
    }

    /// Insert an identity and return its record ID.
    pub async fn create_identity(&self, identity: NewIdentity) -> Result<i64, StoreError> {
        let embedding = serde_json::to_string(&identity.embedding)?;
        let inserted = self
            .conn
            .call(move |c| {
                let result = c.execute(
                    "INSERT INTO identities (display_name, external_id, embedding, enrolled_at, image_path)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        identity.display_name,
                        identity.external_id,
                        embedding,
                        identity.enrolled_at,
                        identity.image_path
                    ],
                );
                match result {
                    Ok(_) => Ok(Some(c.last_insert_rowid())),
                    Err(e) if is_constraint_violation(&e) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        inserted.ok_or(StoreError::DuplicateKey)
    }

    /// Delete an identity. Returns the removed record, if there was one.
    pub async fn delete_identity(&self, record_id: i64) -> Result<Option<IdentityRecord>, StoreError> {
        let row = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let row = tx
                    .query_row(
                        &format!("{SELECT_IDENTITY} WHERE id = ?1"),
                        params![record_id],
                        IdentityRow::from_row,
                    )
                    .optional()?;
                tx.execute("DELETE FROM identities WHERE id = ?1", params![record_id])?;
                tx.commit()?;
                Ok(row)
            })
            .await?;

        Ok(row.map(IdentityRow::into_record))
    }

    /// Point an identity at its enrollment snapshot.
    pub async fn set_image_path(&self, record_id: i64, image_path: Option<String>) -> Result<bool, StoreError> {
        let updated = self
            .conn
            .call(move |c| {
                Ok(c.execute(
                    "UPDATE identities SET image_path = ?1 WHERE id = ?2",
                    params![image_path, record_id],
                )?)
            })
            .await?;
        Ok(updated > 0)
    }

    pub async fn list_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT display_name, external_id, date, time, timestamp
                     FROM attendance ORDER BY id",
                )?;
                let records = stmt
                    .query_map([], |row| {
                        Ok(AttendanceRecord {
                            display_name: row.get(0)?,
                            external_id: row.get(1)?,
                            date: row.get(2)?,
                            time: row.get(3)?,
                            timestamp: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    pub async fn append_attendance(&self, record: AttendanceRecord) -> Result<(), StoreError> {
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO attendance (display_name, external_id, date, time, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.display_name,
                        record.external_id,
                        record.date,
                        record.time,
                        record.timestamp
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Remove every attendance record. Returns how many were deleted.
    pub async fn clear_attendance(&self) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .call(|c| Ok(c.execute("DELETE FROM attendance", [])?))
            .await?;
        tracing::info!(removed, "attendance records cleared");
        Ok(removed)
    }
}

struct IdentityRow {
    id: i64,
    display_name: String,
    external_id: Option<String>,
    embedding: Option<String>,
    enrolled_at: String,
    image_path: Option<String>,
}

impl IdentityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            external_id: row.get(2)?,
            embedding: row.get(3)?,
            enrolled_at: row.get(4)?,
            image_path: row.get(5)?,
        })
    }

    /// An embedding column that does not parse is reported as absent, so one
    /// damaged row never hides the others.
    fn into_record(self) -> IdentityRecord {
        let embedding = self.embedding.as_deref().and_then(|s| {
            serde_json::from_str::<Vec<f32>>(s)
                .map_err(|e| {
                    tracing::warn!(
                        record_id = self.id,
                        name = %self.display_name,
                        error = %e,
                        "stored embedding is unreadable"
                    );
                })
                .ok()
        });
        IdentityRecord {
            record_id: self.id,
            display_name: self.display_name,
            external_id: self.external_id,
            embedding,
            enrolled_at: self.enrolled_at,
            image_path: self.image_path,
        }
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}
