//! SQLite persistence for enrolled faces and API users.
//!
//! One `tokio_rusqlite` connection serialises every statement, so a reader
//! never observes a half-written record.

use chrono::{DateTime, SecondsFormat, Utc};
use recall_core::{Embedding, EmbeddingRecord};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS faces (
    id            TEXT PRIMARY KEY,
    owner_id      TEXT NOT NULL,
    person_name   TEXT NOT NULL,
    embedding     BLOB,
    model_version TEXT,
    image_path    TEXT,
    enrolled_at   TEXT NOT NULL,
    UNIQUE(owner_id, person_name)
);
CREATE INDEX IF NOT EXISTS faces_owner ON faces(owner_id);
CREATE TABLE IF NOT EXISTS users (
    token        TEXT PRIMARY KEY,
    owner_id     TEXT NOT NULL,
    display_name TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A user allowed to call the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub token: String,
    pub owner_id: String,
    pub display_name: String,
}

/// Row as read from SQLite; embedding blobs are decoded off the db thread.
struct FaceRow {
    id: String,
    owner_id: String,
    person_name: String,
    embedding: Option<Vec<u8>>,
    model_version: Option<String>,
    image_path: Option<String>,
    enrolled_at: String,
}

impl FaceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            person_name: row.get(2)?,
            embedding: row.get(3)?,
            model_version: row.get(4)?,
            image_path: row.get(5)?,
            enrolled_at: row.get(6)?,
        })
    }

    fn into_record(self) -> EmbeddingRecord {
        let embedding = self.embedding.and_then(|blob| {
            let decoded = Embedding::from_le_bytes(&blob, self.model_version.clone());
            if decoded.is_none() {
                tracing::warn!(
                    owner = %self.owner_id,
                    person = %self.person_name,
                    bytes = blob.len(),
                    "ignoring corrupt embedding blob"
                );
            }
            decoded
        });
        let enrolled_at = match DateTime::parse_from_rfc3339(&self.enrolled_at) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(
                    owner = %self.owner_id,
                    person = %self.person_name,
                    value = %self.enrolled_at,
                    error = %e,
                    "unparseable enrolled_at, using the epoch"
                );
                DateTime::<Utc>::default()
            }
        };

        EmbeddingRecord {
            id: self.id,
            owner_id: self.owner_id,
            person_name: self.person_name,
            embedding,
            image_path: self.image_path,
            enrolled_at,
        }
    }
}

const FACE_COLUMNS: &str =
    "id, owner_id, person_name, embedding, model_version, image_path, enrolled_at";

/// Handle to the face database. Cheap to clone.
#[derive(Clone)]
pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    /// Open or create the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert or overwrite the record for `(owner_id, person_name)`.
    ///
    /// Returns the stored record and the image path it replaced, if any.
    pub async fn upsert(
        &self,
        owner_id: &str,
        person_name: &str,
        embedding: Option<&Embedding>,
        image_path: Option<&str>,
    ) -> Result<(EmbeddingRecord, Option<String>), StoreError> {
        let owner = owner_id.to_string();
        let name = person_name.to_string();
        let blob = embedding.map(Embedding::to_le_bytes);
        let model_version = embedding.and_then(|e| e.model_version.clone());
        let image_path = image_path.map(str::to_string);
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let new_id = uuid::Uuid::new_v4().to_string();

        let (row, previous) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous: Option<Option<String>> = tx
                    .query_row(
                        "SELECT image_path FROM faces WHERE owner_id = ?1 AND person_name = ?2",
                        params![owner, name],
                        |row| row.get(0),
                    )
                    .optional()?;

                tx.execute(
                    "INSERT INTO faces (id, owner_id, person_name, embedding, model_version, image_path, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(owner_id, person_name) DO UPDATE SET
                        embedding = excluded.embedding,
                        model_version = excluded.model_version,
                        image_path = excluded.image_path,
                        enrolled_at = excluded.enrolled_at",
                    params![new_id, owner, name, blob, model_version, image_path, now],
                )?;

                let row = tx.query_row(
                    &format!(
                        "SELECT {FACE_COLUMNS} FROM faces WHERE owner_id = ?1 AND person_name = ?2"
                    ),
                    params![owner, name],
                    FaceRow::from_row,
                )?;
                tx.commit()?;
                Ok((row, previous.flatten()))
            })
            .await?;

        let record = row.into_record();
        tracing::info!(
            owner = owner_id,
            person = person_name,
            face_detected = record.embedding.is_some(),
            "face enrolled"
        );
        Ok((record, previous))
    }

    /// Records usable for matching: those with an embedding, in enrollment order.
    pub async fn registry(&self, owner_id: &str) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.select(
            owner_id,
            "WHERE owner_id = ?1 AND embedding IS NOT NULL ORDER BY enrolled_at, rowid",
        )
        .await
    }

    /// Every record of the owner, including those without a detected face.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.select(owner_id, "WHERE owner_id = ?1 ORDER BY enrolled_at, rowid")
            .await
    }

    async fn select(
        &self,
        owner_id: &str,
        clause: &'static str,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let owner = owner_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT {FACE_COLUMNS} FROM faces {clause}"))?;
                let rows = stmt
                    .query_map(params![owner], FaceRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows.into_iter().map(FaceRow::into_record).collect())
    }

    /// Delete a record. `None` when no such record exists; otherwise the
    /// image path it held (which may itself be absent).
    pub async fn delete(
        &self,
        owner_id: &str,
        person_name: &str,
    ) -> Result<Option<Option<String>>, StoreError> {
        let owner = owner_id.to_string();
        let name = person_name.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let image_path: Option<Option<String>> = tx
                    .query_row(
                        "SELECT image_path FROM faces WHERE owner_id = ?1 AND person_name = ?2",
                        params![owner, name],
                        |row| row.get(0),
                    )
                    .optional()?;
                if image_path.is_some() {
                    tx.execute(
                        "DELETE FROM faces WHERE owner_id = ?1 AND person_name = ?2",
                        params![owner, name],
                    )?;
                }
                tx.commit()?;
                Ok(image_path)
            })
            .await?;

        if removed.is_some() {
            tracing::info!(owner = owner_id, person = person_name, "face deleted");
        }
        Ok(removed)
    }

    /// Register (or replace) an API token.
    pub async fn add_user(
        &self,
        token: &str,
        owner_id: &str,
        display_name: &str,
    ) -> Result<(), StoreError> {
        let user = UserRecord {
            token: token.to_string(),
            owner_id: owner_id.to_string(),
            display_name: display_name.to_string(),
        };
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (token, owner_id, display_name) VALUES (?1, ?2, ?3)
                     ON CONFLICT(token) DO UPDATE SET
                        owner_id = excluded.owner_id,
                        display_name = excluded.display_name",
                    params![user.token, user.owner_id, user.display_name],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn user_for_token(&self, token: &str) -> Result<Option<UserRecord>, StoreError> {
        let token = token.to_string();
        let user = self
            .conn
            .call(move |conn| {
                let user = conn
                    .query_row(
                        "SELECT token, owner_id, display_name FROM users WHERE token = ?1",
                        params![token],
                        |row| {
                            Ok(UserRecord {
                                token: row.get(0)?,
                                owner_id: row.get(1)?,
                                display_name: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(user)
            })
            .await?;
        Ok(user)
    }
}
