//! Identity embeddings, class rosters and session tallies in SQLite.

use crate::attendance::{SessionTally, TallyStatus};
use chrono::{DateTime, Utc};
use edusense_core::{Candidate, Embedding};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS persons (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS identities (
    identity_id TEXT PRIMARY KEY,
    person_id   INTEGER NOT NULL REFERENCES persons(id),
    embedding   BLOB,
    updated_at  TEXT
);
CREATE TABLE IF NOT EXISTS class_rosters (
    class_id    TEXT NOT NULL,
    identity_id TEXT NOT NULL REFERENCES identities(identity_id),
    PRIMARY KEY (class_id, identity_id)
);
CREATE TABLE IF NOT EXISTS sessions (
    session_id  TEXT PRIMARY KEY,
    class_id    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tallies (
    session_id         TEXT NOT NULL REFERENCES sessions(session_id),
    identity_id        TEXT NOT NULL REFERENCES identities(identity_id),
    appearance_count   INTEGER NOT NULL,
    evidence_reference TEXT,
    dominant_emotion   TEXT,
    status             TEXT NOT NULL,
    disputed           INTEGER NOT NULL DEFAULT 0,
    note               TEXT,
    updated_at         TEXT NOT NULL,
    PRIMARY KEY (session_id, identity_id)
);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("cannot prepare database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned by a panicked worker")]
    Poisoned,
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("{identity_id} is not enrolled in the class of session {session_id}")]
    NotEnrolled {
        session_id: String,
        identity_id: String,
    },
    #[error("no tally for {identity_id} in session {session_id}; process the session first")]
    NoTally {
        session_id: String,
        identity_id: String,
    },
    #[error("stored embedding for {0} is corrupt")]
    CorruptEmbedding(String),
}

impl StoreError {
    /// True when the store itself cannot be used, as opposed to a request it refused.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_) | StoreError::Io(_) | StoreError::Poisoned | StoreError::CorruptEmbedding(_)
        )
    }
}

/// Whether an upsert created a new identity or replaced an existing embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

/// One identity as stored: owning person and current embedding, if registered.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub person_id: i64,
    pub embedding: Option<Embedding>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persistence used by the attendance and registration pipelines.
///
/// Shared by every running task; implementations serialize their own writes.
pub trait AttendanceStore: Send + Sync {
    /// Overwrite the embedding for `identity_id`, creating person and identity if missing.
    fn upsert_embedding(&self, identity_id: &str, embedding: &Embedding) -> Result<UpsertAction, StoreError>;

    fn identity(&self, identity_id: &str) -> Result<Option<IdentityRecord>, StoreError>;

    fn identities(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    /// Add `identity_id` to a class roster. Unknown identities are created without an embedding.
    fn enroll(&self, class_id: &str, identity_id: &str) -> Result<(), StoreError>;

    /// Create or re-point a session at the class it belongs to.
    fn define_session(&self, session_id: &str, class_id: &str) -> Result<(), StoreError>;

    /// Everyone enrolled in the session's class, ordered by identity id.
    fn roster(&self, session_id: &str) -> Result<Vec<Candidate>, StoreError>;

    /// Supersede the machine-produced tallies of a session.
    ///
    /// Manually overridden tallies are kept as they are. Dispute flags and notes
    /// carry over to the new figures. Tallies are never deleted.
    fn replace_tallies(&self, session_id: &str, tallies: &[SessionTally]) -> Result<(), StoreError>;

    fn tallies(&self, session_id: &str) -> Result<Vec<SessionTally>, StoreError>;

    /// Mark a tally as manually overridden (counted present) and clear any dispute.
    fn override_tally(
        &self,
        session_id: &str,
        identity_id: &str,
        note: Option<&str>,
    ) -> Result<SessionTally, StoreError>;

    /// Flag an existing tally as disputed with an explanatory note.
    fn flag_dispute(&self, session_id: &str, identity_id: &str, note: &str) -> Result<SessionTally, StoreError>;
}

/// [`AttendanceStore`] over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn decode_embedding(identity_id: &str, blob: Option<Vec<u8>>) -> Result<Option<Embedding>, StoreError> {
    match blob {
        None => Ok(None),
        Some(bytes) => Embedding::from_le_bytes(&bytes)
            .map(Some)
            .ok_or_else(|| StoreError::CorruptEmbedding(identity_id.to_string())),
    }
}

fn ensure_identity(conn: &Connection, identity_id: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM identities WHERE identity_id = ?1",
            [identity_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        let stamp = now();
        conn.execute("INSERT INTO persons (created_at) VALUES (?1)", [&stamp])?;
        let person_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO identities (identity_id, person_id) VALUES (?1, ?2)",
            params![identity_id, person_id],
        )?;
    }
    Ok(!exists)
}

fn session_class(conn: &Connection, session_id: &str) -> Result<String, StoreError> {
    conn.query_row(
        "SELECT class_id FROM sessions WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))
}

fn check_enrolled(conn: &Connection, session_id: &str, identity_id: &str) -> Result<(), StoreError> {
    let class_id = session_class(conn, session_id)?;
    let enrolled = conn
        .query_row(
            "SELECT 1 FROM class_rosters WHERE class_id = ?1 AND identity_id = ?2",
            params![class_id, identity_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if enrolled {
        Ok(())
    } else {
        Err(StoreError::NotEnrolled {
            session_id: session_id.to_string(),
            identity_id: identity_id.to_string(),
        })
    }
}

const TALLY_COLUMNS: &str =
    "identity_id, appearance_count, evidence_reference, dominant_emotion, status, disputed, note, updated_at";

fn read_tally(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionTally> {
    let status: String = row.get(4)?;
    Ok(SessionTally {
        identity_id: row.get(0)?,
        appearance_count: row.get(1)?,
        evidence_reference: row.get(2)?,
        dominant_emotion: row.get(3)?,
        status: status.parse().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown tally status {status:?}").into(),
            )
        })?,
        disputed: row.get(5)?,
        note: row.get(6)?,
        updated_at: parse_time(row.get(7)?),
    })
}

fn load_tally(conn: &Connection, session_id: &str, identity_id: &str) -> Result<Option<SessionTally>, StoreError> {
    let sql = format!("SELECT {TALLY_COLUMNS} FROM tallies WHERE session_id = ?1 AND identity_id = ?2");
    Ok(conn
        .query_row(&sql, params![session_id, identity_id], read_tally)
        .optional()?)
}

impl AttendanceStore for SqliteStore {
    fn upsert_embedding(&self, identity_id: &str, embedding: &Embedding) -> Result<UpsertAction, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let created = ensure_identity(&tx, identity_id)?;
        tx.execute(
            "UPDATE identities SET embedding = ?2, updated_at = ?3 WHERE identity_id = ?1",
            params![identity_id, embedding.to_le_bytes(), now()],
        )?;
        tx.commit()?;

        let action = if created {
            UpsertAction::Created
        } else {
            UpsertAction::Updated
        };
        tracing::debug!(identity_id, ?action, "embedding stored");
        Ok(action)
    }

    fn identity(&self, identity_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT person_id, embedding, updated_at FROM identities WHERE identity_id = ?1",
                [identity_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(person_id, blob, updated_at)| {
            Ok::<_, StoreError>(IdentityRecord {
                identity_id: identity_id.to_string(),
                person_id,
                embedding: decode_embedding(identity_id, blob)?,
                updated_at: parse_time(updated_at),
            })
        })
        .transpose()
    }

    fn identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, person_id, embedding, updated_at FROM identities ORDER BY identity_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(identity_id, person_id, blob, updated_at)| {
                Ok(IdentityRecord {
                    embedding: decode_embedding(&identity_id, blob)?,
                    identity_id,
                    person_id,
                    updated_at: parse_time(updated_at),
                })
            })
            .collect()
    }

    fn enroll(&self, class_id: &str, identity_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        ensure_identity(&tx, identity_id)?;
        tx.execute(
            "INSERT OR IGNORE INTO class_rosters (class_id, identity_id) VALUES (?1, ?2)",
            params![class_id, identity_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn define_session(&self, session_id: &str, class_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (session_id, class_id) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET class_id = excluded.class_id",
            params![session_id, class_id],
        )?;
        Ok(())
    }

    fn roster(&self, session_id: &str) -> Result<Vec<Candidate>, StoreError> {
        let conn = self.conn()?;
        let class_id = session_class(&conn, session_id)?;
        let mut stmt = conn.prepare(
            "SELECT r.identity_id, i.embedding
             FROM class_rosters r JOIN identities i ON i.identity_id = r.identity_id
             WHERE r.class_id = ?1
             ORDER BY r.identity_id",
        )?;
        let rows = stmt
            .query_map([&class_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(identity_id, blob)| {
                Ok(Candidate {
                    embedding: decode_embedding(&identity_id, blob)?,
                    identity_id,
                })
            })
            .collect()
    }

    fn replace_tallies(&self, session_id: &str, tallies: &[SessionTally]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        session_class(&tx, session_id)?;

        // Rows are superseded in place: dispute flag and note stay with the
        // identity, and manual overrides are not touched at all.
        let stamp = now();
        let mut kept = 0usize;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO tallies
                 (session_id, identity_id, appearance_count, evidence_reference, dominant_emotion,
                  status, disputed, note, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(session_id, identity_id) DO UPDATE SET
                     appearance_count = excluded.appearance_count,
                     evidence_reference = excluded.evidence_reference,
                     dominant_emotion = excluded.dominant_emotion,
                     status = excluded.status,
                     updated_at = excluded.updated_at
                 WHERE tallies.status != ?10",
            )?;
            for tally in tallies {
                let written = upsert.execute(params![
                    session_id,
                    tally.identity_id,
                    tally.appearance_count,
                    tally.evidence_reference,
                    tally.dominant_emotion,
                    tally.status.as_str(),
                    tally.disputed,
                    tally.note,
                    stamp,
                    TallyStatus::ManuallyOverridden.as_str(),
                ])?;
                if written == 0 {
                    kept += 1;
                }
            }
        }
        tx.commit()?;

        tracing::info!(
            session_id,
            written = tallies.len() - kept,
            overrides_kept = kept,
            "session tallies stored"
        );
        Ok(())
    }

    fn tallies(&self, session_id: &str) -> Result<Vec<SessionTally>, StoreError> {
        let conn = self.conn()?;
        session_class(&conn, session_id)?;
        let sql = format!("SELECT {TALLY_COLUMNS} FROM tallies WHERE session_id = ?1 ORDER BY identity_id");
        let mut stmt = conn.prepare(&sql)?;
        let tallies = stmt
            .query_map([session_id], read_tally)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tallies)
    }

    fn override_tally(
        &self,
        session_id: &str,
        identity_id: &str,
        note: Option<&str>,
    ) -> Result<SessionTally, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        check_enrolled(&tx, session_id, identity_id)?;

        tx.execute(
            "INSERT INTO tallies (session_id, identity_id, appearance_count, status, disputed, note, updated_at)
             VALUES (?1, ?2, 0, ?3, 0, ?4, ?5)
             ON CONFLICT(session_id, identity_id) DO UPDATE SET
                 status = excluded.status,
                 disputed = 0,
                 note = COALESCE(excluded.note, tallies.note),
                 updated_at = excluded.updated_at",
            params![
                session_id,
                identity_id,
                TallyStatus::ManuallyOverridden.as_str(),
                note,
                now()
            ],
        )?;
        let tally = load_tally(&tx, session_id, identity_id)?.ok_or_else(|| StoreError::NoTally {
            session_id: session_id.to_string(),
            identity_id: identity_id.to_string(),
        })?;
        tx.commit()?;

        tracing::info!(session_id, identity_id, "tally manually overridden");
        Ok(tally)
    }

    fn flag_dispute(&self, session_id: &str, identity_id: &str, note: &str) -> Result<SessionTally, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        check_enrolled(&tx, session_id, identity_id)?;

        let changed = tx.execute(
            "UPDATE tallies SET disputed = 1, note = ?3, updated_at = ?4
             WHERE session_id = ?1 AND identity_id = ?2",
            params![session_id, identity_id, note, now()],
        )?;
        if changed == 0 {
            return Err(StoreError::NoTally {
                session_id: session_id.to_string(),
                identity_id: identity_id.to_string(),
            });
        }
        let tally = load_tally(&tx, session_id, identity_id)?.ok_or_else(|| StoreError::NoTally {
            session_id: session_id.to_string(),
            identity_id: identity_id.to_string(),
        })?;
        tx.commit()?;

        tracing::info!(session_id, identity_id, "tally disputed");
        Ok(tally)
    }
}
