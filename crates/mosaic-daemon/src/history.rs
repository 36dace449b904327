//! Change-history collaborator adapter.
//!
//! Records who painted which pixel when, and the registered identities'
//! display names. The canvas itself is never reconstructed from here; the
//! chunk store is the source of truth and history is strictly an audit
//! lookup, so writes to it are best-effort from the caller's point of view.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::debug;

use crate::cache::TtlCache;

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        color TEXT NOT NULL,
        subject TEXT NOT NULL,
        time INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_changes_pixel ON changes(x, y, time);

    CREATE TABLE IF NOT EXISTS users (
        uuid TEXT PRIMARY KEY,
        name TEXT,
        created INTEGER NOT NULL,
        used INTEGER NOT NULL
    );
";

/// Provenance lookups are cached this long; matches the endpoint's
/// client-side cache lifetime.
const PROVENANCE_TTL: Duration = Duration::from_secs(60);

/// Length of the subject-id fragment exposed to clients.
const SUBJECT_FRAGMENT_LEN: usize = 16;

/// Errors from the history database.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Database error.
    #[error("history database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// One accepted write, as recorded for audit lookups.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub x: u32,
    pub y: u32,
    /// Hex color (without `#`), as painted.
    pub color: String,
    /// Stripped subject uuid.
    pub subject: String,
    /// Epoch seconds.
    pub time: i64,
}

/// Client-facing answer to "who painted this pixel".
#[derive(Debug, Clone)]
pub struct PixelProvenance {
    pub modified_at: i64,
    /// A fragment of the writer's subject id, not the whole identity.
    pub writer_fragment: String,
    pub writer_name: Option<String>,
}

/// SQLite-backed history store.
#[derive(Clone)]
pub struct ChangeHistory {
    conn: Arc<Mutex<Connection>>,
    provenance_cache: Arc<TtlCache<(u32, u32), Option<PixelProvenance>>>,
}

impl ChangeHistory {
    /// Opens (or creates) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            provenance_cache: Arc::new(TtlCache::new(PROVENANCE_TTL)),
        })
    }

    /// Appends one accepted write.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure; callers on the write path log
    /// and continue, they never roll back the pixel.
    pub fn record_change(&self, record: &ChangeRecord) -> Result<(), HistoryError> {
        self.lock().execute(
            "INSERT INTO changes (x, y, color, subject, time) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.x, record.y, record.color, record.subject, record.time],
        )?;
        // The pixel's provenance just changed; serve it fresh.
        self.provenance_cache.put(
            (record.x, record.y),
            Some(PixelProvenance {
                modified_at: record.time,
                writer_fragment: subject_fragment(&record.subject),
                writer_name: self.user_name(&record.subject)?,
            }),
        );
        Ok(())
    }

    /// Registers (or renames) an identity.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn register_user(&self, uuid: &str, name: &str, now: i64) -> Result<(), HistoryError> {
        self.lock().execute(
            "INSERT INTO users (uuid, name, created, used) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(uuid) DO UPDATE SET name = excluded.name, used = excluded.used",
            params![uuid, name, now],
        )?;
        Ok(())
    }

    /// Bumps an identity's last-used time. Returns whether the identity is
    /// known at all; an unknown one means the client must re-register.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn touch_user(&self, uuid: &str, now: i64) -> Result<bool, HistoryError> {
        let updated = self.lock().execute(
            "UPDATE users SET used = ?2 WHERE uuid = ?1",
            params![uuid, now],
        )?;
        Ok(updated > 0)
    }

    /// The display name registered for an identity.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn user_name(&self, uuid: &str) -> Result<Option<String>, HistoryError> {
        let name = self
            .lock()
            .query_row(
                "SELECT name FROM users WHERE uuid = ?1",
                params![uuid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    /// The most recent change at `(x, y)`, joined with the writer's name.
    /// Cached for [`PROVENANCE_TTL`].
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn pixel_provenance(
        &self,
        x: u32,
        y: u32,
    ) -> Result<Option<PixelProvenance>, HistoryError> {
        if let Some(cached) = self.provenance_cache.get(&(x, y)) {
            debug!(x, y, "provenance cache hit");
            return Ok(cached);
        }

        let row = self
            .lock()
            .query_row(
                "SELECT c.subject, c.time, u.name
                 FROM changes c LEFT JOIN users u ON u.uuid = c.subject
                 WHERE c.x = ?1 AND c.y = ?2
                 ORDER BY c.time DESC, c.id DESC LIMIT 1",
                params![x, y],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let provenance = row.map(|(subject, time, name)| PixelProvenance {
            modified_at: time,
            writer_fragment: subject_fragment(&subject),
            writer_name: name,
        });
        self.provenance_cache.put((x, y), provenance.clone());
        Ok(provenance)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Middle slice of a stripped subject uuid, long enough to distinguish
/// writers without handing out the full identity.
fn subject_fragment(subject: &str) -> String {
    subject
        .chars()
        .skip(8)
        .take(SUBJECT_FRAGMENT_LEN)
        .collect()
}
