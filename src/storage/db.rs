//! Relational index of texts and audio artifacts.
//!
//! Two tables: `texts` (one row per submitted text) and `audios` (one row
//! per uploaded artifact, versioned). A partial unique index on
//! `(text_id)` where `is_deleted = 0` enforces "at most one live audio per
//! text": publishing a new version soft-deletes the previous one in the
//! same transaction. Success statistics are computed here rather than from
//! in-process counters, which reset on restart.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::SynthError;
use crate::storage::blob::MAX_AUDIO_VERSIONS;

#[derive(Debug, Clone)]
pub struct TextRow {
    pub text_id: String,
    pub user_id: String,
    pub filename: String,
    pub title: String,
    pub content: String,
    pub char_count: usize,
}

#[derive(Debug, Clone)]
pub struct AudioRow {
    pub audio_id: i64,
    pub text_id: String,
    pub user_id: String,
    pub filename: String,
    pub object_key: String,
    pub duration_secs: Option<f64>,
    pub size_bytes: u64,
    pub version_num: u32,
}

/// Aggregates served to the stats entry point.
#[derive(Debug, Clone, Copy)]
pub struct IndexStats {
    pub texts_total: u64,
    pub audios_live: u64,
}

pub struct TaskIndex {
    conn: Mutex<Connection>,
}

impl TaskIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SynthError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// In-memory database for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self, SynthError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let index = Self {
            conn: Mutex::new(conn),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<(), SynthError> {
        self.conn.lock().execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS texts (
                text_id     TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                filename    TEXT NOT NULL,
                title       TEXT NOT NULL DEFAULT '',
                content     TEXT NOT NULL,
                char_count  INTEGER NOT NULL,
                object_key  TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                is_deleted  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS audios (
                audio_id      INTEGER PRIMARY KEY AUTOINCREMENT,
                text_id       TEXT NOT NULL REFERENCES texts(text_id),
                user_id       TEXT NOT NULL,
                filename      TEXT NOT NULL,
                object_key    TEXT NOT NULL UNIQUE,
                duration_secs REAL,
                size_bytes    INTEGER NOT NULL,
                version_num   INTEGER NOT NULL,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                is_deleted    INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_audios_one_live
                ON audios(text_id) WHERE is_deleted = 0;
            CREATE INDEX IF NOT EXISTS idx_audios_text
                ON audios(text_id, version_num);
            ",
        )?;
        Ok(())
    }

    /// Insert or refresh the text row for a submission.
    pub fn upsert_text(&self, row: &TextRow) -> Result<(), SynthError> {
        let now = Utc::now().to_rfc3339();
        self.conn.lock().execute(
            r"
            INSERT INTO texts (text_id, user_id, filename, title, content, char_count,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(text_id) DO UPDATE SET
                user_id = excluded.user_id,
                filename = excluded.filename,
                title = excluded.title,
                content = excluded.content,
                char_count = excluded.char_count,
                updated_at = excluded.updated_at,
                is_deleted = 0
            ",
            params![
                row.text_id,
                row.user_id,
                row.filename,
                row.title,
                row.content,
                row.char_count as i64,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_text(&self, text_id: &str) -> Result<Option<TextRow>, SynthError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r"SELECT text_id, user_id, filename, title, content, char_count
                  FROM texts WHERE text_id = ?1 AND is_deleted = 0",
                params![text_id],
                |r| {
                    Ok(TextRow {
                        text_id: r.get(0)?,
                        user_id: r.get(1)?,
                        filename: r.get(2)?,
                        title: r.get(3)?,
                        content: r.get(4)?,
                        char_count: r.get::<_, i64>(5)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Allocate the next version number for a text's audio. Fails once the
    /// two-digit version space is exhausted.
    pub fn next_audio_version(&self, text_id: &str) -> Result<u32, SynthError> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(version_num) FROM audios WHERE text_id = ?1",
            params![text_id],
            |r| r.get(0),
        )?;
        let next = max.unwrap_or(0) as u32 + 1;
        if next > MAX_AUDIO_VERSIONS {
            return Err(SynthError::Storage(format!(
                "audio version space exhausted for {text_id}"
            )));
        }
        Ok(next)
    }

    /// Record a freshly uploaded artifact, soft-deleting the previous live
    /// row in the same transaction so at most one live audio exists per
    /// text.
    pub fn insert_audio(&self, row: &AudioRow) -> Result<i64, SynthError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE audios SET is_deleted = 1, updated_at = ?2 WHERE text_id = ?1 AND is_deleted = 0",
            params![row.text_id, now],
        )?;
        tx.execute(
            r"
            INSERT INTO audios (text_id, user_id, filename, object_key, duration_secs,
                                size_bytes, version_num, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ",
            params![
                row.text_id,
                row.user_id,
                row.filename,
                row.object_key,
                row.duration_secs,
                row.size_bytes as i64,
                row.version_num as i64,
                now,
            ],
        )?;
        let audio_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(audio_id)
    }

    /// The single live audio for a text, if one exists.
    pub fn live_audio(&self, text_id: &str) -> Result<Option<AudioRow>, SynthError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                r"SELECT audio_id, text_id, user_id, filename, object_key, duration_secs,
                         size_bytes, version_num
                  FROM audios WHERE text_id = ?1 AND is_deleted = 0",
                params![text_id],
                |r| {
                    Ok(AudioRow {
                        audio_id: r.get(0)?,
                        text_id: r.get(1)?,
                        user_id: r.get(2)?,
                        filename: r.get(3)?,
                        object_key: r.get(4)?,
                        duration_secs: r.get(5)?,
                        size_bytes: r.get::<_, i64>(6)? as u64,
                        version_num: r.get::<_, i64>(7)? as u32,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn stats(&self) -> Result<IndexStats, SynthError> {
        let conn = self.conn.lock();
        let texts_total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM texts WHERE is_deleted = 0",
            [],
            |r| r.get(0),
        )?;
        let audios_live: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audios WHERE is_deleted = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(IndexStats {
            texts_total: texts_total as u64,
            audios_live: audios_live as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_row(text_id: &str) -> TextRow {
        TextRow {
            text_id: text_id.into(),
            user_id: "u1".into(),
            filename: format!("{text_id}.txt"),
            title: "Episode".into(),
            content: "A: hi\nB: hello".into(),
            char_count: 14,
        }
    }

    fn audio_row(text_id: &str, version: u32) -> AudioRow {
        AudioRow {
            audio_id: 0,
            text_id: text_id.into(),
            user_id: "u1".into(),
            filename: format!("{text_id}_v{version:02}.mp3"),
            object_key: format!("audio/2026/08/{text_id}_0_v{version:02}.mp3"),
            duration_secs: None,
            size_bytes: 1024,
            version_num: version,
        }
    }

    #[test]
    fn upsert_and_fetch_text() {
        let index = TaskIndex::open_in_memory().unwrap();
        index.upsert_text(&text_row("t1")).unwrap();
        let fetched = index.get_text("t1").unwrap().unwrap();
        assert_eq!(fetched.char_count, 14);

        // Re-submitting updates in place.
        let mut updated = text_row("t1");
        updated.content = "A: changed".into();
        updated.char_count = 10;
        index.upsert_text(&updated).unwrap();
        let fetched = index.get_text("t1").unwrap().unwrap();
        assert_eq!(fetched.char_count, 10);
        assert_eq!(index.stats().unwrap().texts_total, 1);
    }

    #[test]
    fn first_audio_gets_version_one() {
        let index = TaskIndex::open_in_memory().unwrap();
        index.upsert_text(&text_row("t1")).unwrap();
        assert_eq!(index.next_audio_version("t1").unwrap(), 1);
        index.insert_audio(&audio_row("t1", 1)).unwrap();
        let live = index.live_audio("t1").unwrap().unwrap();
        assert_eq!(live.version_num, 1);
    }

    #[test]
    fn new_version_soft_deletes_previous_live_audio() {
        let index = TaskIndex::open_in_memory().unwrap();
        index.upsert_text(&text_row("t1")).unwrap();
        index.insert_audio(&audio_row("t1", 1)).unwrap();
        assert_eq!(index.next_audio_version("t1").unwrap(), 2);
        index.insert_audio(&audio_row("t1", 2)).unwrap();

        let live = index.live_audio("t1").unwrap().unwrap();
        assert_eq!(live.version_num, 2);
        // Exactly one live row, even after two inserts.
        assert_eq!(index.stats().unwrap().audios_live, 1);
    }

    #[test]
    fn version_space_is_bounded() {
        let index = TaskIndex::open_in_memory().unwrap();
        index.upsert_text(&text_row("t1")).unwrap();
        let mut row = audio_row("t1", MAX_AUDIO_VERSIONS);
        row.object_key = "audio/2026/08/t1_cap.mp3".into();
        index.insert_audio(&row).unwrap();
        assert!(matches!(
            index.next_audio_version("t1"),
            Err(SynthError::Storage(_))
        ));
    }

    #[test]
    fn live_audio_absent_for_unknown_text() {
        let index = TaskIndex::open_in_memory().unwrap();
        assert!(index.live_audio("nope").unwrap().is_none());
    }

    #[test]
    fn stats_count_texts_and_live_audios() {
        let index = TaskIndex::open_in_memory().unwrap();
        index.upsert_text(&text_row("t1")).unwrap();
        index.upsert_text(&text_row("t2")).unwrap();
        index.insert_audio(&audio_row("t1", 1)).unwrap();
        let stats = index.stats().unwrap();
        assert_eq!(stats.texts_total, 2);
        assert_eq!(stats.audios_live, 1);
    }
}
