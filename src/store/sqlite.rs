use crate::app_dirs::AppDirs;
use crate::error::StoreError;
use crate::ngram::{NgramKey, NgramSample, SampleKind, SpeedMode};
use crate::session::{KeyInput, Keystroke, Session, Subject};
use crate::store::{
    ErrorCount, HistoryWindow, Measurement, RecentSampleReader, SampleWriter, SessionReader,
    SummaryStore,
};
use crate::summary::{HistoryPoint, SummaryEntry};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        profile_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        expected_text TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_subject
        ON sessions(user_id, profile_id, started_at);

    CREATE TABLE IF NOT EXISTS session_keystrokes (
        session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        text_index INTEGER NOT NULL,
        timestamp TEXT,
        expected_char TEXT NOT NULL,
        actual_char TEXT,
        is_correct BOOLEAN NOT NULL,
        PRIMARY KEY (session_id, seq)
    );

    CREATE TABLE IF NOT EXISTS session_ngram_speed (
        session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        ngram_size INTEGER NOT NULL,
        ngram_text TEXT NOT NULL,
        duration_ms REAL NOT NULL,
        speed_mode TEXT NOT NULL,
        UNIQUE (session_id, ngram_text, ngram_size, speed_mode)
    );

    CREATE INDEX IF NOT EXISTS idx_ngram_speed_key
        ON session_ngram_speed(ngram_text, ngram_size, speed_mode);

    CREATE TABLE IF NOT EXISTS session_ngram_errors (
        session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        ngram_size INTEGER NOT NULL,
        ngram_text TEXT NOT NULL,
        duration_ms REAL NOT NULL,
        UNIQUE (session_id, ngram_text, ngram_size)
    );

    CREATE TABLE IF NOT EXISTS ngram_summaries (
        user_id TEXT NOT NULL,
        profile_id TEXT NOT NULL,
        ngram_text TEXT NOT NULL,
        ngram_size INTEGER NOT NULL,
        decaying_average_ms REAL NOT NULL,
        sample_count INTEGER NOT NULL,
        last_measured TEXT NOT NULL,
        target_speed_ms REAL NOT NULL,
        target_performance_pct REAL NOT NULL,
        meets_target BOOLEAN NOT NULL,
        last_updated TEXT NOT NULL,
        PRIMARY KEY (user_id, profile_id, ngram_text, ngram_size)
    );

    CREATE TABLE IF NOT EXISTS ngram_summary_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        profile_id TEXT NOT NULL,
        ngram_text TEXT NOT NULL,
        ngram_size INTEGER NOT NULL,
        decaying_average_ms REAL NOT NULL,
        target_performance_pct REAL NOT NULL,
        sample_count INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_summary_history_key
        ON ngram_summary_history(user_id, profile_id, ngram_text, ngram_size);
"#;

/// The subject's most recent sessions; `?1` user, `?2` profile, `?3` limit.
const RECENT_SESSIONS: &str = r#"
    WITH recent AS (
        SELECT session_id, started_at
        FROM sessions
        WHERE user_id = ?1 AND profile_id = ?2
        ORDER BY started_at DESC, session_id DESC
        LIMIT ?3
    )
"#;

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn char_from_sql(idx: usize, value: &str) -> rusqlite::Result<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "single character".to_string(),
            rusqlite::types::Type::Text,
        )),
    }
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryEntry> {
    Ok(SummaryEntry {
        ngram_text: row.get(0)?,
        ngram_size: row.get::<_, i64>(1)? as usize,
        decaying_average_ms: row.get(2)?,
        sample_count: row.get::<_, i64>(3)? as usize,
        last_measured: ts_from_sql(4, &row.get::<_, String>(4)?)?,
        target_speed_ms: row.get(5)?,
        target_performance_pct: row.get(6)?,
        meets_target: row.get(7)?,
        last_updated: ts_from_sql(8, &row.get::<_, String>(8)?)?,
    })
}

/// SQLite-backed implementation of every persistence boundary.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at the default state location.
    pub fn open_default() -> Result<Self, StoreError> {
        let path = AppDirs::db_path().unwrap_or_else(|| PathBuf::from("keygram.db"));
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn })
    }

    /// Store a session and its keystrokes, replacing any previous copy of the
    /// keystrokes. Samples already derived from it are kept.
    pub fn save_session(&mut self, session: &Session) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO sessions (session_id, user_id, profile_id, started_at, expected_text)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                profile_id = excluded.profile_id,
                started_at = excluded.started_at,
                expected_text = excluded.expected_text
            "#,
            params![
                session.session_id,
                session.subject.user_id,
                session.subject.profile_id,
                ts_to_sql(&session.started_at),
                session.expected_text,
            ],
        )?;
        tx.execute(
            "DELETE FROM session_keystrokes WHERE session_id = ?1",
            [&session.session_id],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO session_keystrokes
                (session_id, seq, text_index, timestamp, expected_char, actual_char, is_correct)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for (seq, k) in session.keystrokes.iter().enumerate() {
                let actual = match k.actual {
                    KeyInput::Char(c) => Some(c.to_string()),
                    KeyInput::Backspace => None,
                };
                stmt.execute(params![
                    session.session_id,
                    seq as i64,
                    k.text_index as i64,
                    k.timestamp.as_ref().map(ts_to_sql),
                    k.expected_char.to_string(),
                    actual,
                    k.is_correct,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a session together with everything derived from it.
    pub fn delete_session(&mut self, session_id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
        Ok(deleted > 0)
    }

    pub fn session_ids(&self, subject: &Subject) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id FROM sessions
            WHERE user_id = ?1 AND profile_id = ?2
            ORDER BY started_at, session_id
            "#,
        )?;
        let ids = stmt
            .query_map([&subject.user_id, &subject.profile_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Persisted samples of one session: speed samples (by mode, size, text)
    /// followed by error samples.
    pub fn samples(&self, session_id: &str) -> Result<Vec<NgramSample>, StoreError> {
        let mut out = Vec::new();

        let mut stmt = self.conn.prepare(
            r#"
            SELECT ngram_size, ngram_text, duration_ms, speed_mode
            FROM session_ngram_speed
            WHERE session_id = ?1
            ORDER BY speed_mode, ngram_size, ngram_text
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (size, text, duration_ms, mode) = row?;
            let mode = mode.parse::<SpeedMode>().map_err(StoreError::Corrupt)?;
            out.push(NgramSample {
                session_id: session_id.to_string(),
                ngram_size: size as usize,
                ngram_text: text,
                duration_ms,
                kind: SampleKind::Speed(mode),
            });
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT ngram_size, ngram_text, duration_ms
            FROM session_ngram_errors
            WHERE session_id = ?1
            ORDER BY ngram_size, ngram_text
            "#,
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(NgramSample {
                session_id: session_id.to_string(),
                ngram_size: row.get::<_, i64>(0)? as usize,
                ngram_text: row.get(1)?,
                duration_ms: row.get(2)?,
                kind: SampleKind::Error,
            })
        })?;
        for row in rows {
            out.push(row?);
        }

        Ok(out)
    }

    fn upsert_sample(tx: &Transaction<'_>, sample: &NgramSample) -> Result<(), StoreError> {
        match sample.kind {
            SampleKind::Speed(mode) => tx.execute(
                r#"
                INSERT INTO session_ngram_speed
                (session_id, ngram_size, ngram_text, duration_ms, speed_mode)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id, ngram_text, ngram_size, speed_mode)
                DO UPDATE SET duration_ms = excluded.duration_ms
                "#,
                params![
                    sample.session_id,
                    sample.ngram_size as i64,
                    sample.ngram_text,
                    sample.duration_ms,
                    mode.to_string(),
                ],
            )?,
            SampleKind::Error => tx.execute(
                r#"
                INSERT INTO session_ngram_errors
                (session_id, ngram_size, ngram_text, duration_ms)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(session_id, ngram_text, ngram_size)
                DO UPDATE SET duration_ms = excluded.duration_ms
                "#,
                params![
                    sample.session_id,
                    sample.ngram_size as i64,
                    sample.ngram_text,
                    sample.duration_ms,
                ],
            )?,
        };
        Ok(())
    }

    fn flush_samples(&mut self, samples: &[NgramSample]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for sample in samples {
            Self::upsert_sample(&tx, sample)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl SessionReader for SqliteStore {
    fn session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let header = self
            .conn
            .query_row(
                r#"
                SELECT user_id, profile_id, started_at, expected_text
                FROM sessions WHERE session_id = ?1
                "#,
                [session_id],
                |row| {
                    Ok((
                        Subject::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                        ts_from_sql(2, &row.get::<_, String>(2)?)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((subject, started_at, expected_text)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT text_index, timestamp, expected_char, actual_char, is_correct
            FROM session_keystrokes
            WHERE session_id = ?1
            ORDER BY seq
            "#,
        )?;
        let keystrokes = stmt
            .query_map([session_id], |row| {
                let timestamp = row
                    .get::<_, Option<String>>(1)?
                    .map(|s| ts_from_sql(1, &s))
                    .transpose()?;
                let actual = match row.get::<_, Option<String>>(3)? {
                    Some(s) => KeyInput::Char(char_from_sql(3, &s)?),
                    None => KeyInput::Backspace,
                };
                Ok(Keystroke {
                    text_index: row.get::<_, i64>(0)? as usize,
                    timestamp,
                    expected_char: char_from_sql(2, &row.get::<_, String>(2)?)?,
                    actual,
                    is_correct: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(Session {
            session_id: session_id.to_string(),
            subject,
            started_at,
            expected_text,
            keystrokes,
        }))
    }
}

impl SampleWriter for SqliteStore {
    fn write_sample(&mut self, sample: &NgramSample) -> Result<(), StoreError> {
        self.flush_samples(std::slice::from_ref(sample))
    }

    /// One transaction for the whole batch.
    fn write_samples(&mut self, samples: &[NgramSample]) -> Result<(), StoreError> {
        self.flush_samples(samples)
    }
}

impl RecentSampleReader for SqliteStore {
    fn speed_keys(
        &self,
        subject: &Subject,
        mode: SpeedMode,
        window: HistoryWindow,
    ) -> Result<Vec<NgramKey>, StoreError> {
        let sql = format!(
            r#"{RECENT_SESSIONS}
            SELECT DISTINCT s.ngram_text, s.ngram_size
            FROM session_ngram_speed s
            JOIN recent r ON r.session_id = s.session_id
            WHERE s.speed_mode = ?4
            ORDER BY s.ngram_size, s.ngram_text
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map(
                params![
                    subject.user_id,
                    subject.profile_id,
                    window.recent_sessions as i64,
                    mode.to_string(),
                ],
                |row| {
                    Ok(NgramKey {
                        ngram_text: row.get(0)?,
                        ngram_size: row.get::<_, i64>(1)? as usize,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn recent_speed_samples(
        &self,
        subject: &Subject,
        key: &NgramKey,
        mode: SpeedMode,
        window: HistoryWindow,
    ) -> Result<Vec<Measurement>, StoreError> {
        let sql = format!(
            r#"{RECENT_SESSIONS}
            SELECT s.session_id, r.started_at, s.duration_ms
            FROM session_ngram_speed s
            JOIN recent r ON r.session_id = s.session_id
            WHERE s.speed_mode = ?4 AND s.ngram_text = ?5 AND s.ngram_size = ?6
            ORDER BY r.started_at DESC, s.session_id DESC
            LIMIT ?7
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let measurements = stmt
            .query_map(
                params![
                    subject.user_id,
                    subject.profile_id,
                    window.recent_sessions as i64,
                    mode.to_string(),
                    key.ngram_text,
                    key.ngram_size as i64,
                    window.max_samples as i64,
                ],
                |row| {
                    Ok(Measurement {
                        session_id: row.get(0)?,
                        measured_at: ts_from_sql(1, &row.get::<_, String>(1)?)?,
                        duration_ms: row.get(2)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(measurements)
    }

    fn recent_error_counts(
        &self,
        subject: &Subject,
        window: HistoryWindow,
    ) -> Result<Vec<ErrorCount>, StoreError> {
        let sql = format!(
            r#"{RECENT_SESSIONS}
            SELECT e.ngram_text, e.ngram_size, COUNT(*)
            FROM session_ngram_errors e
            JOIN recent r ON r.session_id = e.session_id
            GROUP BY e.ngram_text, e.ngram_size
            ORDER BY e.ngram_size, e.ngram_text
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let counts = stmt
            .query_map(
                params![
                    subject.user_id,
                    subject.profile_id,
                    window.recent_sessions as i64
                ],
                |row| {
                    Ok(ErrorCount {
                        ngram_text: row.get(0)?,
                        ngram_size: row.get::<_, i64>(1)? as usize,
                        count: row.get::<_, i64>(2)? as u64,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

impl SummaryStore for SqliteStore {
    fn replace_summaries(
        &mut self,
        subject: &Subject,
        entries: &[SummaryEntry],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for e in entries {
            tx.execute(
                r#"
                INSERT INTO ngram_summaries
                (user_id, profile_id, ngram_text, ngram_size, decaying_average_ms, sample_count,
                 last_measured, target_speed_ms, target_performance_pct, meets_target, last_updated)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(user_id, profile_id, ngram_text, ngram_size) DO UPDATE SET
                    decaying_average_ms = excluded.decaying_average_ms,
                    sample_count = excluded.sample_count,
                    last_measured = excluded.last_measured,
                    target_speed_ms = excluded.target_speed_ms,
                    target_performance_pct = excluded.target_performance_pct,
                    meets_target = excluded.meets_target,
                    last_updated = excluded.last_updated
                "#,
                params![
                    subject.user_id,
                    subject.profile_id,
                    e.ngram_text,
                    e.ngram_size as i64,
                    e.decaying_average_ms,
                    e.sample_count as i64,
                    ts_to_sql(&e.last_measured),
                    e.target_speed_ms,
                    e.target_performance_pct,
                    e.meets_target,
                    ts_to_sql(&e.last_updated),
                ],
            )?;
            let previous: Option<(f64, f64, i64)> = tx
                .query_row(
                    r#"
                    SELECT decaying_average_ms, target_performance_pct, sample_count
                    FROM ngram_summary_history
                    WHERE user_id = ?1 AND profile_id = ?2 AND ngram_text = ?3 AND ngram_size = ?4
                    ORDER BY recorded_at DESC, id DESC
                    LIMIT 1
                    "#,
                    params![
                        subject.user_id,
                        subject.profile_id,
                        e.ngram_text,
                        e.ngram_size as i64
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let current = (
                e.decaying_average_ms,
                e.target_performance_pct,
                e.sample_count as i64,
            );
            // history only records changes
            if previous == Some(current) {
                continue;
            }
            tx.execute(
                r#"
                INSERT INTO ngram_summary_history
                (user_id, profile_id, ngram_text, ngram_size, decaying_average_ms,
                 target_performance_pct, sample_count, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    subject.user_id,
                    subject.profile_id,
                    e.ngram_text,
                    e.ngram_size as i64,
                    e.decaying_average_ms,
                    e.target_performance_pct,
                    e.sample_count as i64,
                    ts_to_sql(&e.last_updated),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn summaries(&self, subject: &Subject) -> Result<Vec<SummaryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ngram_text, ngram_size, decaying_average_ms, sample_count, last_measured,
                   target_speed_ms, target_performance_pct, meets_target, last_updated
            FROM ngram_summaries
            WHERE user_id = ?1 AND profile_id = ?2
            ORDER BY ngram_size, ngram_text
            "#,
        )?;
        let entries = stmt
            .query_map([&subject.user_id, &subject.profile_id], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn summary_history(
        &self,
        subject: &Subject,
        key: &NgramKey,
    ) -> Result<Vec<HistoryPoint>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT recorded_at, decaying_average_ms, target_performance_pct, sample_count
            FROM ngram_summary_history
            WHERE user_id = ?1 AND profile_id = ?2 AND ngram_text = ?3 AND ngram_size = ?4
            ORDER BY recorded_at, id
            "#,
        )?;
        let points = stmt
            .query_map(
                params![
                    subject.user_id,
                    subject.profile_id,
                    key.ngram_text,
                    key.ngram_size as i64
                ],
                |row| {
                    Ok(HistoryPoint {
                        recorded_at: ts_from_sql(0, &row.get::<_, String>(0)?)?,
                        decaying_average_ms: row.get(1)?,
                        target_performance_pct: row.get(2)?,
                        sample_count: row.get::<_, i64>(3)? as usize,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(points)
    }
}
