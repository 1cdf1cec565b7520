//! Persistence boundaries consumed by analysis and aggregation.
//!
//! The engine only talks to storage through these traits. [`SqliteStore`]
//! implements all of them; hosts with their own storage implement what they
//! need.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::ngram::{NgramKey, NgramSample, SpeedMode};
use crate::session::{Session, Subject};
use crate::summary::{HistoryPoint, SummaryEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

pub trait SessionReader {
    fn session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
}

/// Idempotent sample persistence, keyed by
/// (session, text, size, kind, speed mode).
pub trait SampleWriter {
    fn write_sample(&mut self, sample: &NgramSample) -> Result<(), StoreError>;

    /// Batched write. Backends that can should override this to persist the
    /// whole batch in one atomic round-trip; the default writes row by row
    /// and tolerates rows the backend rejects as duplicates.
    fn write_samples(&mut self, samples: &[NgramSample]) -> Result<(), StoreError> {
        for sample in samples {
            match self.write_sample(sample) {
                Err(StoreError::DuplicatePersistence) => {
                    debug!(
                        session_id = %sample.session_id,
                        "sample {:?} already persisted",
                        sample.ngram_text
                    );
                }
                other => other?,
            }
        }
        Ok(())
    }
}

/// Bounds of the history an aggregation pass looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    /// Only samples from the subject's most recent sessions count.
    pub recent_sessions: usize,
    /// Per n-gram cap on measurements.
    pub max_samples: usize,
}

/// One timed speed sample as seen by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub session_id: String,
    pub measured_at: DateTime<Utc>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub ngram_text: String,
    pub ngram_size: usize,
    pub count: u64,
}

pub trait RecentSampleReader {
    /// Distinct n-grams with speed samples in the window.
    fn speed_keys(
        &self,
        subject: &Subject,
        mode: SpeedMode,
        window: HistoryWindow,
    ) -> Result<Vec<NgramKey>, StoreError>;

    /// Most recent speed samples for one n-gram, newest first.
    fn recent_speed_samples(
        &self,
        subject: &Subject,
        key: &NgramKey,
        mode: SpeedMode,
        window: HistoryWindow,
    ) -> Result<Vec<Measurement>, StoreError>;

    /// Raw (undecayed) error sample counts per n-gram over the window.
    fn recent_error_counts(
        &self,
        subject: &Subject,
        window: HistoryWindow,
    ) -> Result<Vec<ErrorCount>, StoreError>;
}

pub trait SummaryStore {
    /// Replace the stored summary for every entry's key in one write and
    /// record a history snapshot for each. Keys not in `entries` are left
    /// untouched.
    fn replace_summaries(
        &mut self,
        subject: &Subject,
        entries: &[SummaryEntry],
    ) -> Result<(), StoreError>;

    fn summaries(&self, subject: &Subject) -> Result<Vec<SummaryEntry>, StoreError>;

    /// Snapshots for one n-gram, oldest first.
    fn summary_history(
        &self,
        subject: &Subject,
        key: &NgramKey,
    ) -> Result<Vec<HistoryPoint>, StoreError>;
}
