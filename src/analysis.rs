use crate::config::EngineConfig;
use crate::error::{AnalysisError, StoreError};
use crate::extractor::{Extraction, Extractor, SkipReason};
use crate::ngram::{NgramSample, SpeedMode};
use crate::session::Session;
use crate::store::{SampleWriter, SessionReader};
use crate::util::mean;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// What one analysis run produced, for the host to show or log.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub session_id: String,
    pub speed_mode: SpeedMode,
    pub speed_samples: usize,
    pub error_samples: usize,
    pub windows: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub ignored_sizes: Vec<usize>,
    pub mean_speed_ms: Option<f64>,
}

impl AnalysisReport {
    fn from_extraction(session_id: &str, mode: SpeedMode, extraction: &Extraction) -> Self {
        let durations: Vec<f64> = extraction
            .speed_samples
            .iter()
            .map(|s| s.duration_ms)
            .collect();
        Self {
            session_id: session_id.to_string(),
            speed_mode: mode,
            speed_samples: extraction.speed_samples.len(),
            error_samples: extraction.error_samples.len(),
            windows: extraction.stats.windows,
            skipped: extraction.stats.skipped.clone(),
            ignored_sizes: extraction
                .stats
                .ignored_sizes
                .iter()
                .map(|e| e.size)
                .collect(),
            mean_speed_ms: mean(&durations),
        }
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

/// Extract a loaded session and persist the result in a single batch.
///
/// Nothing is written when validation fails. A backend that rejects the
/// batch as already persisted is treated as success.
pub fn analyze<W: SampleWriter>(
    writer: &mut W,
    session: &Session,
    mode: SpeedMode,
    config: &EngineConfig,
) -> Result<AnalysisReport, AnalysisError> {
    let sizes = config.min_ngram_size..=config.max_ngram_size;
    analyze_sizes(writer, session, mode, config, sizes)
}

/// Like [`analyze`] for the requested n-gram sizes only. Sizes outside the
/// configured bounds are listed in the report instead of failing the run.
pub fn analyze_sizes<W: SampleWriter>(
    writer: &mut W,
    session: &Session,
    mode: SpeedMode,
    config: &EngineConfig,
    sizes: impl IntoIterator<Item = usize>,
) -> Result<AnalysisReport, AnalysisError> {
    config.validate()?;

    let extraction = Extractor::new(config)
        .extract_sizes(session, mode, sizes)
        .map_err(|source| AnalysisError::InvalidSession {
            session_id: session.session_id.clone(),
            source,
        })?;

    let batch: Vec<NgramSample> = extraction
        .speed_samples
        .iter()
        .chain(&extraction.error_samples)
        .cloned()
        .collect();

    match writer.write_samples(&batch) {
        Ok(()) => {}
        Err(StoreError::DuplicatePersistence) => {
            warn!(session_id = %session.session_id, "samples already persisted");
        }
        Err(e) => return Err(e.into()),
    }

    let report = AnalysisReport::from_extraction(&session.session_id, mode, &extraction);
    info!(
        session_id = %report.session_id,
        mode = %mode,
        speed = report.speed_samples,
        errors = report.error_samples,
        skipped = report.skipped_total(),
        "analysed session"
    );
    Ok(report)
}

/// Load a session by id, analyse it and persist the samples.
pub fn analyze_session<S: SessionReader + SampleWriter>(
    store: &mut S,
    session_id: &str,
    mode: SpeedMode,
    config: &EngineConfig,
) -> Result<AnalysisReport, AnalysisError> {
    let sizes = config.min_ngram_size..=config.max_ngram_size;
    analyze_session_sizes(store, session_id, mode, config, sizes)
}

pub fn analyze_session_sizes<S: SessionReader + SampleWriter>(
    store: &mut S,
    session_id: &str,
    mode: SpeedMode,
    config: &EngineConfig,
    sizes: impl IntoIterator<Item = usize>,
) -> Result<AnalysisReport, AnalysisError> {
    let session = store
        .session(session_id)?
        .ok_or_else(|| AnalysisError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
    analyze_sizes(store, &session, mode, config, sizes)
}
