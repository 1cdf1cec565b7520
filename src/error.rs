use thiserror::Error;

/// Session-level validation failures. Any of these aborts the analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("expected text is empty or contains only separators")]
    EmptyOrSeparatorOnlyText,

    #[error("keystroke at text index {text_index} has no timestamp")]
    MissingOrInvalidTimestamp { text_index: usize },

    #[error("keystroke at text index {text_index} is outside the expected text (length {text_len})")]
    KeystrokeIndexOutOfRange { text_index: usize, text_len: usize },
}

/// A requested n-gram size outside the configured bounds.
///
/// Extraction reports these sizes as ignored rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("n-gram size {size} is outside the supported range {min}..={max}")]
pub struct InvalidNgramSize {
    pub size: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    /// The backend enforces sample uniqueness and rejected a repeated write.
    #[error("sample already persisted")]
    DuplicatePersistence,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _)
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::DuplicatePersistence
            }
            other => StoreError::Sqlite(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} is malformed: {source}")]
    InvalidSession {
        session_id: String,
        #[source]
        source: ValidationError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
