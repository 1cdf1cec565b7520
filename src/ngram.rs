use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const MIN_NGRAM_SIZE: usize = 2;
pub const MAX_NGRAM_SIZE: usize = 20;

/// How keystrokes are preprocessed before speed windows are timed.
///
/// `Raw` keeps every keystroke as typed, `Net` keeps only the final
/// keystroke recorded at each text position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SpeedMode {
    Raw,
    Net,
}

impl SpeedMode {
    pub const ALL: [SpeedMode; 2] = [SpeedMode::Raw, SpeedMode::Net];
}

impl FromStr for SpeedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(SpeedMode::Raw),
            "net" => Ok(SpeedMode::Net),
            other => Err(format!("unknown speed mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Speed(SpeedMode),
    Error,
}

/// Text and size of an n-gram; the grouping key for summaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NgramKey {
    pub ngram_text: String,
    pub ngram_size: usize,
}

impl NgramKey {
    pub fn new(ngram_text: impl Into<String>) -> Self {
        let ngram_text = ngram_text.into();
        let ngram_size = ngram_text.chars().count();
        Self {
            ngram_text,
            ngram_size,
        }
    }
}

/// One timed n-gram window produced by analysing a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NgramSample {
    pub session_id: String,
    pub ngram_size: usize,
    /// Always the expected text, also for error samples.
    pub ngram_text: String,
    pub duration_ms: f64,
    pub kind: SampleKind,
}

impl NgramSample {
    pub fn key(&self) -> NgramKey {
        NgramKey {
            ngram_text: self.ngram_text.clone(),
            ngram_size: self.ngram_size,
        }
    }

    pub fn speed_mode(&self) -> Option<SpeedMode> {
        match self.kind {
            SampleKind::Speed(mode) => Some(mode),
            SampleKind::Error => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == SampleKind::Error
    }
}
