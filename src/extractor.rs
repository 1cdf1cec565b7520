//! Sliding-window n-gram extraction over a completed session.
//!
//! Every window of the expected text is classified against two independent
//! projections of the keystroke list: the speed view (shaped by the
//! [`SpeedMode`]) and the untouched as-typed view used for error detection.
//! A window ends up as at most one of speed sample, error sample or ignored.

use crate::config::EngineConfig;
use crate::error::{InvalidNgramSize, ValidationError};
use crate::ngram::{NgramKey, NgramSample, SampleKind, SpeedMode};
use crate::session::{Keystroke, Session};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use tracing::debug;

/// Why a window produced no sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    SeparatorInsideWindow,
    MissingKeystroke,
    CorrectionInsideWindow,
    MidWindowError,
    NotClean,
    NonPositiveDuration,
}

/// Outcome of classifying a single window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowClass {
    Speed { duration_ms: f64 },
    Error { duration_ms: f64 },
    Ignored(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionStats {
    pub windows: usize,
    /// Windows whose n-gram already had a sample earlier in the text.
    pub repeated: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub ignored_sizes: Vec<InvalidNgramSize>,
}

impl ExtractionStats {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub speed_samples: Vec<NgramSample>,
    pub error_samples: Vec<NgramSample>,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone, Copy)]
enum Slot<'a> {
    Missing,
    Correction,
    Key(&'a Keystroke),
}

/// Read-only mapping from text position to the keystroke that represents it.
#[derive(Debug, Clone)]
pub struct KeystrokeView<'a> {
    slots: Vec<Option<&'a Keystroke>>,
}

impl<'a> KeystrokeView<'a> {
    /// First keystroke recorded at each position, i.e. what was typed before
    /// any correction.
    pub fn as_typed(keystrokes: &'a [Keystroke], text_len: usize) -> Self {
        let mut slots = vec![None; text_len];
        for k in keystrokes {
            if let Some(slot) = slots.get_mut(k.text_index) {
                if slot.is_none() {
                    *slot = Some(k);
                }
            }
        }
        Self { slots }
    }

    /// Last keystroke recorded at each position; corrections are erased.
    pub fn net(keystrokes: &'a [Keystroke], text_len: usize) -> Self {
        let mut slots = vec![None; text_len];
        for k in keystrokes {
            if let Some(slot) = slots.get_mut(k.text_index) {
                *slot = Some(k);
            }
        }
        Self { slots }
    }

    pub fn for_mode(mode: SpeedMode, keystrokes: &'a [Keystroke], text_len: usize) -> Self {
        match mode {
            SpeedMode::Raw => Self::as_typed(keystrokes, text_len),
            SpeedMode::Net => Self::net(keystrokes, text_len),
        }
    }

    pub fn get(&self, text_index: usize) -> Option<&'a Keystroke> {
        self.slots.get(text_index).copied().flatten()
    }

    fn slot(&self, text_index: usize) -> Slot<'a> {
        match self.get(text_index) {
            None => Slot::Missing,
            Some(k) if k.actual.is_backspace() => Slot::Correction,
            Some(k) => Slot::Key(k),
        }
    }

    fn timestamp(&self, text_index: usize) -> Option<DateTime<Utc>> {
        match self.slot(text_index) {
            Slot::Key(k) => k.timestamp,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    AllCorrect,
    LastIncorrect,
    EarlierIncorrect,
}

fn correctness(view: &KeystrokeView<'_>, window: RangeInclusive<usize>) -> Result<Pattern, SkipReason> {
    let end = *window.end();
    let mut last_incorrect = false;
    for i in window {
        let k = match view.slot(i) {
            Slot::Missing => return Err(SkipReason::MissingKeystroke),
            Slot::Correction => return Err(SkipReason::CorrectionInsideWindow),
            Slot::Key(k) => k,
        };
        if !k.is_correct {
            if i == end {
                last_incorrect = true;
            } else {
                return Ok(Pattern::EarlierIncorrect);
            }
        }
    }
    Ok(if last_incorrect {
        Pattern::LastIncorrect
    } else {
        Pattern::AllCorrect
    })
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<f64> {
    (to - from)
        .num_microseconds()
        .map(|us| us as f64 / 1000.0)
}

/// Time to type `[start, start + n - 1]`.
///
/// Measured from the keystroke before the window when there is one;
/// otherwise the first-to-last span is scaled by `n / (n - 1)` to account for
/// the untimed first character.
pub fn window_duration_ms(view: &KeystrokeView<'_>, start: usize, n: usize) -> Option<f64> {
    if n < 2 {
        return None;
    }
    let end = start + n - 1;
    let end_ts = view.timestamp(end)?;

    if let Some(prev_ts) = start.checked_sub(1).and_then(|p| view.timestamp(p)) {
        return elapsed_ms(prev_ts, end_ts);
    }

    let start_ts = view.timestamp(start)?;
    let raw = elapsed_ms(start_ts, end_ts)?;
    Some((raw / (n - 1) as f64) * n as f64)
}

/// One sample per n-gram: a later window replaces the value of an earlier one
/// but keeps its position. Returns true when something was replaced.
fn keep_last(
    samples: &mut Vec<NgramSample>,
    seen: &mut HashMap<NgramKey, usize>,
    sample: NgramSample,
) -> bool {
    match seen.entry(sample.key()) {
        Entry::Occupied(slot) => {
            samples[*slot.get()] = sample;
            true
        }
        Entry::Vacant(slot) => {
            slot.insert(samples.len());
            samples.push(sample);
            false
        }
    }
}

fn positive(duration: Option<f64>) -> Option<f64> {
    duration.filter(|d| *d > 0.0)
}

pub struct Extractor<'c> {
    config: &'c EngineConfig,
}

impl<'c> Extractor<'c> {
    pub fn new(config: &'c EngineConfig) -> Self {
        Self { config }
    }

    pub fn size_range(&self) -> RangeInclusive<usize> {
        self.config.min_ngram_size..=self.config.max_ngram_size
    }

    pub fn check_size(&self, size: usize) -> Result<usize, InvalidNgramSize> {
        if self.size_range().contains(&size) {
            Ok(size)
        } else {
            Err(InvalidNgramSize {
                size,
                min: self.config.min_ngram_size,
                max: self.config.max_ngram_size,
            })
        }
    }

    pub fn validate(&self, session: &Session) -> Result<(), ValidationError> {
        if session
            .expected_text
            .chars()
            .all(|c| self.config.is_separator(c))
        {
            return Err(ValidationError::EmptyOrSeparatorOnlyText);
        }

        let text_len = session.expected_text.chars().count();
        for k in &session.keystrokes {
            if k.timestamp.is_none() {
                return Err(ValidationError::MissingOrInvalidTimestamp {
                    text_index: k.text_index,
                });
            }
            if k.text_index >= text_len {
                return Err(ValidationError::KeystrokeIndexOutOfRange {
                    text_index: k.text_index,
                    text_len,
                });
            }
        }
        Ok(())
    }

    /// Extract every configured n-gram size.
    pub fn extract(&self, session: &Session, mode: SpeedMode) -> Result<Extraction, ValidationError> {
        self.extract_sizes(session, mode, self.size_range())
    }

    /// Extract the requested sizes only. Sizes outside the configured bounds
    /// produce nothing and are listed in `stats.ignored_sizes`.
    pub fn extract_sizes(
        &self,
        session: &Session,
        mode: SpeedMode,
        sizes: impl IntoIterator<Item = usize>,
    ) -> Result<Extraction, ValidationError> {
        self.validate(session)?;

        let chars = session.expected_chars();
        let speed_view = KeystrokeView::for_mode(mode, &session.keystrokes, chars.len());
        let error_view = KeystrokeView::as_typed(&session.keystrokes, chars.len());

        let mut out = Extraction::default();
        let mut seen_speed = HashMap::new();
        let mut seen_error = HashMap::new();
        for size in sizes {
            let n = match self.check_size(size) {
                Ok(n) => n,
                Err(e) => {
                    debug!(session_id = %session.session_id, "{}", e);
                    out.stats.ignored_sizes.push(e);
                    continue;
                }
            };
            if n > chars.len() {
                continue;
            }

            for start in 0..=(chars.len() - n) {
                out.stats.windows += 1;
                let class = self.classify(&chars, start, n, &speed_view, &error_view);
                let ngram_text = || chars[start..start + n].iter().collect::<String>();

                let replaced = match class {
                    WindowClass::Speed { duration_ms } => keep_last(
                        &mut out.speed_samples,
                        &mut seen_speed,
                        NgramSample {
                            session_id: session.session_id.clone(),
                            ngram_size: n,
                            ngram_text: ngram_text(),
                            duration_ms,
                            kind: SampleKind::Speed(mode),
                        },
                    ),
                    WindowClass::Error { duration_ms } => keep_last(
                        &mut out.error_samples,
                        &mut seen_error,
                        NgramSample {
                            session_id: session.session_id.clone(),
                            ngram_size: n,
                            ngram_text: ngram_text(),
                            duration_ms,
                            kind: SampleKind::Error,
                        },
                    ),
                    WindowClass::Ignored(reason) => {
                        if reason != SkipReason::SeparatorInsideWindow {
                            debug!(
                                session_id = %session.session_id,
                                start,
                                size = n,
                                %reason,
                                "dropped window {:?}",
                                ngram_text()
                            );
                        }
                        *out.stats.skipped.entry(reason).or_insert(0) += 1;
                        false
                    }
                };
                if replaced {
                    out.stats.repeated += 1;
                }
            }
        }

        Ok(out)
    }

    /// Classify the window `[start, start + n - 1]` of `chars`.
    pub fn classify(
        &self,
        chars: &[char],
        start: usize,
        n: usize,
        speed_view: &KeystrokeView<'_>,
        error_view: &KeystrokeView<'_>,
    ) -> WindowClass {
        let end = start + n - 1;
        if chars[start..=end].iter().any(|c| self.config.is_separator(*c)) {
            return WindowClass::Ignored(SkipReason::SeparatorInsideWindow);
        }

        // An error in the as-typed view wins over a clean speed view so a
        // window is never reported as both.
        if let Ok(Pattern::LastIncorrect) = correctness(error_view, start..=end) {
            return match positive(window_duration_ms(error_view, start, n)) {
                Some(duration_ms) => WindowClass::Error { duration_ms },
                None => WindowClass::Ignored(SkipReason::NonPositiveDuration),
            };
        }

        match correctness(speed_view, start..=end) {
            Ok(Pattern::AllCorrect) => match positive(window_duration_ms(speed_view, start, n)) {
                Some(duration_ms) => WindowClass::Speed { duration_ms },
                None => WindowClass::Ignored(SkipReason::NonPositiveDuration),
            },
            Ok(Pattern::LastIncorrect) => WindowClass::Ignored(SkipReason::NotClean),
            Ok(Pattern::EarlierIncorrect) => WindowClass::Ignored(SkipReason::MidWindowError),
            Err(reason) => WindowClass::Ignored(reason),
        }
    }
}
