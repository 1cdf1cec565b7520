use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The (user, device profile) pair performance summaries are scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: String,
    pub profile_id: String,
}

impl Subject {
    pub fn new(user_id: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            profile_id: profile_id.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.profile_id)
    }
}

/// What the typist actually pressed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyInput {
    Char(char),
    Backspace,
}

impl KeyInput {
    pub fn is_backspace(&self) -> bool {
        matches!(self, KeyInput::Backspace)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Keystroke {
    pub text_index: usize,
    /// `None` marks a keystroke recorded without a usable timestamp; such
    /// sessions are rejected by validation.
    pub timestamp: Option<DateTime<Utc>>,
    pub expected_char: char,
    pub actual: KeyInput,
    pub is_correct: bool,
}

impl Keystroke {
    pub fn typed(
        text_index: usize,
        timestamp: DateTime<Utc>,
        expected_char: char,
        actual_char: char,
    ) -> Self {
        Self {
            text_index,
            timestamp: Some(timestamp),
            expected_char,
            actual: KeyInput::Char(actual_char),
            is_correct: expected_char == actual_char,
        }
    }

    pub fn backspace(text_index: usize, timestamp: DateTime<Utc>, expected_char: char) -> Self {
        Self {
            text_index,
            timestamp: Some(timestamp),
            expected_char,
            actual: KeyInput::Backspace,
            is_correct: false,
        }
    }
}

/// A completed typing session. Read-only as far as analysis is concerned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject: Subject,
    pub started_at: DateTime<Utc>,
    pub expected_text: String,
    /// Ordered as recorded. Analysis maps them onto text positions by
    /// `text_index` and never assumes timestamps are sorted.
    pub keystrokes: Vec<Keystroke>,
}

impl Session {
    pub fn expected_chars(&self) -> Vec<char> {
        self.expected_text.chars().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn typed_keystroke_correctness() {
        let ts = Utc.timestamp_millis_opt(0).unwrap();
        assert!(Keystroke::typed(0, ts, 'a', 'a').is_correct);
        assert!(!Keystroke::typed(0, ts, 'a', 's').is_correct);
    }

    #[test]
    fn backspace_is_never_correct() {
        let ts = Utc.timestamp_millis_opt(0).unwrap();
        let k = Keystroke::backspace(3, ts, 'x');
        assert!(k.actual.is_backspace());
        assert!(!k.is_correct);
    }

    #[test]
    fn key_input_json_shape() {
        let json = serde_json::to_string(&KeyInput::Char('q')).unwrap();
        assert_eq!(json, r#"{"char":"q"}"#);
        let json = serde_json::to_string(&KeyInput::Backspace).unwrap();
        assert_eq!(json, r#""backspace""#);
    }

    #[test]
    fn subject_display() {
        assert_eq!(Subject::new("u1", "kb").to_string(), "u1/kb");
    }
}
