use chrono::{DateTime, Duration, TimeZone, Utc};
use keygram::extractor::SkipReason;
use keygram::{
    analyze, analyze_session, AnalysisError, EngineConfig, Extractor, Keystroke, SampleKind,
    Session, SpeedMode, SqliteStore, Subject,
};

fn at(ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
}

// Every position typed once, `gap_ms` apart.
fn steady_session(id: &str, text: &str, typed: &str, gap_ms: i64) -> Session {
    Session {
        session_id: id.to_string(),
        subject: Subject::new("ana", "laptop"),
        started_at: at(0),
        expected_text: text.to_string(),
        keystrokes: text
            .chars()
            .zip(typed.chars())
            .enumerate()
            .map(|(i, (e, a))| Keystroke::typed(i, at(i as i64 * gap_ms), e, a))
            .collect(),
    }
}

#[test]
fn clean_session_yields_word_internal_windows_only() {
    let cfg = EngineConfig::default();
    let session = steady_session("s1", "the cat", "the cat", 100);

    let out = Extractor::new(&cfg).extract(&session, SpeedMode::Raw).unwrap();

    let mut found: Vec<(String, f64)> = out
        .speed_samples
        .iter()
        .map(|s| (s.ngram_text.clone(), s.duration_ms))
        .collect();
    found.sort_by(|a, b| a.0.cmp(&b.0));

    // steady typing: every window lasts n * gap, grossed up or not
    assert_eq!(
        found,
        vec![
            ("at".to_string(), 200.0),
            ("ca".to_string(), 200.0),
            ("cat".to_string(), 300.0),
            ("he".to_string(), 200.0),
            ("th".to_string(), 200.0),
            ("the".to_string(), 300.0),
        ]
    );
    assert!(out.error_samples.is_empty());
    assert!(out.stats.skipped_for(SkipReason::SeparatorInsideWindow) > 0);
    assert!(!found.iter().any(|(t, _)| t.contains(' ')));
}

#[test]
fn extraction_is_deterministic() {
    let cfg = EngineConfig::default();
    let session = steady_session("s1", "quick brown", "quock brown", 120);
    let extractor = Extractor::new(&cfg);

    for mode in SpeedMode::ALL {
        let a = extractor.extract(&session, mode).unwrap();
        let b = extractor.extract(&session, mode).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn separated_characters_produce_nothing() {
    let cfg = EngineConfig::default();
    let session = steady_session("s1", "a b", "a b", 100);

    let out = Extractor::new(&cfg).extract(&session, SpeedMode::Net).unwrap();

    assert!(out.speed_samples.is_empty());
    assert!(out.error_samples.is_empty());
    assert_eq!(out.stats.skipped_for(SkipReason::SeparatorInsideWindow), 3);
}

#[test]
fn windows_are_never_both_speed_and_error() {
    let cfg = EngineConfig::default();
    let session = steady_session("s1", "tank tops", "tanl topa", 90);

    let out = Extractor::new(&cfg).extract(&session, SpeedMode::Raw).unwrap();

    for e in &out.error_samples {
        assert!(!out
            .speed_samples
            .iter()
            .any(|s| s.ngram_text == e.ngram_text && s.ngram_size == e.ngram_size));
    }
    let errors: Vec<&str> = out
        .error_samples
        .iter()
        .map(|s| s.ngram_text.as_str())
        .collect();
    assert!(errors.contains(&"tank"));
    assert!(errors.contains(&"tops"));
}

#[test]
fn analysis_round_trips_through_sqlite() {
    let cfg = EngineConfig::default();
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .save_session(&steady_session("s1", "the cat", "thr cat", 150))
        .unwrap();

    let raw = analyze_session(&mut store, "s1", SpeedMode::Raw, &cfg).unwrap();
    let net = analyze_session(&mut store, "s1", SpeedMode::Net, &cfg).unwrap();
    // again, to prove nothing piles up
    analyze_session(&mut store, "s1", SpeedMode::Raw, &cfg).unwrap();

    let stored = store.samples("s1").unwrap();
    let speed_raw = stored
        .iter()
        .filter(|s| s.kind == SampleKind::Speed(SpeedMode::Raw))
        .count();
    let speed_net = stored
        .iter()
        .filter(|s| s.kind == SampleKind::Speed(SpeedMode::Net))
        .count();
    let errors = stored.iter().filter(|s| s.is_error()).count();

    assert_eq!(speed_raw, raw.speed_samples);
    assert_eq!(speed_net, net.speed_samples);
    assert_eq!(errors, raw.error_samples);
}

#[test]
fn repeated_ngrams_are_counted_once() {
    let cfg = EngineConfig::default();
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .save_session(&steady_session("s1", "the then", "the then", 100))
        .unwrap();

    let report = analyze_session(&mut store, "s1", SpeedMode::Raw, &cfg).unwrap();
    let stored = store.samples("s1").unwrap();

    // th, he, the show up in both words
    assert_eq!(report.speed_samples, 6);
    assert_eq!(report.error_samples, 0);
    assert_eq!(stored.len(), report.speed_samples + report.error_samples);
}

#[test]
fn deleting_a_session_removes_its_samples() {
    let cfg = EngineConfig::default();
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .save_session(&steady_session("s1", "the cat", "the cat", 100))
        .unwrap();
    analyze_session(&mut store, "s1", SpeedMode::Raw, &cfg).unwrap();
    assert!(!store.samples("s1").unwrap().is_empty());

    assert!(store.delete_session("s1").unwrap());
    assert!(store.samples("s1").unwrap().is_empty());
    assert!(matches!(
        analyze_session(&mut store, "s1", SpeedMode::Raw, &cfg),
        Err(AnalysisError::SessionNotFound { .. })
    ));
}

#[test]
fn separator_only_text_is_rejected() {
    let cfg = EngineConfig::default();
    let mut store = SqliteStore::open_in_memory().unwrap();
    let session = steady_session("blank", "   ", "   ", 100);

    assert!(matches!(
        analyze(&mut store, &session, SpeedMode::Raw, &cfg),
        Err(AnalysisError::InvalidSession { .. })
    ));
}
