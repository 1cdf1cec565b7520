use chrono::{DateTime, Duration, TimeZone, Utc};
use keygram::store::SummaryStore;
use keygram::summary::{HeatmapSort, RefreshReport};
use keygram::{
    analyze_session, Aggregator, EngineConfig, HeatmapFilter, Keystroke, NgramKey,
    PerformanceTier, Ranking, Session, SpeedMode, SqliteStore, Subject, WorstBy,
};

fn day(d: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap() + Duration::days(d)
}

fn me() -> Subject {
    Subject::new("ana", "ergo")
}

fn session_on(id: &str, started_at: DateTime<Utc>, typed: &str, gap_ms: i64) -> Session {
    let text = "the cat";
    Session {
        session_id: id.to_string(),
        subject: me(),
        started_at,
        expected_text: text.to_string(),
        keystrokes: text
            .chars()
            .zip(typed.chars())
            .enumerate()
            .map(|(i, (e, a))| {
                Keystroke::typed(i, started_at + Duration::milliseconds(i as i64 * gap_ms), e, a)
            })
            .collect(),
    }
}

/// A quick session one day before a slow one.
fn seeded_store(cfg: &EngineConfig) -> SqliteStore {
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .save_session(&session_on("fast", day(0), "the cat", 100))
        .unwrap();
    store
        .save_session(&session_on("slow", day(1), "the cat", 2000))
        .unwrap();
    for id in ["fast", "slow"] {
        analyze_session(&mut store, id, SpeedMode::Raw, cfg).unwrap();
    }
    store
}

#[test]
fn refresh_builds_decayed_summaries() {
    let cfg = EngineConfig::default();
    let mut store = seeded_store(&cfg);
    let aggregator = Aggregator::new(&cfg);

    let report = aggregator
        .refresh_summaries(&mut store, &me(), day(1))
        .unwrap();
    assert_eq!(
        report,
        RefreshReport {
            keys_refreshed: 6,
            samples_used: 12,
        }
    );

    let summaries = store.summaries(&me()).unwrap();
    let th = summaries.iter().find(|e| e.ngram_text == "th").unwrap();
    // (0.9 * 200 + 1.0 * 4000) / 1.9
    assert!((th.decaying_average_ms - 2200.0).abs() < 1e-6);
    assert_eq!(th.sample_count, 2);
    assert_eq!(th.target_speed_ms, 1200.0);
    assert!(!th.meets_target);
    assert_eq!(th.last_measured, day(1));
    assert_eq!(th.tier(cfg.amber_threshold_pct), PerformanceTier::Grey);
}

#[test]
fn slowest_ranking_breaks_ties_by_text() {
    let cfg = EngineConfig::default();
    let mut store = seeded_store(&cfg);
    let aggregator = Aggregator::new(&cfg);
    aggregator
        .refresh_summaries(&mut store, &me(), day(1))
        .unwrap();

    let ranking = aggregator
        .rank_worst(&store, &me(), 3, WorstBy::Speed, day(1))
        .unwrap();
    let Ranking::Slowest(entries) = ranking else {
        panic!("expected a speed ranking");
    };
    let texts: Vec<&str> = entries.iter().map(|e| e.ngram_text.as_str()).collect();
    assert_eq!(texts, vec!["cat", "the", "at"]);
}

#[test]
fn stale_summaries_drop_out_of_views() {
    let cfg = EngineConfig::default();
    let mut store = seeded_store(&cfg);
    let aggregator = Aggregator::new(&cfg);
    aggregator
        .refresh_summaries(&mut store, &me(), day(1))
        .unwrap();

    let later = day(200);
    let ranking = aggregator
        .rank_worst(&store, &me(), 10, WorstBy::Speed, later)
        .unwrap();
    assert!(ranking.is_empty());
    let cells = aggregator
        .heatmap(&store, &me(), &HeatmapFilter::default(), later)
        .unwrap();
    assert!(cells.is_empty());
    // still cached
    assert_eq!(store.summaries(&me()).unwrap().len(), 6);

    let keep_all = EngineConfig {
        freshness_days: None,
        ..EngineConfig::default()
    };
    let ranking = Aggregator::new(&keep_all)
        .rank_worst(&store, &me(), 10, WorstBy::Speed, later)
        .unwrap();
    assert_eq!(ranking.len(), 6);
}

#[test]
fn heatmap_filters_and_sorts() {
    let cfg = EngineConfig::default();
    let mut store = seeded_store(&cfg);
    let aggregator = Aggregator::new(&cfg);
    aggregator
        .refresh_summaries(&mut store, &me(), day(1))
        .unwrap();

    let filter = HeatmapFilter {
        min_size: Some(3),
        sort: HeatmapSort::Text,
        ..HeatmapFilter::default()
    };
    let cells = aggregator.heatmap(&store, &me(), &filter, day(1)).unwrap();
    let texts: Vec<&str> = cells.iter().map(|c| c.ngram_text.as_str()).collect();
    assert_eq!(texts, vec!["cat", "the"]);

    let filter = HeatmapFilter {
        contains: Some("a".into()),
        tier: Some(PerformanceTier::Grey),
        limit: Some(1),
        ..HeatmapFilter::default()
    };
    let cells = aggregator.heatmap(&store, &me(), &filter, day(1)).unwrap();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].ngram_text, "cat");
}

#[test]
fn error_ranking_counts_recent_mistakes() {
    let cfg = EngineConfig::default();
    let mut store = SqliteStore::open_in_memory().unwrap();
    store
        .save_session(&session_on("a", day(0), "thr cat", 150))
        .unwrap();
    store
        .save_session(&session_on("b", day(1), "thr cst", 150))
        .unwrap();
    for id in ["a", "b"] {
        analyze_session(&mut store, id, SpeedMode::Raw, &cfg).unwrap();
    }

    let ranking = Aggregator::new(&cfg)
        .rank_worst(&store, &me(), 2, WorstBy::Error, day(1))
        .unwrap();
    let Ranking::ErrorProne(counts) = ranking else {
        panic!("expected an error ranking");
    };
    let top: Vec<(&str, u64)> = counts
        .iter()
        .map(|c| (c.ngram_text.as_str(), c.count))
        .collect();
    assert_eq!(top, vec![("he", 2), ("the", 2)]);
}

#[test]
fn history_grows_only_when_summaries_change() {
    let cfg = EngineConfig::default();
    let mut store = seeded_store(&cfg);
    let aggregator = Aggregator::new(&cfg);

    aggregator
        .refresh_summaries(&mut store, &me(), day(1))
        .unwrap();
    aggregator
        .refresh_summaries(&mut store, &me(), day(2))
        .unwrap();
    let th = NgramKey::new("th");
    assert_eq!(store.summary_history(&me(), &th).unwrap().len(), 1);

    store
        .save_session(&session_on("again", day(2), "the cat", 100))
        .unwrap();
    analyze_session(&mut store, "again", SpeedMode::Raw, &cfg).unwrap();
    aggregator
        .refresh_summaries(&mut store, &me(), day(3))
        .unwrap();

    let history = store.summary_history(&me(), &th).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].recorded_at, day(1));
    assert_eq!(history[0].sample_count, 2);
    assert_eq!(history[1].recorded_at, day(3));
    assert_eq!(history[1].sample_count, 3);
    assert!(history[1].decaying_average_ms < history[0].decaying_average_ms);
}

#[test]
fn other_subjects_are_not_mixed_in() {
    let cfg = EngineConfig::default();
    let mut store = seeded_store(&cfg);
    let aggregator = Aggregator::new(&cfg);
    let stranger = Subject::new("bo", "ergo");

    let report = aggregator
        .refresh_summaries(&mut store, &stranger, day(1))
        .unwrap();
    assert_eq!(report.keys_refreshed, 0);
    assert!(store.summaries(&stranger).unwrap().is_empty());
}
