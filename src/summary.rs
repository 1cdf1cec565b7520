//! Decaying-average performance summaries and the ranked views built on them.
//!
//! Summaries are a derived cache: [`Aggregator::refresh_summaries`] rebuilds
//! them from persisted speed samples and can be rerun at any time.

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::ngram::NgramKey;
use crate::session::Subject;
use crate::store::{ErrorCount, HistoryWindow, Measurement, RecentSampleReader, SummaryStore};
use crate::util::weighted_mean;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PerformanceTier {
    MeetsTarget,
    Amber,
    Grey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub ngram_text: String,
    pub ngram_size: usize,
    pub decaying_average_ms: f64,
    pub sample_count: usize,
    pub last_measured: DateTime<Utc>,
    pub target_speed_ms: f64,
    pub target_performance_pct: f64,
    pub meets_target: bool,
    pub last_updated: DateTime<Utc>,
}

impl SummaryEntry {
    pub fn key(&self) -> NgramKey {
        NgramKey {
            ngram_text: self.ngram_text.clone(),
            ngram_size: self.ngram_size,
        }
    }

    pub fn tier(&self, amber_threshold_pct: f64) -> PerformanceTier {
        if self.meets_target {
            PerformanceTier::MeetsTarget
        } else if self.target_performance_pct >= amber_threshold_pct {
            PerformanceTier::Amber
        } else {
            PerformanceTier::Grey
        }
    }

    fn is_fresh(&self, fresh_since: Option<DateTime<Utc>>) -> bool {
        fresh_since.map_or(true, |cutoff| self.last_measured >= cutoff)
    }
}

/// A past value of a summary, recorded on every refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub recorded_at: DateTime<Utc>,
    pub decaying_average_ms: f64,
    pub target_performance_pct: f64,
    pub sample_count: usize,
}

/// Recency-weighted mean of the measurements.
///
/// Each measurement is weighted `decay_factor ^ days_ago`, with `days_ago`
/// taken relative to the newest measurement so it always weighs 1.0.
/// Returns the average together with the newest measurement time.
pub fn decaying_average(
    measurements: &[Measurement],
    decay_factor: f64,
) -> Option<(f64, DateTime<Utc>)> {
    let newest = measurements.iter().map(|m| m.measured_at).max()?;

    let weights: Vec<f64> = measurements
        .iter()
        .map(|m| {
            let days_ago = (newest - m.measured_at).num_milliseconds() as f64 / MS_PER_DAY;
            decay_factor.powf(days_ago)
        })
        .collect();
    let durations: Vec<f64> = measurements.iter().map(|m| m.duration_ms).collect();

    weighted_mean(&durations, &weights).map(|avg| (avg, newest))
}

/// Build the summary for one n-gram, or `None` without measurements.
pub fn summarize(
    key: &NgramKey,
    measurements: &[Measurement],
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<SummaryEntry> {
    let (avg, last_measured) = decaying_average(measurements, config.decay_factor)?;
    if avg <= 0.0 {
        return None;
    }
    let target = config.target_speed_ms(key.ngram_size);
    let meets_target = avg <= target;

    Some(SummaryEntry {
        ngram_text: key.ngram_text.clone(),
        ngram_size: key.ngram_size,
        decaying_average_ms: avg,
        sample_count: measurements.len(),
        last_measured,
        target_speed_ms: target,
        target_performance_pct: (target * 100.0 / avg).min(100.0),
        meets_target,
        last_updated: now,
    })
}

fn by_text(a: &str, a_size: usize, b: &str, b_size: usize) -> Ordering {
    a.cmp(b).then(a_size.cmp(&b_size))
}

/// Slowest first; ties by text.
pub fn slowest(
    entries: &[SummaryEntry],
    n: usize,
    fresh_since: Option<DateTime<Utc>>,
) -> Vec<SummaryEntry> {
    let mut live: Vec<SummaryEntry> = entries
        .iter()
        .filter(|e| e.is_fresh(fresh_since))
        .cloned()
        .collect();
    live.sort_by(|a, b| {
        b.decaying_average_ms
            .total_cmp(&a.decaying_average_ms)
            .then_with(|| by_text(&a.ngram_text, a.ngram_size, &b.ngram_text, b.ngram_size))
    });
    live.truncate(n);
    live
}

/// Most errors first; ties by text.
pub fn most_error_prone(mut counts: Vec<ErrorCount>, n: usize) -> Vec<ErrorCount> {
    counts.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| by_text(&a.ngram_text, a.ngram_size, &b.ngram_text, b.ngram_size))
    });
    counts.truncate(n);
    counts
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WorstBy {
    Speed,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    Slowest(Vec<SummaryEntry>),
    ErrorProne(Vec<ErrorCount>),
}

impl Ranking {
    pub fn len(&self) -> usize {
        match self {
            Ranking::Slowest(v) => v.len(),
            Ranking::ErrorProne(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapSort {
    #[default]
    Slowest,
    WorstPerformance,
    Text,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeatmapFilter {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub tier: Option<PerformanceTier>,
    pub contains: Option<String>,
    pub min_samples: usize,
    pub sort: HeatmapSort,
    pub limit: Option<usize>,
}

impl HeatmapFilter {
    fn accepts(&self, cell: &HeatmapCell) -> bool {
        self.min_size.map_or(true, |m| cell.ngram_size >= m)
            && self.max_size.map_or(true, |m| cell.ngram_size <= m)
            && self.tier.map_or(true, |t| cell.tier == t)
            && self
                .contains
                .as_deref()
                .map_or(true, |s| cell.ngram_text.contains(s))
            && cell.sample_count >= self.min_samples
    }
}

/// One heatmap row. Coloring is left to the host; `tier` carries the class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub ngram_text: String,
    pub ngram_size: usize,
    pub decaying_average_ms: f64,
    pub target_speed_ms: f64,
    pub target_performance_pct: f64,
    pub sample_count: usize,
    pub last_measured: DateTime<Utc>,
    pub tier: PerformanceTier,
}

pub fn heatmap(
    entries: &[SummaryEntry],
    filter: &HeatmapFilter,
    amber_threshold_pct: f64,
    fresh_since: Option<DateTime<Utc>>,
) -> Vec<HeatmapCell> {
    let mut cells: Vec<HeatmapCell> = entries
        .iter()
        .filter(|e| e.is_fresh(fresh_since))
        .map(|e| HeatmapCell {
            ngram_text: e.ngram_text.clone(),
            ngram_size: e.ngram_size,
            decaying_average_ms: e.decaying_average_ms,
            target_speed_ms: e.target_speed_ms,
            target_performance_pct: e.target_performance_pct,
            sample_count: e.sample_count,
            last_measured: e.last_measured,
            tier: e.tier(amber_threshold_pct),
        })
        .filter(|c| filter.accepts(c))
        .collect();

    cells.sort_by(|a, b| {
        let text = || by_text(&a.ngram_text, a.ngram_size, &b.ngram_text, b.ngram_size);
        match filter.sort {
            HeatmapSort::Slowest => b
                .decaying_average_ms
                .total_cmp(&a.decaying_average_ms)
                .then_with(text),
            HeatmapSort::WorstPerformance => a
                .target_performance_pct
                .total_cmp(&b.target_performance_pct)
                .then_with(text),
            HeatmapSort::Text => text(),
        }
    });
    if let Some(limit) = filter.limit {
        cells.truncate(limit);
    }
    cells
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub keys_refreshed: usize,
    pub samples_used: usize,
}

pub struct Aggregator<'c> {
    config: &'c EngineConfig,
}

impl<'c> Aggregator<'c> {
    pub fn new(config: &'c EngineConfig) -> Self {
        Self { config }
    }

    fn window(&self) -> HistoryWindow {
        HistoryWindow {
            recent_sessions: self.config.recent_sessions,
            max_samples: self.config.max_samples_per_ngram,
        }
    }

    fn fresh_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.config
            .freshness_days
            .map(|days| now - Duration::days(i64::from(days)))
    }

    /// Recompute every summary of `subject` from its recent speed samples.
    pub fn refresh_summaries<S>(
        &self,
        store: &mut S,
        subject: &Subject,
        now: DateTime<Utc>,
    ) -> Result<RefreshReport, StoreError>
    where
        S: RecentSampleReader + SummaryStore,
    {
        let mode = self.config.summary_speed_mode;
        let window = self.window();
        let keys = store.speed_keys(subject, mode, window)?;

        let mut report = RefreshReport::default();
        let mut entries = Vec::with_capacity(keys.len());
        for key in &keys {
            let mut measurements = store.recent_speed_samples(subject, key, mode, window)?;
            measurements.truncate(window.max_samples);
            match summarize(key, &measurements, self.config, now) {
                Some(entry) => {
                    report.samples_used += measurements.len();
                    entries.push(entry);
                }
                None => debug!(%subject, "no usable measurements for {:?}", key.ngram_text),
            }
        }
        report.keys_refreshed = entries.len();

        store.replace_summaries(subject, &entries)?;
        info!(
            %subject,
            keys = report.keys_refreshed,
            samples = report.samples_used,
            "refreshed n-gram summaries"
        );
        Ok(report)
    }

    pub fn rank_worst<S>(
        &self,
        store: &S,
        subject: &Subject,
        n: usize,
        by: WorstBy,
        now: DateTime<Utc>,
    ) -> Result<Ranking, StoreError>
    where
        S: RecentSampleReader + SummaryStore,
    {
        Ok(match by {
            WorstBy::Speed => {
                let entries = store.summaries(subject)?;
                Ranking::Slowest(slowest(&entries, n, self.fresh_since(now)))
            }
            WorstBy::Error => {
                let counts = store.recent_error_counts(subject, self.window())?;
                Ranking::ErrorProne(most_error_prone(counts, n))
            }
        })
    }

    pub fn heatmap<S: SummaryStore>(
        &self,
        store: &S,
        subject: &Subject,
        filter: &HeatmapFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<HeatmapCell>, StoreError> {
        let entries = store.summaries(subject)?;
        Ok(heatmap(
            &entries,
            filter,
            self.config.amber_threshold_pct,
            self.fresh_since(now),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::days(d)
    }

    fn m(duration_ms: f64, at: DateTime<Utc>) -> Measurement {
        Measurement {
            session_id: format!("s{}", at.timestamp()),
            measured_at: at,
            duration_ms,
        }
    }

    fn entry(text: &str, avg: f64, last_measured: DateTime<Utc>) -> SummaryEntry {
        let cfg = EngineConfig::default();
        summarize(&NgramKey::new(text), &[m(avg, last_measured)], &cfg, last_measured).unwrap()
    }

    #[test]
    fn decaying_average_weights_by_age() {
        let ms = [m(100.0, day(0)), m(200.0, day(1)), m(300.0, day(3))];
        let (avg, newest) = decaying_average(&ms, 0.9).unwrap();

        let expected = (0.729 * 100.0 + 0.81 * 200.0 + 300.0) / (0.729 + 0.81 + 1.0);
        assert!((avg - expected).abs() < 1e-9);
        assert!((avg - 210.67).abs() < 0.01);
        assert_eq!(newest, day(3));
    }

    #[test]
    fn decaying_average_ignores_order() {
        let a = [m(100.0, day(0)), m(300.0, day(3)), m(200.0, day(1))];
        let b = [m(300.0, day(3)), m(200.0, day(1)), m(100.0, day(0))];
        assert_eq!(decaying_average(&a, 0.9), decaying_average(&b, 0.9));
    }

    #[test]
    fn decaying_average_of_nothing() {
        assert_eq!(decaying_average(&[], 0.9), None);
    }

    #[test]
    fn decay_of_one_is_plain_mean() {
        let ms = [m(100.0, day(0)), m(300.0, day(9))];
        assert_eq!(decaying_average(&ms, 1.0).unwrap().0, 200.0);
    }

    #[test]
    fn summarize_against_target() {
        let cfg = EngineConfig::default();
        let key = NgramKey::new("th");
        let fast = summarize(&key, &[m(600.0, day(0))], &cfg, day(1)).unwrap();
        assert!(fast.meets_target);
        assert_eq!(fast.target_speed_ms, 1200.0);
        assert_eq!(fast.target_performance_pct, 100.0);
        assert_eq!(fast.tier(75.0), PerformanceTier::MeetsTarget);
        assert_eq!(fast.last_updated, day(1));

        let close = summarize(&key, &[m(1500.0, day(0))], &cfg, day(1)).unwrap();
        assert!(!close.meets_target);
        assert_eq!(close.target_performance_pct, 80.0);
        assert_eq!(close.tier(75.0), PerformanceTier::Amber);

        let slow = summarize(&key, &[m(2400.0, day(0))], &cfg, day(1)).unwrap();
        assert_eq!(slow.target_performance_pct, 50.0);
        assert_eq!(slow.tier(75.0), PerformanceTier::Grey);
    }

    #[test]
    fn slowest_orders_and_breaks_ties_by_text() {
        let entries = vec![
            entry("ab", 300.0, day(0)),
            entry("zz", 500.0, day(0)),
            entry("cd", 500.0, day(0)),
            entry("ef", 100.0, day(0)),
        ];
        let top: Vec<_> = slowest(&entries, 3, None)
            .into_iter()
            .map(|e| e.ngram_text)
            .collect();
        assert_eq!(top, vec!["cd", "zz", "ab"]);
    }

    #[test]
    fn slowest_drops_stale_rows() {
        let entries = vec![entry("old", 900.0, day(0)), entry("new", 200.0, day(100))];
        let top = slowest(&entries, 10, Some(day(50)));
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ngram_text, "new");
    }

    #[test]
    fn error_prone_orders_by_count() {
        let counts = vec![
            ErrorCount { ngram_text: "b".repeat(2), ngram_size: 2, count: 3 },
            ErrorCount { ngram_text: "aa".into(), ngram_size: 2, count: 3 },
            ErrorCount { ngram_text: "cc".into(), ngram_size: 2, count: 7 },
        ];
        let top: Vec<_> = most_error_prone(counts, 2)
            .into_iter()
            .map(|c| c.ngram_text)
            .collect();
        assert_eq!(top, vec!["cc", "aa"]);
    }

    #[test]
    fn heatmap_filters_and_sorts() {
        let entries = vec![
            entry("th", 600.0, day(0)),
            entry("he", 1500.0, day(0)),
            entry("the", 3000.0, day(0)),
            entry("ing", 2500.0, day(0)),
        ];

        let all = heatmap(&entries, &HeatmapFilter::default(), 75.0, None);
        let texts: Vec<_> = all.iter().map(|c| c.ngram_text.as_str()).collect();
        assert_eq!(texts, vec!["the", "ing", "he", "th"]);

        let amber = HeatmapFilter {
            tier: Some(PerformanceTier::Amber),
            ..HeatmapFilter::default()
        };
        let cells = heatmap(&entries, &amber, 75.0, None);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].ngram_text, "he");

        let trigrams = HeatmapFilter {
            min_size: Some(3),
            sort: HeatmapSort::Text,
            ..HeatmapFilter::default()
        };
        let texts: Vec<_> = heatmap(&entries, &trigrams, 75.0, None)
            .into_iter()
            .map(|c| c.ngram_text)
            .collect();
        assert_eq!(texts, vec!["ing", "the"]);

        let worst = HeatmapFilter {
            sort: HeatmapSort::WorstPerformance,
            contains: Some("h".into()),
            limit: Some(2),
            ..HeatmapFilter::default()
        };
        let texts: Vec<_> = heatmap(&entries, &worst, 75.0, None)
            .into_iter()
            .map(|c| c.ngram_text)
            .collect();
        assert_eq!(texts, vec!["the", "he"]);
    }

    #[test]
    fn heatmap_min_samples() {
        let entries = vec![entry("th", 600.0, day(0))];
        let filter = HeatmapFilter {
            min_samples: 2,
            ..HeatmapFilter::default()
        };
        assert!(heatmap(&entries, &filter, 75.0, None).is_empty());
    }
}
