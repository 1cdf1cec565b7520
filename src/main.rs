use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use keygram::{
    analyze_session, analyze_session_sizes,
    config::{ConfigStore, FileConfigStore},
    store::SummaryStore,
    summary::{HeatmapCell, HeatmapSort},
    Aggregator, AnalysisReport, EngineConfig, HeatmapFilter, NgramKey, PerformanceTier, Ranking,
    Session, SpeedMode, SqliteStore, Subject, WorstBy,
};
use serde::Deserialize;
use std::{error::Error, fs, io, path::PathBuf};
use tracing_subscriber::EnvFilter;

/// n-gram typing performance analysis
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Extracts timed n-gram samples from finished typing sessions and keeps decaying-average summaries of your slowest and most error-prone character sequences."
)]
pub struct Cli {
    /// sqlite database to use (default: ~/.local/state/keygram/ngrams.db)
    #[clap(long, global = true)]
    db: Option<PathBuf>,

    /// json config file overriding the engine defaults
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// import finished sessions from a json file (one session or a list)
    Import { file: PathBuf },

    /// extract and store n-gram samples for a session
    Analyze {
        session_id: String,

        #[clap(long, value_enum, default_value_t = ModeArg::Both)]
        mode: ModeArg,

        /// only these n-gram sizes, comma separated (default: all configured sizes)
        #[clap(long, value_delimiter = ',')]
        sizes: Vec<usize>,
    },

    /// list stored session ids for a user and keyboard profile, oldest first
    Sessions {
        #[clap(flatten)]
        subject: SubjectArgs,
    },

    /// recompute decaying-average summaries for a user and keyboard profile
    Refresh {
        #[clap(flatten)]
        subject: SubjectArgs,
    },

    /// list the slowest or most error-prone n-grams
    Worst {
        #[clap(flatten)]
        subject: SubjectArgs,

        /// number of n-grams to show
        #[clap(short = 'n', long, default_value_t = 10)]
        count: usize,

        #[clap(long, value_enum, default_value_t = ByArg::Speed)]
        by: ByArg,
    },

    /// print the heatmap rows
    Heatmap {
        #[clap(flatten)]
        subject: SubjectArgs,

        #[clap(long)]
        min_size: Option<usize>,

        #[clap(long)]
        max_size: Option<usize>,

        /// only rows in this performance tier
        #[clap(long, value_enum)]
        status: Option<TierArg>,

        /// only n-grams containing this text
        #[clap(long)]
        contains: Option<String>,

        #[clap(long, default_value_t = 0)]
        min_samples: usize,

        #[clap(long, value_enum, default_value_t = SortArg::Slowest)]
        sort: SortArg,

        #[clap(long)]
        limit: Option<usize>,

        /// write csv to stdout instead of a table
        #[clap(long)]
        csv: bool,
    },

    /// show how the summary of one n-gram evolved across refreshes
    History {
        #[clap(flatten)]
        subject: SubjectArgs,

        ngram: String,
    },

    /// delete a session together with its samples
    Delete { session_id: String },
}

#[derive(Args, Debug, Clone)]
struct SubjectArgs {
    #[clap(short = 'u', long)]
    user: String,

    /// keyboard / device profile
    #[clap(short = 'k', long)]
    profile: String,
}

impl SubjectArgs {
    fn subject(&self) -> Subject {
        Subject::new(&self.user, &self.profile)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, ValueEnum, strum_macros::Display)]
enum ModeArg {
    Raw,
    Net,
    Both,
}

impl ModeArg {
    fn modes(&self) -> Vec<SpeedMode> {
        match self {
            ModeArg::Raw => vec![SpeedMode::Raw],
            ModeArg::Net => vec![SpeedMode::Net],
            ModeArg::Both => SpeedMode::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, ValueEnum, strum_macros::Display)]
enum ByArg {
    Speed,
    Error,
}

impl From<ByArg> for WorstBy {
    fn from(by: ByArg) -> Self {
        match by {
            ByArg::Speed => WorstBy::Speed,
            ByArg::Error => WorstBy::Error,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, ValueEnum, strum_macros::Display)]
enum TierArg {
    Meets,
    Amber,
    Grey,
}

impl From<TierArg> for PerformanceTier {
    fn from(t: TierArg) -> Self {
        match t {
            TierArg::Meets => PerformanceTier::MeetsTarget,
            TierArg::Amber => PerformanceTier::Amber,
            TierArg::Grey => PerformanceTier::Grey,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, ValueEnum, strum_macros::Display)]
enum SortArg {
    Slowest,
    Worst,
    Text,
}

impl From<SortArg> for HeatmapSort {
    fn from(s: SortArg) -> Self {
        match s {
            SortArg::Slowest => HeatmapSort::Slowest,
            SortArg::Worst => HeatmapSort::WorstPerformance,
            SortArg::Text => HeatmapSort::Text,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionFile {
    Many(Vec<Session>),
    One(Box<Session>),
}

impl SessionFile {
    fn into_sessions(self) -> Vec<Session> {
        match self {
            SessionFile::Many(sessions) => sessions,
            SessionFile::One(session) => vec![*session],
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("KEYGRAM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn Error>> {
    let store = match &cli.config {
        Some(path) => FileConfigStore::with_path(path),
        None => FileConfigStore::new(),
    };
    let config = store.load();
    tracing::debug!("engine config from {}", store.path().display());
    config.validate()?;
    Ok(config)
}

fn open_store(cli: &Cli) -> Result<SqliteStore, Box<dyn Error>> {
    let store = match &cli.db {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::open_default()?,
    };
    Ok(store)
}

fn print_report(report: &AnalysisReport) {
    println!(
        "{} [{}]: {} speed, {} error samples ({} windows, {} skipped)",
        report.session_id,
        report.speed_mode,
        report.speed_samples,
        report.error_samples,
        report.windows,
        report.skipped_total(),
    );
    if !report.skipped.is_empty() {
        let reasons = report
            .skipped
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .join(" ");
        println!("  skipped: {reasons}");
    }
    if !report.ignored_sizes.is_empty() {
        println!("  ignored sizes: {:?}", report.ignored_sizes);
    }
}

fn print_heatmap(cells: &[HeatmapCell], as_csv: bool) -> Result<(), Box<dyn Error>> {
    if as_csv {
        let mut wtr = csv::Writer::from_writer(io::stdout());
        for cell in cells {
            wtr.serialize(cell)?;
        }
        wtr.flush()?;
        return Ok(());
    }

    println!(
        "{:<12} {:>4} {:>10} {:>10} {:>7} {:>7}  tier",
        "ngram", "size", "avg ms", "target ms", "perf %", "samples"
    );
    for c in cells {
        println!(
            "{:<12} {:>4} {:>10.1} {:>10.1} {:>7.1} {:>7}  {}",
            format!("{:?}", c.ngram_text),
            c.ngram_size,
            c.decaying_average_ms,
            c.target_speed_ms,
            c.target_performance_pct,
            c.sample_count,
            c.tier
        );
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(cli)?;
    let mut store = open_store(cli)?;
    let aggregator = Aggregator::new(&config);

    match &cli.command {
        Command::Import { file } => {
            let bytes = fs::read(file)?;
            let sessions = serde_json::from_slice::<SessionFile>(&bytes)?.into_sessions();
            for session in &sessions {
                store.save_session(session)?;
            }
            println!("imported {} session(s)", sessions.len());
        }
        Command::Analyze {
            session_id,
            mode,
            sizes,
        } => {
            for speed_mode in mode.modes() {
                let report = if sizes.is_empty() {
                    analyze_session(&mut store, session_id, speed_mode, &config)?
                } else {
                    analyze_session_sizes(
                        &mut store,
                        session_id,
                        speed_mode,
                        &config,
                        sizes.iter().copied(),
                    )?
                };
                print_report(&report);
            }
        }
        Command::Sessions { subject } => {
            for id in store.session_ids(&subject.subject())? {
                println!("{id}");
            }
        }
        Command::Refresh { subject } => {
            let report = aggregator.refresh_summaries(&mut store, &subject.subject(), Utc::now())?;
            println!(
                "refreshed {} n-gram summaries from {} samples",
                report.keys_refreshed, report.samples_used
            );
        }
        Command::Worst { subject, count, by } => {
            let ranking =
                aggregator.rank_worst(&store, &subject.subject(), *count, (*by).into(), Utc::now())?;
            match ranking {
                Ranking::Slowest(entries) => {
                    for (i, e) in entries.iter().enumerate() {
                        println!(
                            "{:>3}. {:<12} {:>8.1} ms  ({:.0}% of target, {} samples)",
                            i + 1,
                            format!("{:?}", e.ngram_text),
                            e.decaying_average_ms,
                            e.target_performance_pct,
                            e.sample_count
                        );
                    }
                }
                Ranking::ErrorProne(counts) => {
                    for (i, c) in counts.iter().enumerate() {
                        println!(
                            "{:>3}. {:<12} {:>5} errors",
                            i + 1,
                            format!("{:?}", c.ngram_text),
                            c.count
                        );
                    }
                }
            }
        }
        Command::Heatmap {
            subject,
            min_size,
            max_size,
            status,
            contains,
            min_samples,
            sort,
            limit,
            csv,
        } => {
            let filter = HeatmapFilter {
                min_size: *min_size,
                max_size: *max_size,
                tier: status.map(Into::into),
                contains: contains.clone(),
                min_samples: *min_samples,
                sort: (*sort).into(),
                limit: *limit,
            };
            let cells = aggregator.heatmap(&store, &subject.subject(), &filter, Utc::now())?;
            print_heatmap(&cells, *csv)?;
        }
        Command::History { subject, ngram } => {
            let points = store.summary_history(&subject.subject(), &NgramKey::new(ngram.as_str()))?;
            if points.is_empty() {
                println!("no history for {ngram:?}");
            }
            for p in points {
                println!(
                    "{}  {:>8.1} ms  {:>5.1}%  ({} samples)",
                    p.recorded_at.format("%Y-%m-%d %H:%M"),
                    p.decaying_average_ms,
                    p.target_performance_pct,
                    p.sample_count
                );
            }
        }
        Command::Delete { session_id } => {
            if store.delete_session(session_id)? {
                println!("deleted {session_id}");
            } else {
                println!("no session {session_id}");
            }
        }
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let cli = Cli::parse();
    run(&cli)
}
