// Library surface: extraction, aggregation and the storage boundaries.
// The binary in main.rs is a thin host over these modules.
pub mod analysis;
pub mod app_dirs;
pub mod config;
pub mod error;
pub mod extractor;
pub mod ngram;
pub mod session;
pub mod store;
pub mod summary;
pub mod util;

pub use analysis::{analyze, analyze_session, analyze_session_sizes, analyze_sizes, AnalysisReport};
pub use config::EngineConfig;
pub use error::{AnalysisError, StoreError, ValidationError};
pub use extractor::{Extraction, Extractor};
pub use ngram::{NgramKey, NgramSample, SampleKind, SpeedMode};
pub use session::{KeyInput, Keystroke, Session, Subject};
pub use store::SqliteStore;
pub use summary::{Aggregator, HeatmapFilter, PerformanceTier, Ranking, SummaryEntry, WorstBy};
