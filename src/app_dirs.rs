use directories::ProjectDirs;
use std::path::PathBuf;

const APP: &str = "keygram";
const DB_FILE: &str = "ngrams.db";
const CONFIG_FILE: &str = "config.json";

/// Where keygram keeps its database and config by default.
///
/// The database is state, not configuration: it follows `XDG_STATE_HOME`,
/// then `~/.local/state`, and only then the platform data dir.
pub struct AppDirs;

impl AppDirs {
    pub fn db_path() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join(DB_FILE))
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP).map(|pd| pd.config_dir().join(CONFIG_FILE))
    }

    fn state_dir() -> Option<PathBuf> {
        let env_dir = |name| {
            std::env::var_os(name)
                .map(PathBuf::from)
                .filter(|p| p.is_absolute())
        };
        state_dir_from(env_dir("XDG_STATE_HOME"), env_dir("HOME")).or_else(|| {
            ProjectDirs::from("", "", APP).map(|pd| pd.data_local_dir().to_path_buf())
        })
    }
}

fn state_dir_from(xdg_state: Option<PathBuf>, home: Option<PathBuf>) -> Option<PathBuf> {
    xdg_state
        .or_else(|| home.map(|h| h.join(".local").join("state")))
        .map(|base| base.join(APP))
}
