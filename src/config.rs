//! Runtime configuration shared by the workers, publisher and web layer.
//!
//! Constructed once in main and passed around explicitly; nothing in this
//! crate reads process-global state.

use std::path::PathBuf;

/// Number of numeric stats carried by raiders and gear items
pub const STAT_COUNT: usize = 6;

/// Stat column names, in schema order
pub const STAT_NAMES: [&str; STAT_COUNT] = [
    "strength",
    "intelligence",
    "agility",
    "wisdom",
    "charm",
    "luck",
];

/// Gear slot classifications
pub const SLOTS: [&str; 4] = ["main_hand", "dress", "knickknack", "finger"];

/// Fixed-length stat vector, ordered as [`STAT_NAMES`]
pub type StatVec = [i64; STAT_COUNT];

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for working database files and latest.json
    pub work_dir: PathBuf,
    /// Directory where published snapshots are written
    pub www_dir: PathBuf,
    /// URL path prefix under which the snapshot directory is served
    pub base_url_path: String,
    /// Base URL of the game REST API
    pub api_url: String,
    /// Base URL of the private inventory API
    pub inventory_url: String,
    /// API key for the game REST API
    pub game_api_key: Option<String>,
}

impl Config {
    /// Default working directory: ~/.local/share/raider_sync
    pub fn default_work_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("raider_sync")
    }

    /// Path of the persisted latest-snapshot pointer
    pub fn latest_path(&self) -> PathBuf {
        self.work_dir.join("latest.json")
    }

    /// Scratch file the rebuild worker builds into
    pub fn rebuild_db_path(&self) -> PathBuf {
        self.work_dir.join("new.sqlite")
    }

    /// Handoff slot: a finished rebuild lands here for the update worker
    pub fn pending_base_path(&self) -> PathBuf {
        self.work_dir.join("new-base-db.sqlite")
    }

    /// Working file of the update worker
    pub fn update_base_path(&self) -> PathBuf {
        self.work_dir.join("update-base.sqlite")
    }
}

/// Test fixture: a config rooted in a temporary directory
#[cfg(test)]
pub fn test_config(dir: &std::path::Path) -> Config {
    Config {
        work_dir: dir.join("work"),
        www_dir: dir.join("www"),
        base_url_path: "/db".to_string(),
        api_url: "http://127.0.0.1:0".to_string(),
        inventory_url: "http://127.0.0.1:0".to_string(),
        game_api_key: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_names_match_stat_count() {
        assert_eq!(STAT_NAMES.len(), STAT_COUNT);
    }

    #[test]
    fn work_dir_paths_are_distinct() {
        let cfg = test_config(std::path::Path::new("/tmp/x"));
        let paths = [
            cfg.latest_path(),
            cfg.rebuild_db_path(),
            cfg.pending_base_path(),
            cfg.update_base_path(),
        ];
        for (i, a) in paths.iter().enumerate() {
            for b in paths.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
