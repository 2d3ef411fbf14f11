//! Where the beamformer keeps its files.
//!
//! ```text
//! <config dir>/mic-beamformer/settings.toml
//! <data dir>/mic-beamformer/logs/beamformer-YYYYmmdd-HHMMSS.log
//! ```
//!
//! `<config dir>` and `<data dir>` come from `dirs` (`~/.config` and
//! `~/.local/share` on Linux, `%APPDATA%` and `%LOCALAPPDATA%` on Windows,
//! `~/Library/Application Support` on macOS).  [`AppPaths::under`] roots the
//! same layout in one directory instead.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

const APP_NAME: &str = "mic-beamformer";
const SETTINGS_FILE: &str = "settings.toml";
const LOG_SUBDIR: &str = "logs";

/// Resolved settings and log-dump locations.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    config_dir: PathBuf,
    log_dir: PathBuf,
}

impl AppPaths {
    /// Platform directories, falling back to the working directory when the
    /// platform has none.
    pub fn new() -> Self {
        let base = |dir: Option<PathBuf>| dir.unwrap_or_else(|| PathBuf::from(".")).join(APP_NAME);
        Self {
            config_dir: base(dirs::config_dir()),
            log_dir: base(dirs::data_local_dir()).join(LOG_SUBDIR),
        }
    }

    /// Everything below `root`: `root/settings.toml`, `root/logs/`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.to_path_buf(),
            log_dir: root.join(LOG_SUBDIR),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Dump file for a run that ends at `at`.  One file per second, so
    /// consecutive runs do not overwrite each other.
    pub fn log_dump_file(&self, at: DateTime<Local>) -> PathBuf {
        self.log_dir
            .join(format!("beamformer-{}.log", at.format("%Y%m%d-%H%M%S")))
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn platform_paths_end_in_app_dirs() {
        let paths = AppPaths::new();
        assert!(paths.config_dir().ends_with(APP_NAME));
        assert!(paths.log_dir().ends_with(Path::new(APP_NAME).join(LOG_SUBDIR)));
        assert!(paths
            .settings_file()
            .file_name()
            .is_some_and(|n| n == SETTINGS_FILE));
    }

    #[test]
    fn dump_file_is_named_after_the_time() {
        let paths = AppPaths::under("/tmp/beam");
        let at = Local
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("unambiguous local time");
        assert_eq!(
            paths.log_dump_file(at),
            Path::new("/tmp/beam/logs/beamformer-20260304-050607.log")
        );
    }

    #[test]
    fn rooted_layout_holds_settings() {
        let dir = tempdir().expect("temp dir");
        let paths = AppPaths::under(dir.path());
        assert_eq!(paths.settings_file(), dir.path().join("settings.toml"));

        let config = crate::config::BeamformerConfig::default();
        config.save_to(&paths.settings_file()).expect("save");
        let loaded = crate::config::BeamformerConfig::load_from(&paths.settings_file()).expect("load");
        assert_eq!(loaded, config);
    }
}
