// SPDX-FileCopyrightText: 2025 The fdgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::fd_cache::{PreallocationMode, DEFAULT_FILE_CACHE_SIZE};
use crate::governor::{DEFAULT_MAX_OPEN_FILES, DEFAULT_PEER_LIMIT};

const SETTINGS_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "FDGATE_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    // Files
    pub file_cache_size: usize,
    pub max_open_files: u64,
    pub preallocation: PreallocationMode,
    pub download_folder: Option<PathBuf>,

    // Networking
    pub peer_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            file_cache_size: DEFAULT_FILE_CACHE_SIZE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            preallocation: PreallocationMode::default(),
            download_folder: None,
            peer_limit: DEFAULT_PEER_LIMIT,
        }
    }
}

/// Config and data directories, created if missing.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("com", "github", "fdgate")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();
    let data_dir = proj_dirs.data_local_dir().to_path_buf();

    fs::create_dir_all(&config_dir).ok()?;
    fs::create_dir_all(&data_dir).ok()?;

    Some((config_dir, data_dir))
}

/// Loads settings from the config directory, falling back to defaults when
/// the file is missing or unreadable.
pub fn load_settings() -> Settings {
    let Some((config_dir, _)) = get_app_paths() else {
        return Settings::default();
    };

    match load_settings_from(&config_dir.join(SETTINGS_FILE)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Using default settings: {}", e);
            Settings::default()
        }
    }
}

/// File values first, then `FDGATE_*` environment overrides.
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Parse(Box::new(e)))
}

pub fn save_settings(settings: &Settings) -> Result<(), ConfigError> {
    let (config_dir, _) = get_app_paths().ok_or(ConfigError::NoAppPaths)?;
    save_settings_to(settings, &config_dir)
}

/// Writes through a temp file and rename so a crash never leaves a torn file.
pub fn save_settings_to(settings: &Settings, config_dir: &Path) -> Result<(), ConfigError> {
    let config_file_path = config_dir.join(SETTINGS_FILE);
    let temp_file_path = config_dir.join(format!("{}.tmp", SETTINGS_FILE));
    let content = toml::to_string_pretty(settings)?;
    fs::write(&temp_file_path, content)?;
    fs::rename(&temp_file_path, &config_file_path)?;
    Ok(())
}
