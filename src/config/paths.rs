//! Platform-specific configuration and data paths.

use crate::constants::{APP_NAME, DATABASE_FILE_NAME};
use crate::error::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the configuration directory for the current platform.
///
/// - Linux: `~/.config/wildid/`
/// - macOS: `~/Library/Application Support/wildid/`
/// - Windows: `%APPDATA%\wildid\`
pub fn config_dir() -> Result<PathBuf> {
    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or(Error::ConfigDirNotFound)
}

/// Get the full path to the config file.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Get the data directory for the current platform.
///
/// - Linux: `~/.local/share/wildid/`
/// - macOS: `~/Library/Application Support/wildid/`
/// - Windows: `%APPDATA%\wildid\data\`
pub fn data_dir() -> Result<PathBuf> {
    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(Error::DataDirNotFound)
}

/// Resolve the database path: explicit setting first, then the data directory.
pub fn database_path(configured: Option<&std::path::Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(data_dir()?.join(DATABASE_FILE_NAME)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_config_dir_returns_path() {
        let path = config_dir().unwrap();
        assert!(path.to_string_lossy().contains("wildid"));
    }

    #[test]
    fn test_config_file_path_ends_with_toml() {
        let path = config_file_path().unwrap();
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_database_path_prefers_configured() {
        let path = database_path(Some(Path::new("/srv/wildid/ids.sqlite3"))).unwrap();
        assert_eq!(path, PathBuf::from("/srv/wildid/ids.sqlite3"));
    }

    #[test]
    fn test_database_path_defaults_to_data_dir() {
        let path = database_path(None).unwrap();
        assert!(path.to_string_lossy().ends_with("wildid.sqlite3"));
    }
}
