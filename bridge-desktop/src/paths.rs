//! Default on-disk locations

use std::path::PathBuf;

const APP_DIR: &str = "mpc-offline";

/// Directory holding the cache and settings databases.
///
/// Falls back to the system temp dir when the platform has no data dir.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

pub fn default_cache_db_path() -> PathBuf {
    default_data_dir().join("offline-cache.db")
}

pub fn default_settings_db_path() -> PathBuf {
    default_data_dir().join("settings.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_data_dir() {
        let dir = default_data_dir();
        assert!(dir.ends_with(APP_DIR));
        assert_eq!(default_cache_db_path().parent(), Some(dir.as_path()));
        assert_eq!(default_settings_db_path().parent(), Some(dir.as_path()));
    }
}
