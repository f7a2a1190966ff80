use std::path::PathBuf;

pub const DEFAULT_MAX_IMPORT_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_ACTIVITY_RETENTION_DAYS: i64 = 90;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace opened at startup, before any `workspace.select`.
    pub workspace: Option<PathBuf>,
    /// Backups larger than this are rejected before they are read.
    pub max_import_bytes: u64,
    /// Written into snapshot metadata and the default backup file name.
    pub gym_name: String,
    /// `maintenance.optimize` prunes activities older than this.
    pub activity_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            max_import_bytes: DEFAULT_MAX_IMPORT_BYTES,
            gym_name: "Gym".to_string(),
            activity_retention_days: DEFAULT_ACTIVITY_RETENTION_DAYS,
        }
    }
}

impl Config {
    /// Unset or unparseable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace: optional_var("GYMD_WORKSPACE").map(PathBuf::from),
            max_import_bytes: optional_var("GYMD_MAX_IMPORT_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_import_bytes),
            gym_name: optional_var("GYMD_GYM_NAME").unwrap_or(defaults.gym_name),
            activity_retention_days: optional_var("GYMD_ACTIVITY_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .filter(|d: &i64| *d >= 0)
                .unwrap_or(defaults.activity_retention_days),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
