//! Process configuration read from the environment

use crate::error::{AppError, Result};
use std::path::PathBuf;

/// Data directory override
pub const DATA_DIR_VAR: &str = "SESSION_GRADER_DATA_DIR";

/// Explicit database file override
pub const DB_PATH_VAR: &str = "SESSION_GRADER_DB";

const DEFAULT_DATA_DIR: &str = "./data";
const DB_FILE_NAME: &str = "sessions.db";

/// Where the engine keeps its state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl EngineConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup(DATA_DIR_VAR) {
            Some(dir) if dir.trim().is_empty() => {
                return Err(AppError::Config(format!("{} is set but empty", DATA_DIR_VAR)));
            }
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(DEFAULT_DATA_DIR),
        };

        let db_path = match lookup(DB_PATH_VAR) {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => data_dir.join(DB_FILE_NAME),
        };

        Ok(Self { data_dir, db_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.db_path, PathBuf::from("./data").join("sessions.db"));
    }

    #[test]
    fn test_data_dir_and_db_override() {
        let config = EngineConfig::from_lookup(lookup(&[(DATA_DIR_VAR, "/var/lib/grader")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/grader/sessions.db"));

        let config = EngineConfig::from_lookup(lookup(&[
            (DATA_DIR_VAR, "/var/lib/grader"),
            (DB_PATH_VAR, "/tmp/other.db"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_empty_data_dir_rejected() {
        let result = EngineConfig::from_lookup(lookup(&[(DATA_DIR_VAR, "  ")]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
