//! Environment of the `arforge` process.
//!
//! | Variable                   | Default                         |
//! |----------------------------|---------------------------------|
//! | `ARFORGE_DATABASE_URL`     | `sqlite://arforge.db?mode=rwc`  |
//! | `ARFORGE_STORAGE_DIR`      | `./arforge-data`                |
//! | `ARFORGE_PIPELINE_CONFIG`  | unset (built-in tool defaults)  |
//! | `ARFORGE_LOG`              | `info,sqlx=warn`                |
//! | `ARFORGE_LOG_JSON`         | `false`                         |
//! | `ARFORGE_LOG_DIR`          | unset (stderr only)             |
//!
//! Converter paths, stage timeouts and queue sizing are not environment
//! settings; they come from the pipeline TOML file.

use std::path::PathBuf;

pub const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";

/// Where assets and artifacts live, and how the run is logged.
#[derive(Debug, Clone)]
pub struct Config {
    /// Asset and job records.
    pub database_url: String,

    /// Uploaded sources and converted artifacts, addressed as `file://` URIs.
    pub storage_dir: PathBuf,

    pub pipeline_config: Option<PathBuf>,

    /// Used only when `RUST_LOG` is unset.
    pub log_level: String,

    pub log_json: bool,

    /// Adds a daily `arforge.log` next to stderr output.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: var("ARFORGE_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://arforge.db?mode=rwc".to_owned()),
            storage_dir: var("ARFORGE_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./arforge-data")),
            pipeline_config: var("ARFORGE_PIPELINE_CONFIG").map(PathBuf::from),
            log_level: var("ARFORGE_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned()),
            log_json: var("ARFORGE_LOG_JSON").is_some_and(|v| truthy(&v)),
            log_dir: var("ARFORGE_LOG_DIR").map(PathBuf::from),
        }
    }
}

/// Set and non-empty.
fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_logging_switch_accepts_common_spellings() {
        for on in ["1", "true", "TRUE", " yes ", "on"] {
            assert!(truthy(on), "{on}");
        }
        for off in ["0", "false", "no", ""] {
            assert!(!truthy(off), "{off}");
        }
    }
}
