use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_EMBEDDING_DIM: usize = 128;
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.80;
const DEFAULT_EXTRACT_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl BusKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "session" => Some(Self::Session),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Daemon configuration: defaults, then the TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Embedding length every stored vector must have.
    pub embedding_dim: usize,
    /// Minimum cosine similarity for a probe to resolve to a student.
    pub similarity_threshold: f32,
    /// Per-image limit on a single extraction call.
    pub extract_timeout: Duration,
    /// Treat exports with zero records as an error instead of a header-only file.
    pub reject_empty_export: bool,
    pub bus: BusKind,
}

/// Keys accepted in the TOML file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    embedding_dim: Option<usize>,
    similarity_threshold: Option<f32>,
    extract_timeout_secs: Option<u64>,
    reject_empty_export: Option<bool>,
    bus: Option<BusKind>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => read_file(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("rollcall.db"));

        let mut similarity_threshold = parsed(&env, "ROLLCALL_SIMILARITY_THRESHOLD")
            .or(file.similarity_threshold)
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        if !(similarity_threshold > 0.0 && similarity_threshold <= 1.0) {
            tracing::warn!(
                value = similarity_threshold,
                default = DEFAULT_SIMILARITY_THRESHOLD,
                "similarity threshold outside (0, 1]; using default"
            );
            similarity_threshold = DEFAULT_SIMILARITY_THRESHOLD;
        }

        let extract_timeout_secs = parsed(&env, "ROLLCALL_EXTRACT_TIMEOUT_SECS")
            .or(file.extract_timeout_secs)
            .unwrap_or(DEFAULT_EXTRACT_TIMEOUT_SECS);

        Self {
            db_path,
            embedding_dim: parsed(&env, "ROLLCALL_EMBEDDING_DIM")
                .or(file.embedding_dim)
                .filter(|&d| d > 0)
                .unwrap_or(DEFAULT_EMBEDDING_DIM),
            similarity_threshold,
            extract_timeout: Duration::from_secs(extract_timeout_secs),
            reject_empty_export: env("ROLLCALL_REJECT_EMPTY_EXPORT")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.reject_empty_export)
                .unwrap_or(false),
            bus: env("ROLLCALL_BUS")
                .and_then(|v| BusKind::parse(&v))
                .or(file.bus)
                .unwrap_or(BusKind::Session),
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/prof")]));
        assert_eq!(config.db_path, PathBuf::from("/home/prof/.local/share/rollcall/rollcall.db"));
        assert_eq!(config.embedding_dim, 128);
        assert!((config.similarity_threshold - 0.80).abs() < 1e-6);
        assert_eq!(config.extract_timeout, Duration::from_secs(10));
        assert!(!config.reject_empty_export);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            db_path = "/var/lib/rollcall/file.db"
            similarity_threshold = 0.6
            bus = "system"
            "#,
        )
        .unwrap();
        let config = Config::resolve(
            file,
            env_of(&[
                ("ROLLCALL_SIMILARITY_THRESHOLD", "0.9"),
                ("ROLLCALL_REJECT_EMPTY_EXPORT", "1"),
            ]),
        );
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/file.db"));
        assert!((config.similarity_threshold - 0.9).abs() < 1e-6);
        assert!(config.reject_empty_export);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_out_of_range_threshold_falls_back() {
        for bad in ["0", "1.5", "-0.2", "abc"] {
            let config = Config::resolve(
                FileConfig::default(),
                env_of(&[("ROLLCALL_SIMILARITY_THRESHOLD", bad)]),
            );
            assert!((config.similarity_threshold - 0.80).abs() < 1e-6, "input {bad}");
        }
    }

    #[test]
    fn test_xdg_data_home_wins_over_home() {
        let config = Config::resolve(
            FileConfig::default(),
            env_of(&[("XDG_DATA_HOME", "/data"), ("HOME", "/home/prof")]),
        );
        assert_eq!(config.db_path, PathBuf::from("/data/rollcall/rollcall.db"));
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        assert!(toml::from_str::<FileConfig>("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_read_file_reports_missing_path() {
        let err = read_file(Path::new("/nonexistent/rollcall.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
