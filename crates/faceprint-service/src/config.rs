use faceprint_core::validator::ValidatorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration.
///
/// Resolution order: built-in defaults, then the TOML file named by
/// `FACEPRINT_CONFIG` (if set), then individual `FACEPRINT_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Similarity at or above which a verification matches.
    pub similarity_threshold: f32,
    /// Minimum overall quality score for a capture to be accepted.
    pub quality_min_overall: f32,
    /// Bound on a single inference call before falling back.
    pub inference_timeout_ms: u64,
    /// Whether to use the inference engine at all.
    pub engine_enabled: bool,
    /// Certify the embedding model at startup before trusting it.
    pub require_certification: bool,
    /// Average latency budget used by the model validator.
    pub validator_max_latency_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("embeddings.db"),
            similarity_threshold: faceprint_core::DEFAULT_MATCH_THRESHOLD,
            quality_min_overall: 0.7,
            inference_timeout_ms: 2000,
            engine_enabled: true,
            require_certification: false,
            validator_max_latency_ms: 500,
        }
    }
}

impl ServiceConfig {
    /// Load from `FACEPRINT_CONFIG` and `FACEPRINT_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("FACEPRINT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `FACEPRINT_*` variables on top of `self`.
    pub fn with_env_overrides(self) -> Self {
        Self {
            model_dir: env_path("FACEPRINT_MODEL_DIR", self.model_dir),
            db_path: env_path("FACEPRINT_DB_PATH", self.db_path),
            similarity_threshold: env_f32("FACEPRINT_SIMILARITY_THRESHOLD", self.similarity_threshold),
            quality_min_overall: env_f32("FACEPRINT_QUALITY_MIN", self.quality_min_overall),
            inference_timeout_ms: env_u64("FACEPRINT_INFERENCE_TIMEOUT_MS", self.inference_timeout_ms),
            engine_enabled: env_bool("FACEPRINT_ENGINE_ENABLED", self.engine_enabled),
            require_certification: env_bool("FACEPRINT_REQUIRE_CERTIFICATION", self.require_certification),
            validator_max_latency_ms: env_u64("FACEPRINT_VALIDATOR_MAX_LATENCY_MS", self.validator_max_latency_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_min_overall) {
            return Err(ConfigError::Invalid(format!(
                "quality_min_overall {} outside [0, 1]",
                self.quality_min_overall
            )));
        }
        if self.inference_timeout_ms == 0 {
            return Err(ConfigError::Invalid("inference_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_avg_latency: Duration::from_millis(self.validator_max_latency_ms),
            ..ValidatorConfig::default()
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceprint")
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.quality_min_overall, 0.7);
        assert_eq!(config.inference_timeout(), Duration::from_millis(2000));
        assert!(config.engine_enabled);
        assert!(!config.require_certification);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overlay_keeps_unset_defaults() {
        let config = ServiceConfig::from_toml(
            r#"
            similarity_threshold = 0.72
            engine_enabled = false
            model_dir = "/opt/faceprint/models"
            "#,
        )
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.72);
        assert!(!config.engine_enabled);
        assert_eq!(config.model_dir, PathBuf::from("/opt/faceprint/models"));
        assert_eq!(config.inference_timeout_ms, 2000);
    }

    #[test]
    fn test_toml_rejects_wrong_types() {
        assert!(ServiceConfig::from_toml("inference_timeout_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = ServiceConfig { quality_min_overall: 1.5, ..ServiceConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ServiceConfig { inference_timeout_ms: 0, ..ServiceConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validator_config_uses_latency_budget() {
        let config = ServiceConfig { validator_max_latency_ms: 120, ..ServiceConfig::default() };
        assert_eq!(config.validator_config().max_avg_latency, Duration::from_millis(120));
    }
}
