//! Centralized configuration management with TOML support.
//!
//! Provides the key-naming conventions used while converting state dicts
//! and the parallelism degrees used to answer rank queries.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ShardBridgeError};

/// Naming conventions applied while walking a state dict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Prefix of per-layer keys; the segment after it is the layer index.
    pub layer_prefix: String,
    /// Suffix of vocabulary-sized tables whose global shape may differ
    /// between checkpoint and model.
    pub vocab_suffix: String,
    /// Fail the save when no key carries the layer prefix.
    pub require_layer_stack: bool,
    /// Total layer count of the model. Pipeline stages only see their own
    /// layers, so every rank must be given the same total.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_layers: Option<usize>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            layer_prefix: "module.decoder.layers.".into(),
            vocab_suffix: ".word_embeddings.weight".into(),
            require_layer_stack: true,
            num_layers: None,
        }
    }
}

impl ConversionConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.layer_prefix.is_empty() || !self.layer_prefix.ends_with('.') {
            return Err(ShardBridgeError::InvalidConfig(
                "layer_prefix must be non-empty and end with '.'".into(),
            ));
        }
        if self.vocab_suffix.is_empty() {
            return Err(ShardBridgeError::InvalidConfig(
                "vocab_suffix must be non-empty".into(),
            ));
        }
        if self.num_layers == Some(0) {
            return Err(ShardBridgeError::InvalidConfig(
                "num_layers must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

/// Parallelism degrees of the job that owns the state dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Tensor-parallel degree.
    pub tensor_parallel: usize,
    /// Pipeline-parallel degree.
    pub pipeline_parallel: usize,
    /// Context-parallel degree.
    pub context_parallel: usize,
    /// Data-parallel degree (excluding context parallelism).
    pub data_parallel: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_parallel: 1,
            pipeline_parallel: 1,
            context_parallel: 1,
            data_parallel: 1,
        }
    }
}

impl ParallelConfig {
    /// Total number of ranks implied by the parallel degrees.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel * self.pipeline_parallel * self.context_parallel * self.data_parallel
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let degrees = [
            ("tensor_parallel", self.tensor_parallel),
            ("pipeline_parallel", self.pipeline_parallel),
            ("context_parallel", self.context_parallel),
            ("data_parallel", self.data_parallel),
        ];
        for (name, degree) in degrees {
            if degree == 0 {
                return Err(ShardBridgeError::InvalidConfig(format!(
                    "{name} must be > 0"
                )));
            }
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Logging level (trace, debug, info, warn, error), used when
    /// `RUST_LOG` is unset.
    pub log_level: String,
    /// Checkpoint directory or trainer-style `.ckpt` path.
    pub checkpoint_dir: String,
    /// Key-naming conventions.
    pub conversion: ConversionConfig,
    /// Parallelism degrees.
    pub parallel: ParallelConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            checkpoint_dir: "./checkpoints".into(),
            conversion: ConversionConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("failed to read config file {}: {}", path.display(), e),
            )
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| ShardBridgeError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate all sub-configs.
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.as_str()) {
            return Err(ShardBridgeError::InvalidConfig(format!(
                "log_level must be one of {LEVELS:?}, got '{}'",
                self.log_level
            )));
        }
        if self.checkpoint_dir.is_empty() {
            return Err(ShardBridgeError::InvalidConfig(
                "checkpoint_dir must be non-empty".into(),
            ));
        }
        self.conversion.validate()?;
        self.parallel.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        ConversionConfig::default().validate().unwrap();
        ParallelConfig::default().validate().unwrap();
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_layer_prefix_must_end_with_dot() {
        let cfg = ConversionConfig {
            layer_prefix: "module.decoder.layers".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_degree_rejected() {
        let cfg = ParallelConfig {
            context_parallel: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("context_parallel"));
    }

    #[test]
    fn test_world_size() {
        let cfg = ParallelConfig {
            tensor_parallel: 2,
            pipeline_parallel: 2,
            context_parallel: 2,
            data_parallel: 3,
        };
        assert_eq!(cfg.world_size(), 24);
    }

    #[test]
    fn test_config_roundtrip() {
        let mut cfg = BridgeConfig::default();
        cfg.parallel.tensor_parallel = 4;
        cfg.conversion.require_layer_stack = false;
        cfg.conversion.num_layers = Some(24);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        cfg.save(tmp.path()).unwrap();
        let loaded = BridgeConfig::from_file(tmp.path()).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), "[parallel]\ntensor_parallel = 8\n").unwrap();
        let loaded = BridgeConfig::from_file(tmp.path()).unwrap();
        assert_eq!(loaded.parallel.tensor_parallel, 8);
        assert_eq!(loaded.parallel.data_parallel, 1);
        assert_eq!(loaded.conversion, ConversionConfig::default());
    }

    #[test]
    fn test_missing_file_is_recoverable_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = BridgeConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ShardBridgeError::Io(_)));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let cfg = BridgeConfig {
            log_level: "verbose".into(),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }
}
