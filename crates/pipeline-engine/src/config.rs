//! Configuration types for the pipeline engine

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default values for every configurable knob
pub mod defaults {
    /// Retries of an optimistic update before the conflict is surfaced
    pub const MAX_UPDATE_RETRIES: u32 = 3;
    /// Manual intervention wait when the adviser sets no timeout (24h)
    pub const INTERVENTION_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
    pub const ARCHIVE_COMPLETED_PLANS: bool = true;
    /// zstd level used by the archive and the compressing codec
    pub const COMPRESSION_LEVEL: i32 = 3;
    pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
    pub const REDELIVERY_BACKOFF_MS: u64 = 50;
    pub const CONSUMER_CONCURRENCY: usize = 32;
}

/// Message consumer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerConfig {
    /// Deliveries of one message before it is dead-lettered
    pub max_delivery_attempts: u32,
    /// Base delay between redeliveries, multiplied by the attempt number
    pub redelivery_backoff_ms: u64,
    /// Handlers running at once per topic
    pub concurrency: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: defaults::MAX_DELIVERY_ATTEMPTS,
            redelivery_backoff_ms: defaults::REDELIVERY_BACKOFF_MS,
            concurrency: defaults::CONSUMER_CONCURRENCY,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub max_update_retries: u32,
    pub default_intervention_timeout_ms: u64,
    pub archive_completed_plans: bool,
    pub compression_level: i32,
    /// Directory for JSON plan persistence; plans stay in memory when unset
    pub plan_store_path: Option<PathBuf>,
    pub consumer: ConsumerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_update_retries: defaults::MAX_UPDATE_RETRIES,
            default_intervention_timeout_ms: defaults::INTERVENTION_TIMEOUT_MS,
            archive_completed_plans: defaults::ARCHIVE_COMPLETED_PLANS,
            compression_level: defaults::COMPRESSION_LEVEL,
            plan_store_path: None,
            consumer: ConsumerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(content)
            .map_err(|e| EngineError::Config(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        log::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_update_retries == 0 {
            return Err(EngineError::Config(
                "maxUpdateRetries must be at least 1".to_string(),
            ));
        }
        if self.default_intervention_timeout_ms == 0 {
            return Err(EngineError::Config(
                "defaultInterventionTimeoutMs must be positive".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(EngineError::Config(format!(
                "compressionLevel {} outside 1..=22",
                self.compression_level
            )));
        }
        if self.consumer.max_delivery_attempts == 0 || self.consumer.concurrency == 0 {
            return Err(EngineError::Config(
                "consumer maxDeliveryAttempts and concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_intervention_timeout_ms, 86_400_000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"maxUpdateRetries": 7, "consumer": {"concurrency": 2}}"#)
                .unwrap();
        assert_eq!(config.max_update_retries, 7);
        assert_eq!(config.consumer.concurrency, 2);
        assert_eq!(
            config.consumer.max_delivery_attempts,
            defaults::MAX_DELIVERY_ATTEMPTS
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_json_str(r#"{"compressionLevel": 40}"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        let err = EngineConfig::from_json_str(r#"{"maxUpdateRetries": 0}"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"archiveCompletedPlans": false}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.archive_completed_plans);
    }
}
