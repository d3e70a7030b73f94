use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    analyze::AnalyzerConfig,
    assign::{AssignmentConfig, CompatibilityMatrix, ProcessingStrategy},
    confidence::ConfidenceConfig,
    entities::ZoneType,
    error::ConfigError,
    merge::MergeConfig,
    threshold::{default_thresholds, Thresholds},
};

/// Default number of zones processed at the same time.
pub const DEFAULT_MAX_CONCURRENT_ZONES: usize = 8;

/// Default number of tool invocations in flight across the whole document.
pub const DEFAULT_TOOL_CAPACITY: usize = 4;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_ZONE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_zones: usize,
    pub tool_capacity: usize,
    #[serde(with = "serde_millis")]
    pub attempt_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub zone_timeout: Duration,
    /// Wall-clock budget for a whole document run, in milliseconds.
    pub document_timeout_ms: Option<u64>,
    /// Keep trying candidates after the first accept to collect corroboration.
    pub continue_after_accept: bool,
    pub strategy: ProcessingStrategy,
    pub analyzer: AnalyzerConfig,
    pub confidence: ConfidenceConfig,
    pub merge: MergeConfig,
    pub assignment: AssignmentConfig,
    pub thresholds: HashMap<ZoneType, Thresholds>,
    pub matrix: CompatibilityMatrix,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_zones: DEFAULT_MAX_CONCURRENT_ZONES,
            tool_capacity: DEFAULT_TOOL_CAPACITY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            zone_timeout: DEFAULT_ZONE_TIMEOUT,
            document_timeout_ms: None,
            continue_after_accept: false,
            strategy: ProcessingStrategy::default(),
            analyzer: AnalyzerConfig::default(),
            confidence: ConfidenceConfig::default(),
            merge: MergeConfig::default(),
            assignment: AssignmentConfig::default(),
            thresholds: default_thresholds(),
            matrix: CompatibilityMatrix::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let mut config: PipelineConfig = toml::from_str(s)?;
        // Partial threshold tables only override the types they name
        for (zone_type, thresholds) in default_thresholds() {
            config.thresholds.entry(zone_type).or_insert(thresholds);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn document_timeout(&self) -> Option<Duration> {
        self.document_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_zones == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_zones",
                message: "must be at least 1".into(),
            });
        }
        if self.tool_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tool_capacity",
                message: "must be at least 1".into(),
            });
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "attempt_timeout",
                message: "must be positive".into(),
            });
        }
        if self.zone_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "zone_timeout",
                message: "must be positive".into(),
            });
        }
        for (zone_type, t) in self.thresholds.iter() {
            Thresholds::new(t.reject_below, t.accept_above).map_err(|_| {
                ConfigError::InvalidThresholds {
                    zone_type: zone_type.to_string(),
                    reject_below: t.reject_below,
                    accept_above: t.accept_above,
                }
            })?;
        }
        self.confidence.validate()?;
        self.merge.validate()?;
        Ok(())
    }
}
