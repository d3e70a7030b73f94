use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::entities::{DocumentID, ToolId, ZoneID, ZoneType};

/// Why a single tool invocation produced nothing. Always recoverable by fallback.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionFailure {
    #[error("tool crashed: {message}")]
    Crashed { message: String },

    #[error("tool timed out after {}ms", elapsed.as_millis())]
    Timeout {
        #[serde(with = "serde_millis")]
        elapsed: Duration,
    },

    #[error("tool unavailable: {message}")]
    Unavailable { message: String },
}

impl ExtractionFailure {
    pub fn crashed(message: impl Into<String>) -> Self {
        Self::Crashed {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Zone-scoped failures. None of these cross the zone boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProcessingError {
    #[error("no compatible extraction tools for zone type {zone_type}")]
    Configuration { zone_type: ZoneType },

    #[error("tool {tool} failed: {failure}")]
    ToolExecution {
        tool: ToolId,
        failure: ExtractionFailure,
    },

    #[error("all {attempts} candidate tools tried, none accepted")]
    LowConfidenceExhaustion {
        attempts: usize,
        best_borderline: Option<f32>,
    },

    #[error("zone processing cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid thresholds for {zone_type}: reject_below={reject_below}, accept_above={accept_above}")]
    InvalidThresholds {
        zone_type: String,
        reject_below: f32,
        accept_above: f32,
    },

    #[error("invalid confidence weights: {0}")]
    InvalidWeights(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("document {0} not registered")]
    DocumentNotFound(DocumentID),

    #[error("zone {0} not found")]
    ZoneNotFound(ZoneID),

    #[error("zone {0} is under manual override, use force to reprocess")]
    ManualOverrideLocked(ZoneID),

    #[error("document {0} is already being processed")]
    AlreadyProcessing(DocumentID),

    #[error("zone {0} is being processed")]
    ZoneBusy(ZoneID),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
