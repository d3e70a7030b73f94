//! Zone-level extraction core: picks tools for each detected zone, scores
//! what they return, falls back until a result is good enough, and merges
//! the accepted outputs.

pub mod analyze;
pub mod assign;
pub mod confidence;
pub mod config;
pub mod entities;
pub mod error;
pub mod extract;
pub mod fallback;
pub mod merge;
pub mod orchestrator;
pub mod threshold;

pub use config::PipelineConfig;
pub use error::{ConfigError, ExtractionFailure, OrchestratorError, ProcessingError};
pub use extract::{replay::ReplayTool, ExtractionTool, ToolOutput, ToolRegistry};
pub use orchestrator::{
    DocumentInput, DocumentReport, DocumentRun, DocumentStatus, EnhancedOrchestrator,
    ReprocessOptions, ReprocessResult,
};
