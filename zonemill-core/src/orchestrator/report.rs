use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::progress::Progress;
use crate::entities::{
    DocumentID, MergeStrategy, RunID, RunMetadata, ThresholdDecision, ToolId, ZoneID, ZoneStatus,
    ZoneType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::PartiallyCompleted => "partially_completed",
            DocumentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a zone's processing ended in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneOutcome {
    Accepted,
    /// Every candidate tried, or the zone budget ran out, without an accept.
    Exhausted,
    /// No compatible tool for the zone type.
    ConfigurationError,
    /// Stopped by cancellation before reaching a terminal state.
    Incomplete,
    /// Left alone because of a manual override.
    Skipped,
}

impl ZoneOutcome {
    pub fn zone_status(&self) -> ZoneStatus {
        match self {
            ZoneOutcome::Accepted => ZoneStatus::Completed,
            ZoneOutcome::Exhausted | ZoneOutcome::ConfigurationError => ZoneStatus::Error,
            ZoneOutcome::Incomplete => ZoneStatus::Pending,
            ZoneOutcome::Skipped => ZoneStatus::ManualOverride,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReport {
    pub zone_id: ZoneID,
    pub zone_type: Option<ZoneType>,
    pub outcome: ZoneOutcome,
    pub attempts: usize,
    /// Whether any tool returned output for the zone.
    pub produced_output: bool,
    pub final_confidence: Option<f32>,
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ZoneReport {
    pub(crate) fn bare(zone_id: ZoneID, zone_type: Option<ZoneType>, outcome: ZoneOutcome) -> Self {
        Self {
            zone_id,
            zone_type,
            outcome,
            attempts: 0,
            produced_output: false,
            final_confidence: None,
            merge_strategy: None,
            timed_out: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_zones: usize,
    pub completed: usize,
    pub failed: usize,
    pub incomplete: usize,
    pub skipped: usize,
    pub average_confidence: Option<f32>,
    /// Completed zones over attempted zones.
    pub success_rate: f32,
    pub zones_per_minute: f32,
}

impl ProcessingStats {
    pub fn from_zones(zones: &[ZoneReport], duration: Duration) -> Self {
        let count = |o: ZoneOutcome| zones.iter().filter(|z| z.outcome == o).count();
        let completed = count(ZoneOutcome::Accepted);
        let failed = count(ZoneOutcome::Exhausted) + count(ZoneOutcome::ConfigurationError);
        let incomplete = count(ZoneOutcome::Incomplete);
        let skipped = count(ZoneOutcome::Skipped);

        let confidences = zones.iter().filter_map(|z| z.final_confidence).collect::<Vec<_>>();
        let average_confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f32>() / confidences.len() as f32);

        let attempted = completed + failed;
        let success_rate = if attempted > 0 {
            completed as f32 / attempted as f32
        } else {
            0f32
        };
        let minutes = duration.as_secs_f32() / 60f32;
        let zones_per_minute = if minutes > 0f32 {
            attempted as f32 / minutes
        } else {
            0f32
        };

        Self {
            total_zones: zones.len(),
            completed,
            failed,
            incomplete,
            skipped,
            average_confidence,
            success_rate,
            zones_per_minute,
        }
    }
}

/// Document status from how its zones ended.
pub fn derive_status(zones: &[ZoneReport]) -> DocumentStatus {
    if zones.iter().any(|z| z.outcome == ZoneOutcome::Incomplete) {
        return DocumentStatus::PartiallyCompleted;
    }
    let attempted = zones
        .iter()
        .filter(|z| z.outcome != ZoneOutcome::Skipped)
        .collect::<Vec<_>>();
    if !attempted.is_empty() && attempted.iter().all(|z| !z.produced_output) {
        return DocumentStatus::Failed;
    }
    DocumentStatus::Completed
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document_id: DocumentID,
    pub name: String,
    pub run_id: RunID,
    pub status: DocumentStatus,
    pub cancelled: bool,
    pub timed_out: bool,
    pub zones: Vec<ZoneReport>,
    pub stats: ProcessingStats,
    pub metadata: RunMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneSummary {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub average_confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ZoneEventKind {
    Started,
    Attempted {
        attempt_index: usize,
        tool: ToolId,
        confidence: f32,
        decision: ThresholdDecision,
    },
    Finished {
        outcome: ZoneOutcome,
        final_confidence: Option<f32>,
    },
    Skipped,
}

/// Progress notification for one zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneStatusEvent {
    pub document_id: DocumentID,
    pub run_id: RunID,
    pub zone_id: ZoneID,
    pub status: ZoneStatus,
    #[serde(flatten)]
    pub kind: ZoneEventKind,
    pub progress: Progress,
    pub timestamp: DateTime<Utc>,
}
