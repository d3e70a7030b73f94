use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{ExtractionTool, ToolOutput};
use crate::{
    entities::{BBox, ExtractionContent, PageContent, ToolId, Zone, ZoneID},
    error::ExtractionFailure,
};

/// What a recorded tool call produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordedOutcome {
    Output {
        content: ExtractionContent,
        #[serde(default)]
        confidence: Option<f32>,
        #[serde(default)]
        content_bounds: Option<BBox>,
        #[serde(default)]
        model: Option<String>,
    },
    Crash {
        message: String,
    },
    /// Never answers; only a timeout ends the call.
    Hang,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub tool: ToolId,
    pub zone_id: ZoneID,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(flatten)]
    pub outcome: RecordedOutcome,
}

impl Recording {
    pub fn output(tool: &str, zone_id: ZoneID, content: ExtractionContent, confidence: Option<f32>) -> Self {
        Self {
            tool: ToolId::new(tool),
            zone_id,
            delay_ms: 0,
            outcome: RecordedOutcome::Output {
                content,
                confidence,
                content_bounds: None,
                model: None,
            },
        }
    }

    pub fn crash(tool: &str, zone_id: ZoneID, message: &str) -> Self {
        Self {
            tool: ToolId::new(tool),
            zone_id,
            delay_ms: 0,
            outcome: RecordedOutcome::Crash {
                message: message.to_owned(),
            },
        }
    }

    pub fn hang(tool: &str, zone_id: ZoneID) -> Self {
        Self {
            tool: ToolId::new(tool),
            zone_id,
            delay_ms: 0,
            outcome: RecordedOutcome::Hang,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Serves recorded outputs instead of calling a real engine.
///
/// Recordings for the same zone are replayed in order; once exhausted the last
/// one repeats, so reprocessing a zone is deterministic.
#[derive(Debug)]
pub struct ReplayTool {
    id: ToolId,
    recordings: HashMap<ZoneID, Vec<Recording>>,
    calls: Mutex<HashMap<ZoneID, usize>>,
    available: bool,
}

impl ReplayTool {
    pub fn new(id: impl Into<String>, recordings: impl IntoIterator<Item = Recording>) -> Self {
        let id = ToolId::new(id);
        let recordings = recordings
            .into_iter()
            .filter(|r| r.tool == id)
            .into_group_map_by(|r| r.zone_id);
        Self {
            id,
            recordings,
            calls: Mutex::new(HashMap::new()),
            available: true,
        }
    }

    /// One replay tool per tool id found in `recordings`.
    pub fn from_recordings(recordings: Vec<Recording>) -> Vec<ReplayTool> {
        let ids = recordings
            .iter()
            .map(|r| r.tool.clone())
            .unique()
            .collect::<Vec<_>>();
        ids.into_iter()
            .map(|id| ReplayTool::new(id.as_str(), recordings.iter().cloned()))
            .collect()
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn next_recording(&self, zone_id: ZoneID) -> Option<&Recording> {
        let recorded = self.recordings.get(&zone_id)?;
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let n = calls.entry(zone_id).or_insert(0);
        let recording = recorded.get(*n).or_else(|| recorded.last());
        *n += 1;
        recording
    }
}

#[async_trait]
impl ExtractionTool for ReplayTool {
    fn id(&self) -> ToolId {
        self.id.clone()
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn availability_hint(&self) -> String {
        if self.available {
            String::new()
        } else {
            "replay tool disabled".to_owned()
        }
    }

    async fn extract(
        &self,
        zone: &Zone,
        _page: Option<&PageContent>,
    ) -> Result<ToolOutput, ExtractionFailure> {
        let recording = self
            .next_recording(zone.id)
            .ok_or_else(|| ExtractionFailure::unavailable(format!("no recording for zone {}", zone.id)))?
            .clone();

        if recording.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(recording.delay_ms)).await;
        }
        match recording.outcome {
            RecordedOutcome::Output {
                content,
                confidence,
                content_bounds,
                model,
            } => Ok(ToolOutput {
                content,
                reported_confidence: confidence,
                content_bounds,
                model,
            }),
            RecordedOutcome::Crash { message } => Err(ExtractionFailure::Crashed { message }),
            RecordedOutcome::Hang => futures::future::pending().await,
        }
    }
}
