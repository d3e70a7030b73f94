use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    entities::{ConfidenceScore, MergedResult, RunID, ThresholdDecision, ToolId, ZoneID},
    fallback::{AttemptLog, AttemptRecord},
};

/// Attempt view exposed for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub run_id: RunID,
    pub attempt_index: usize,
    pub tool: ToolId,
    pub score: ConfidenceScore,
    pub decision: ThresholdDecision,
    #[serde(default)]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistory {
    pub run_id: RunID,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunHistory {
    pub fn summaries(&self) -> Vec<AttemptSummary> {
        self.attempts
            .iter()
            .map(|r| AttemptSummary {
                run_id: self.run_id,
                attempt_index: r.attempt_index,
                tool: r.tool.clone(),
                score: r.score.clone(),
                decision: r.decision,
                failure: r.failure().map(|f| f.to_string()),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct ZoneResults {
    current: Option<MergedResult>,
    superseded: Vec<MergedResult>,
    runs: Vec<RunHistory>,
}

/// Finalized results and attempt histories, keyed by zone.
///
/// Holds at most one current result per zone; publishing moves the previous
/// one to the superseded list.
#[derive(Debug, Default)]
pub struct ResultStore {
    zones: RwLock<HashMap<ZoneID, ZoneResults>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, result: MergedResult) {
        let mut zones = self.zones.write().unwrap_or_else(PoisonError::into_inner);
        let entry = zones.entry(result.zone_id).or_default();
        if let Some(previous) = entry.current.replace(result) {
            entry.superseded.push(previous);
        }
    }

    pub fn record_run(&self, zone_id: ZoneID, run_id: RunID, log: AttemptLog, error: Option<String>) {
        let mut zones = self.zones.write().unwrap_or_else(PoisonError::into_inner);
        zones.entry(zone_id).or_default().runs.push(RunHistory {
            run_id,
            attempts: log.into_records(),
            error,
            finished_at: Utc::now(),
        });
    }

    pub fn current(&self, zone_id: ZoneID) -> Option<MergedResult> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&zone_id)
            .and_then(|z| z.current.clone())
    }

    pub fn superseded(&self, zone_id: ZoneID) -> Vec<MergedResult> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&zone_id)
            .map(|z| z.superseded.clone())
            .unwrap_or_default()
    }

    pub fn runs(&self, zone_id: ZoneID) -> Vec<RunHistory> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&zone_id)
            .map(|z| z.runs.clone())
            .unwrap_or_default()
    }

    pub fn latest_attempts(&self, zone_id: ZoneID) -> Vec<AttemptSummary> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&zone_id)
            .and_then(|z| z.runs.last())
            .map(RunHistory::summaries)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::{
        entities::{ExtractionContent, MergeStrategy},
        fallback::tests::record,
    };

    fn result(zone_id: ZoneID, confidence: f32) -> MergedResult {
        MergedResult {
            run_id: Uuid::new_v4(),
            zone_id,
            content: ExtractionContent::Text { text: "x".into() },
            final_confidence: confidence,
            contributing_tools: vec![ToolId::new("a")],
            corroborating_tools: vec![],
            merge_strategy: MergeStrategy::SingleAccept,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_publish_supersedes() {
        let store = ResultStore::new();
        let zone = Uuid::new_v4();
        assert!(store.current(zone).is_none());

        store.publish(result(zone, 0.9));
        store.publish(result(zone, 0.95));
        assert_eq!(store.current(zone).unwrap().final_confidence, 0.95);
        let old = store.superseded(zone);
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].final_confidence, 0.9);
    }

    #[test]
    fn test_latest_attempts() {
        let store = ResultStore::new();
        let zone = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store.record_run(
            zone,
            first,
            AttemptLog::new().append(record("a", 0.2, ThresholdDecision::Reject)),
            None,
        );
        store.record_run(
            zone,
            second,
            AttemptLog::new()
                .append(record("a", 0.3, ThresholdDecision::Reject))
                .append(record("b", 0.9, ThresholdDecision::Accept)),
            None,
        );

        let attempts = store.latest_attempts(zone);
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.run_id == second));
        assert_eq!(attempts[1].attempt_index, 1);
        assert_eq!(attempts[1].decision, ThresholdDecision::Accept);
        assert_eq!(store.runs(zone).len(), 2);
    }
}
