use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

use crate::{
    entities::{ThresholdDecision, ToolId, ZoneType},
    fallback::{AttemptOutcome, AttemptRecord},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub attempts: u64,
    /// Attempts that produced output scoring above the reject threshold.
    pub successes: u64,
}

impl ToolStats {
    pub fn new(attempts: u64, successes: u64) -> Self {
        Self {
            attempts,
            successes: successes.min(attempts),
        }
    }

    pub fn success_rate(&self) -> f32 {
        if self.attempts == 0 {
            0f32
        } else {
            self.successes as f32 / self.attempts as f32
        }
    }
}

/// Historical tool performance per zone type. Read-only while a run uses it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerformanceSnapshot(BTreeMap<ZoneType, BTreeMap<ToolId, ToolStats>>);

impl PerformanceSnapshot {
    pub fn stats(&self, tool: &ToolId, zone_type: ZoneType) -> Option<&ToolStats> {
        self.0.get(&zone_type).and_then(|m| m.get(tool))
    }

    pub fn insert(&mut self, tool: ToolId, zone_type: ZoneType, stats: ToolStats) {
        self.0.entry(zone_type).or_default().insert(tool, stats);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    fn add(&mut self, tool: &ToolId, zone_type: ZoneType, succeeded: bool) {
        let stats = self
            .0
            .entry(zone_type)
            .or_default()
            .entry(tool.clone())
            .or_default();
        stats.attempts += 1;
        if succeeded {
            stats.successes += 1;
        }
    }
}

/// Folds finished attempt histories into a snapshot of its own.
///
/// Runs never see ledger updates; the caller decides when to swap snapshots.
#[derive(Debug, Default)]
pub struct PerformanceLedger {
    folded: Mutex<Folded>,
}

#[derive(Debug, Default)]
struct Folded {
    snapshot: PerformanceSnapshot,
    attempts: usize,
}

impl PerformanceLedger {
    pub fn new(base: PerformanceSnapshot) -> Self {
        Self {
            folded: Mutex::new(Folded {
                snapshot: base,
                attempts: 0,
            }),
        }
    }

    pub fn record(&self, zone_type: ZoneType, attempts: &[AttemptRecord]) {
        let mut folded = self.folded.lock().unwrap_or_else(PoisonError::into_inner);
        for attempt in attempts {
            let succeeded = matches!(attempt.outcome, AttemptOutcome::Extracted(_))
                && attempt.decision != ThresholdDecision::Reject;
            folded.snapshot.add(&attempt.tool, zone_type, succeeded);
        }
        folded.attempts += attempts.len();
    }

    /// Attempts recorded since the ledger was created.
    pub fn recorded_attempts(&self) -> usize {
        self.folded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.folded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        assert_eq!(ToolStats::new(4, 3).success_rate(), 0.75);
        assert_eq!(ToolStats::default().success_rate(), 0.0);
        assert_eq!(ToolStats::new(2, 5).successes, 2);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snapshot = PerformanceSnapshot::default();
        snapshot.insert(ToolId::new("textract"), ZoneType::Table, ToolStats::new(10, 7));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["table"]["textract"]["attempts"], 10);

        let back: PerformanceSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_ledger_folds_onto_base() {
        use crate::{
            entities::{ConfidenceScore, ExtractionContent, RawExtraction, ToolMetadata},
            error::ExtractionFailure,
            threshold::Thresholds,
        };

        let attempt = |tool: &str, outcome: AttemptOutcome, decision: ThresholdDecision| AttemptRecord {
            attempt_index: 0,
            tool: ToolId::new(tool),
            outcome,
            score: ConfidenceScore::zero("test"),
            decision,
            thresholds: Thresholds {
                reject_below: 0.4,
                accept_above: 0.8,
            },
            started_at: chrono::Utc::now(),
        };
        let extracted = |tool: &str| {
            AttemptOutcome::Extracted(RawExtraction {
                tool: ToolId::new(tool),
                content: ExtractionContent::Text { text: "x".into() },
                metadata: ToolMetadata::default(),
                zone_id: uuid::Uuid::nil(),
                attempt_index: 0,
            })
        };

        let mut base = PerformanceSnapshot::default();
        base.insert(ToolId::new("textract"), ZoneType::Table, ToolStats::new(10, 7));
        let ledger = PerformanceLedger::new(base);

        ledger.record(
            ZoneType::Table,
            &[
                attempt(
                    "textract",
                    AttemptOutcome::Failed(ExtractionFailure::crashed("boom")),
                    ThresholdDecision::Reject,
                ),
                attempt("camelot", extracted("camelot"), ThresholdDecision::Borderline),
            ],
        );
        ledger.record(
            ZoneType::Table,
            &[attempt("textract", extracted("textract"), ThresholdDecision::Accept)],
        );

        let snapshot = ledger.snapshot();
        assert_eq!(
            snapshot.stats(&ToolId::new("textract"), ZoneType::Table),
            Some(&ToolStats::new(12, 8))
        );
        assert_eq!(
            snapshot.stats(&ToolId::new("camelot"), ZoneType::Table),
            Some(&ToolStats::new(1, 1))
        );
        assert_eq!(ledger.recorded_attempts(), 3);
        // taking a snapshot doesn't consume anything
        assert_eq!(ledger.snapshot(), snapshot);
    }
}
