use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    entities::{ConfidenceScore, RawExtraction, ThresholdDecision, ToolId},
    error::{ExtractionFailure, ProcessingError},
    threshold::Thresholds,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Extracted(RawExtraction),
    Failed(ExtractionFailure),
}

/// One tool attempt on one zone, with the score and the thresholds it was judged by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_index: usize,
    pub tool: ToolId,
    pub outcome: AttemptOutcome,
    pub score: ConfidenceScore,
    pub decision: ThresholdDecision,
    pub thresholds: Thresholds,
    pub started_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn extraction(&self) -> Option<&RawExtraction> {
        match &self.outcome {
            AttemptOutcome::Extracted(raw) => Some(raw),
            AttemptOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ExtractionFailure> {
        match &self.outcome {
            AttemptOutcome::Failed(f) => Some(f),
            AttemptOutcome::Extracted(_) => None,
        }
    }
}

/// Append-only attempt history of a zone. Indices run from 0 without gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptLog(Vec<AttemptRecord>);

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a log with `record` appended as the next attempt.
    #[must_use]
    pub fn append(mut self, mut record: AttemptRecord) -> Self {
        record.attempt_index = self.0.len();
        self.0.push(record);
        self
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.0.last()
    }

    pub fn has_accept(&self) -> bool {
        self.0.iter().any(|r| r.decision == ThresholdDecision::Accept)
    }

    /// Attempts that produced output, whatever their decision.
    pub fn extracted(&self) -> usize {
        self.0.iter().filter(|r| r.extraction().is_some()).count()
    }

    /// Highest-scoring borderline attempt, earliest on ties.
    pub fn best_borderline(&self) -> Option<&AttemptRecord> {
        self.0
            .iter()
            .filter(|r| r.decision == ThresholdDecision::Borderline && r.extraction().is_some())
            .fold(None, |best: Option<&AttemptRecord>, r| match best {
                Some(b) if b.score.value >= r.score.value => Some(b),
                _ => Some(r),
            })
    }

    pub fn into_records(self) -> Vec<AttemptRecord> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Keep attempting after the first accept to gather corroboration.
    pub continue_after_accept: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackState {
    NotStarted,
    /// Attempt `n` is next.
    Attempting(usize),
    Accepted,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Attempt { index: usize, tool: ToolId },
    Stop(FallbackState),
}

/// Decides what a zone does next, given its candidates and what has been tried.
///
/// Never schedules more attempts than there are candidates.
pub fn next_action(candidates: &[ToolId], log: &AttemptLog, policy: FallbackPolicy) -> NextAction {
    let attempted = log.len();
    let stop = || {
        if log.has_accept() {
            NextAction::Stop(FallbackState::Accepted)
        } else {
            NextAction::Stop(FallbackState::Exhausted)
        }
    };
    if attempted >= candidates.len() {
        return stop();
    }
    let proceed = NextAction::Attempt {
        index: attempted,
        tool: candidates[attempted].clone(),
    };
    match log.last().map(|r| r.decision) {
        None => proceed,
        Some(ThresholdDecision::Accept) if !policy.continue_after_accept => {
            NextAction::Stop(FallbackState::Accepted)
        }
        Some(_) => proceed,
    }
}

pub fn fallback_state(candidates: &[ToolId], log: &AttemptLog, policy: FallbackPolicy) -> FallbackState {
    if log.is_empty() {
        return FallbackState::NotStarted;
    }
    match next_action(candidates, log, policy) {
        NextAction::Attempt { index, .. } => FallbackState::Attempting(index),
        NextAction::Stop(state) => state,
    }
}

/// Error to record for a zone that stopped without an accepted attempt.
pub fn exhaustion_error(log: &AttemptLog) -> Option<ProcessingError> {
    if log.has_accept() {
        return None;
    }
    Some(ProcessingError::LowConfidenceExhaustion {
        attempts: log.len(),
        best_borderline: log.best_borderline().map(|r| r.score.value),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::entities::{ExtractionContent, ToolMetadata};

    pub(crate) fn record(tool: &str, value: f32, decision: ThresholdDecision) -> AttemptRecord {
        let tool = ToolId::new(tool);
        AttemptRecord {
            attempt_index: 0,
            tool: tool.clone(),
            outcome: AttemptOutcome::Extracted(RawExtraction {
                tool,
                content: ExtractionContent::Text {
                    text: format!("value {value}"),
                },
                metadata: ToolMetadata::default(),
                zone_id: Uuid::nil(),
                attempt_index: 0,
            }),
            score: ConfidenceScore {
                value,
                signals: Default::default(),
                reported: Some(value),
                reason: None,
            },
            decision,
            thresholds: Thresholds {
                reject_below: 0.5,
                accept_above: 0.85,
            },
            started_at: Utc::now(),
        }
    }

    fn failed(tool: &str) -> AttemptRecord {
        let mut r = record(tool, 0.0, ThresholdDecision::Reject);
        r.outcome = AttemptOutcome::Failed(ExtractionFailure::Timeout {
            elapsed: Duration::from_secs(1),
        });
        r
    }

    fn tools(names: &[&str]) -> Vec<ToolId> {
        names.iter().map(|n| ToolId::new(*n)).collect()
    }

    #[test]
    fn test_reject_then_accept() {
        let candidates = tools(&["a", "b", "c"]);
        let policy = FallbackPolicy::default();
        let log = AttemptLog::new();
        assert_eq!(fallback_state(&candidates, &log, policy), FallbackState::NotStarted);
        assert_eq!(
            next_action(&candidates, &log, policy),
            NextAction::Attempt {
                index: 0,
                tool: ToolId::new("a")
            }
        );

        let log = log.append(record("a", 0.3, ThresholdDecision::Reject));
        assert_eq!(fallback_state(&candidates, &log, policy), FallbackState::Attempting(1));

        let log = log.append(record("b", 0.9, ThresholdDecision::Accept));
        assert_eq!(
            next_action(&candidates, &log, policy),
            NextAction::Stop(FallbackState::Accepted)
        );
        assert_eq!(log.records()[1].attempt_index, 1);
        assert!(exhaustion_error(&log).is_none());
    }

    #[test]
    fn test_borderline_on_last_candidate_stops() {
        let candidates = tools(&["a", "b"]);
        let policy = FallbackPolicy::default();
        let log = AttemptLog::new()
            .append(record("a", 0.6, ThresholdDecision::Borderline))
            .append(record("b", 0.55, ThresholdDecision::Borderline));

        assert_eq!(fallback_state(&candidates, &log, policy), FallbackState::Exhausted);
        assert_eq!(log.best_borderline().unwrap().tool, ToolId::new("a"));
        assert_eq!(
            exhaustion_error(&log),
            Some(ProcessingError::LowConfidenceExhaustion {
                attempts: 2,
                best_borderline: Some(0.6)
            })
        );
    }

    #[test]
    fn test_failures_advance_like_rejects() {
        let candidates = tools(&["a", "b"]);
        let log = AttemptLog::new().append(failed("a"));
        assert_eq!(
            next_action(&candidates, &log, FallbackPolicy::default()),
            NextAction::Attempt {
                index: 1,
                tool: ToolId::new("b")
            }
        );
        let log = log.append(failed("b"));
        assert_eq!(log.extracted(), 0);
        assert!(log.best_borderline().is_none());
        assert_eq!(
            fallback_state(&candidates, &log, FallbackPolicy::default()),
            FallbackState::Exhausted
        );
    }

    #[test]
    fn test_corroboration_continues_past_accept() {
        let candidates = tools(&["a", "b", "c"]);
        let policy = FallbackPolicy {
            continue_after_accept: true,
        };
        let log = AttemptLog::new().append(record("a", 0.9, ThresholdDecision::Accept));
        assert_eq!(fallback_state(&candidates, &log, policy), FallbackState::Attempting(1));

        let log = log
            .append(record("b", 0.2, ThresholdDecision::Reject))
            .append(record("c", 0.95, ThresholdDecision::Accept));
        assert_eq!(fallback_state(&candidates, &log, policy), FallbackState::Accepted);
        // the rejected output still counts as produced
        assert_eq!(log.extracted(), 3);
        assert_eq!(log.append(failed("d")).extracted(), 3);
    }

    #[test]
    fn test_empty_candidates_stop_immediately() {
        assert_eq!(
            next_action(&[], &AttemptLog::new(), FallbackPolicy::default()),
            NextAction::Stop(FallbackState::Exhausted)
        );
    }
}
