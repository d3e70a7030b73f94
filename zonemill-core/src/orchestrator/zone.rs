use std::sync::Arc;

use chrono::Utc;
use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{
    progress::{ProgressTracker, ZonePhase},
    report::{ZoneEventKind, ZoneOutcome, ZoneReport, ZoneStatusEvent},
    DocumentEntry, Shared,
};
use crate::{
    analyze::{analyze_zone, TypeSource},
    assign::{PerformanceSnapshot, ToolAssigner},
    entities::{
        ConfidenceScore, RunID, ThresholdDecision, ToolId, Zone, ZoneID, ZoneStatus, ZoneType,
    },
    extract::ExtractionExecutor,
    fallback::{
        exhaustion_error, next_action, AttemptLog, AttemptOutcome, AttemptRecord, FallbackPolicy,
        NextAction,
    },
    merge::merge_attempts,
};

/// Everything a zone task needs from the run it belongs to.
pub(crate) struct RunContext {
    pub shared: Arc<Shared>,
    pub document: Arc<DocumentEntry>,
    pub run_id: RunID,
    pub executor: ExtractionExecutor,
    pub history: Arc<PerformanceSnapshot>,
    pub progress: Arc<ProgressTracker>,
    pub events: Option<UnboundedSender<ZoneStatusEvent>>,
    pub cancel: CancellationToken,
    pub only: Option<Vec<ToolId>>,
}

impl RunContext {
    pub fn emit(&self, zone_id: ZoneID, status: ZoneStatus, kind: ZoneEventKind) {
        if let Some(events) = &self.events {
            // nobody listening is fine
            let _ = events.send(ZoneStatusEvent {
                document_id: self.document.id,
                run_id: self.run_id,
                zone_id,
                status,
                kind,
                progress: self.progress.snapshot(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Reports a zone left alone because it is under manual override.
    pub fn skip(&self, zone_id: ZoneID, zone_type: Option<ZoneType>, reports: &mut Vec<ZoneReport>) {
        self.progress.skip(zone_id);
        self.emit(zone_id, ZoneStatus::ManualOverride, ZoneEventKind::Skipped);
        reports.push(ZoneReport::bare(zone_id, zone_type, ZoneOutcome::Skipped));
    }

    /// Records the zone's final phase and status, then notifies listeners.
    ///
    /// An incomplete zone gets back the status it had when it was claimed.
    pub fn conclude(&self, report: &ZoneReport, previous: ZoneStatus) {
        let phase = match report.outcome {
            ZoneOutcome::Accepted => ZonePhase::Completed,
            ZoneOutcome::Exhausted | ZoneOutcome::ConfigurationError => ZonePhase::Error,
            ZoneOutcome::Incomplete => ZonePhase::Incomplete,
            ZoneOutcome::Skipped => ZonePhase::Skipped,
        };
        if !self.progress.finish(report.zone_id, phase) {
            tracing::warn!("zone {} was already finished", report.zone_id);
            return;
        }
        let status = match report.outcome {
            ZoneOutcome::Incomplete => previous,
            outcome => outcome.zone_status(),
        };
        self.document.set_zone_status(report.zone_id, status);
        self.emit(
            report.zone_id,
            status,
            ZoneEventKind::Finished {
                outcome: report.outcome,
                final_confidence: report.final_confidence,
            },
        );
    }
}

/// Drives one zone through analysis, assignment, attempts and merge.
///
/// The zone must already be claimed; `previous` is its status before that.
#[instrument(skip_all, fields(zone_id = %zone.id, page = zone.page))]
pub(crate) async fn process_zone(ctx: Arc<RunContext>, zone: Zone, previous: ZoneStatus) -> ZoneReport {
    let zone_id = zone.id;
    let config = &ctx.shared.config;

    ctx.progress.start(zone_id);
    ctx.emit(zone_id, ZoneStatus::Processing, ZoneEventKind::Started);

    let page = ctx.document.page(zone.page);
    let hints = analyze_zone(&zone, page.as_deref(), &config.analyzer);
    if hints.degraded {
        tracing::warn!(
            "degraded analysis: {}",
            hints.degraded_reason.as_deref().unwrap_or("unknown")
        );
    }
    if hints.type_source == TypeSource::Inferred {
        ctx.document.set_zone_type(zone_id, hints.zone_type);
    }
    let zone_type = Some(hints.zone_type);

    let assigner = ToolAssigner::new(&config.matrix, &config.assignment, config.strategy);
    let candidates = match assigner.assign(&hints, &ctx.history, ctx.only.as_deref()) {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::error!("zone can't be processed: {e}");
            ctx.shared
                .store
                .record_run(zone_id, ctx.run_id, AttemptLog::new(), Some(e.to_string()));
            let report = ZoneReport {
                error: Some(e.to_string()),
                ..ZoneReport::bare(zone_id, zone_type, ZoneOutcome::ConfigurationError)
            };
            ctx.conclude(&report, previous);
            return report;
        }
    };

    let zone = Arc::new(zone);
    let policy = FallbackPolicy {
        continue_after_accept: config.continue_after_accept,
    };
    let deadline = Instant::now() + config.zone_timeout;
    let mut log = AttemptLog::new();
    let mut timed_out = false;
    let mut cancelled = false;

    while let NextAction::Attempt { index, tool } = next_action(&candidates, &log, policy) {
        if ctx.cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!("zone budget of {}ms spent after {index} attempts", config.zone_timeout.as_millis());
            timed_out = true;
            break;
        }

        // later threshold updates don't affect this attempt
        let thresholds = ctx
            .shared
            .thresholds
            .thresholds_for(ctx.document.id, hints.zone_type);
        let started_at = Utc::now();
        let result = ctx
            .executor
            .execute(
                zone.clone(),
                page.clone(),
                &tool,
                index,
                config.attempt_timeout.min(remaining),
            )
            .await;

        let record = match result {
            Ok(raw) => {
                let score = ctx.shared.engine.score(&raw, &hints, &zone);
                let decision = thresholds.classify(score.value);
                tracing::debug!("attempt {index} with {tool}: {:.3} -> {decision}", score.value);
                AttemptRecord {
                    attempt_index: index,
                    tool: tool.clone(),
                    outcome: AttemptOutcome::Extracted(raw),
                    score,
                    decision,
                    thresholds,
                    started_at,
                }
            }
            Err(failure) => {
                tracing::warn!("attempt {index} with {tool} failed: {failure}");
                AttemptRecord {
                    attempt_index: index,
                    tool: tool.clone(),
                    score: ConfidenceScore::zero(failure.to_string()),
                    outcome: AttemptOutcome::Failed(failure),
                    decision: ThresholdDecision::Reject,
                    thresholds,
                    started_at,
                }
            }
        };
        ctx.emit(
            zone_id,
            ZoneStatus::Processing,
            ZoneEventKind::Attempted {
                attempt_index: index,
                tool,
                confidence: record.score.value,
                decision: record.decision,
            },
        );
        log = log.append(record);
    }

    let attempts = log.len();
    let produced_output = log.extracted() > 0;

    if cancelled {
        tracing::info!("zone cancelled after {attempts} attempts");
        ctx.shared
            .store
            .record_run(zone_id, ctx.run_id, log, Some("cancelled".to_owned()));
        let report = ZoneReport {
            attempts,
            produced_output,
            ..ZoneReport::bare(zone_id, zone_type, ZoneOutcome::Incomplete)
        };
        ctx.conclude(&report, previous);
        return report;
    }

    let merged = merge_attempts(ctx.run_id, zone_id, log.records(), &config.merge);
    let error = exhaustion_error(&log).map(|e| e.to_string());
    if let Some(ledger) = &ctx.shared.ledger {
        ledger.record(hints.zone_type, log.records());
    }

    let report = ZoneReport {
        zone_id,
        zone_type,
        outcome: if error.is_none() {
            ZoneOutcome::Accepted
        } else {
            ZoneOutcome::Exhausted
        },
        attempts,
        produced_output,
        final_confidence: merged.as_ref().map(|m| m.final_confidence),
        merge_strategy: merged.as_ref().map(|m| m.merge_strategy),
        timed_out,
        error: error.clone(),
    };
    if let Some(merged) = merged {
        ctx.shared.store.publish(merged);
    }
    ctx.shared.store.record_run(zone_id, ctx.run_id, log, error);
    ctx.conclude(&report, previous);
    report
}
