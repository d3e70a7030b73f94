use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use uuid::Uuid;
use zonemill_core::{
    assign::{CompatibilityMatrix, PerformanceLedger, PerformanceSnapshot, ToolEntry},
    confidence::ConfidenceConfig,
    entities::{
        BBox, ExtractionContent, MergeStrategy, PageContent, ThresholdDecision, ToolId, Zone,
        ZoneStatus, ZoneType,
    },
    error::{ExtractionFailure, OrchestratorError},
    extract::replay::Recording,
    orchestrator::{ZoneEventKind, ZoneOutcome},
    DocumentInput, DocumentStatus, EnhancedOrchestrator, ExtractionTool, PipelineConfig,
    ReplayTool, ReprocessOptions, ToolOutput, ToolRegistry,
};

const TEXT: &str = "The quarterly report shows steady growth across all regions this year";

/// Scores follow the tool's reported confidence almost exactly.
fn config() -> PipelineConfig {
    PipelineConfig {
        confidence: ConfidenceConfig {
            tool_weight: 1.0,
            structural_weight: 0.0,
            completeness_weight: 0.0,
            max_tool_weight: 0.99,
            ..Default::default()
        },
        matrix: CompatibilityMatrix::empty()
            .with_entries(
                ZoneType::Text,
                vec![ToolEntry::new("alpha"), ToolEntry::new("beta")],
            )
            .with_entries(
                ZoneType::Table,
                vec![ToolEntry::new("alpha"), ToolEntry::new("beta")],
            ),
        ..Default::default()
    }
}

fn text_zone() -> Zone {
    Zone::new(Uuid::nil(), 1, BBox::new(10.0, 10.0, 200.0, 100.0)).with_type(ZoneType::Text, 0.95)
}

fn table_zone() -> Zone {
    Zone::new(Uuid::nil(), 1, BBox::new(10.0, 300.0, 400.0, 150.0)).with_type(ZoneType::Table, 0.95)
}

fn table() -> ExtractionContent {
    ExtractionContent::Table {
        rows: vec![
            vec!["Region".into(), "Q1".into(), "Q2".into()],
            vec!["North".into(), "120".into(), "135".into()],
            vec!["South".into(), "98".into(), "110".into()],
        ],
    }
}

fn text(s: &str) -> ExtractionContent {
    ExtractionContent::Text { text: s.into() }
}

fn orchestrator(config: PipelineConfig, recordings: Vec<Recording>) -> EnhancedOrchestrator {
    let registry = ReplayTool::from_recordings(recordings)
        .into_iter()
        .fold(ToolRegistry::new(), |r, tool| r.with_tool(Arc::new(tool)));
    EnhancedOrchestrator::new(config, registry, Some(Arc::new(PerformanceLedger::default()))).unwrap()
}

fn register(orchestrator: &EnhancedOrchestrator, zones: Vec<Zone>) -> Uuid {
    orchestrator
        .register_document(DocumentInput {
            id: Uuid::new_v4(),
            name: "report".into(),
            zones,
            pages: vec![],
        })
        .unwrap()
}

async fn run(
    orchestrator: &EnhancedOrchestrator,
    document_id: Uuid,
) -> zonemill_core::DocumentReport {
    let run = orchestrator
        .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
        .unwrap();
    run.report.await.unwrap()
}

#[tokio::test]
async fn test_reject_then_accept() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", zone.id, text("Th3 qu@rt#rly rep0rt"), Some(0.3)),
            Recording::output("beta", zone.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    assert_eq!(report.zones[0].attempts, 2);

    let merged = orchestrator.merged_result(zone.id).unwrap();
    assert_eq!(merged.merge_strategy, MergeStrategy::SingleAccept);
    assert_eq!(merged.contributing_tools, vec![ToolId::new("beta")]);
    assert_eq!(merged.content, text(TEXT));
    assert!(merged.final_confidence >= 0.85);

    let history = orchestrator.attempt_history(zone.id);
    assert_eq!(
        history.iter().map(|a| a.decision).collect::<Vec<_>>(),
        vec![ThresholdDecision::Reject, ThresholdDecision::Accept]
    );
    assert_eq!(orchestrator.zone(zone.id).unwrap().status, ZoneStatus::Completed);
}

#[tokio::test]
async fn test_two_borderlines_keep_the_best() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", zone.id, text(TEXT), Some(0.7)),
            Recording::output("beta", zone.id, text("The quarterly report shows"), Some(0.6)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let report = run(&orchestrator, document_id).await;
    // borderline output still counts as produced
    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Exhausted);
    assert!(report.zones[0].error.is_some());

    let merged = orchestrator.merged_result(zone.id).unwrap();
    assert_eq!(merged.merge_strategy, MergeStrategy::BestEffortBorderline);
    assert_eq!(merged.contributing_tools, vec![ToolId::new("alpha")]);
    assert!(merged.final_confidence > 0.6 && merged.final_confidence < 0.85);
    assert_eq!(orchestrator.zone(zone.id).unwrap().status, ZoneStatus::Error);
}

#[tokio::test]
async fn test_missing_matrix_entry_fails_only_that_zone() {
    let paragraph = text_zone();
    let diagram = Zone::new(Uuid::nil(), 1, BBox::new(10.0, 200.0, 200.0, 200.0))
        .with_type(ZoneType::Diagram, 0.9);
    let orchestrator = orchestrator(
        config(),
        vec![Recording::output("alpha", paragraph.id, text(TEXT), Some(0.9))],
    );
    let document_id = register(&orchestrator, vec![paragraph.clone(), diagram.clone()]);

    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    assert_eq!(report.zones[1].outcome, ZoneOutcome::ConfigurationError);
    assert_eq!(report.zones[1].attempts, 0);
    assert_eq!(report.stats.failed, 1);

    assert!(orchestrator.merged_result(diagram.id).is_none());
    assert_eq!(orchestrator.zone(diagram.id).unwrap().status, ZoneStatus::Error);
    let runs = orchestrator.run_histories(diagram.id);
    assert_eq!(runs.len(), 1);
    assert!(runs[0].error.as_deref().unwrap().contains("diagram"));
}

#[tokio::test]
async fn test_timeout_then_success() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        PipelineConfig {
            attempt_timeout: Duration::from_millis(50),
            ..config()
        },
        vec![
            Recording::hang("alpha", zone.id),
            Recording::output("beta", zone.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);

    let history = orchestrator.run_histories(zone.id);
    let attempts = &history[0].attempts;
    assert_eq!(attempts.len(), 2);
    assert!(matches!(
        attempts[0].failure(),
        Some(ExtractionFailure::Timeout { .. })
    ));
    assert_eq!(attempts[0].decision, ThresholdDecision::Reject);
    assert_eq!(attempts[1].decision, ThresholdDecision::Accept);
    assert_eq!(
        orchestrator.merged_result(zone.id).unwrap().contributing_tools,
        vec![ToolId::new("beta")]
    );
}

#[tokio::test]
async fn test_corroborated_accept() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        PipelineConfig {
            continue_after_accept: true,
            ..config()
        },
        vec![
            Recording::output("alpha", zone.id, text(TEXT), Some(0.9)),
            Recording::output("beta", zone.id, text(&TEXT.to_uppercase()), Some(0.88)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);
    run(&orchestrator, document_id).await;

    let merged = orchestrator.merged_result(zone.id).unwrap();
    assert_eq!(merged.merge_strategy, MergeStrategy::CorroboratedAccept);
    assert_eq!(merged.content, text(TEXT));
    assert_eq!(
        merged.contributing_tools,
        vec![ToolId::new("alpha"), ToolId::new("beta")]
    );
    let best = orchestrator.attempt_history(zone.id)[0].score.value;
    assert!((merged.final_confidence - (best + 0.05)).abs() < 1e-5);
}

#[tokio::test]
async fn test_reprocess_is_idempotent_and_supersedes() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", zone.id, text("Th3 qu@rt#rly rep0rt"), Some(0.3)),
            Recording::output("beta", zone.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);
    run(&orchestrator, document_id).await;
    let first = orchestrator.merged_result(zone.id).unwrap();

    let again = orchestrator
        .reprocess_zone(zone.id, ReprocessOptions::default())
        .await
        .unwrap();
    let second = again.merged.unwrap();
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.content, first.content);
    assert_eq!(second.final_confidence, first.final_confidence);
    assert_eq!(second.merge_strategy, first.merge_strategy);

    // one current result, the old one superseded
    assert_eq!(orchestrator.merged_result(zone.id).unwrap().run_id, again.run_id);
    let superseded = orchestrator.superseded_results(zone.id);
    assert_eq!(superseded.len(), 1);
    assert_eq!(superseded[0].run_id, first.run_id);
    assert_eq!(orchestrator.run_histories(zone.id).len(), 2);

    // restricted to one tool, the rejected output is all there is
    let only_alpha = orchestrator
        .reprocess_zone(
            zone.id,
            ReprocessOptions {
                tools: Some(vec![ToolId::new("alpha")]),
                force: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(only_alpha.report.outcome, ZoneOutcome::Exhausted);
    assert!(only_alpha.merged.is_none());
    assert_eq!(orchestrator.merged_result(zone.id).unwrap().run_id, again.run_id);
    assert_eq!(orchestrator.attempt_history(zone.id).len(), 1);
}

#[tokio::test]
async fn test_document_threshold_applies_to_later_attempts() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", zone.id, text(TEXT), Some(0.7)),
            Recording::output("beta", zone.id, text(TEXT), Some(0.6)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);
    run(&orchestrator, document_id).await;
    assert_eq!(
        orchestrator.merged_result(zone.id).unwrap().merge_strategy,
        MergeStrategy::BestEffortBorderline
    );

    assert!(orchestrator
        .set_document_threshold(document_id, ZoneType::Text, 0.7, 0.5)
        .is_err());
    orchestrator
        .set_document_threshold(document_id, ZoneType::Text, 0.3, 0.65)
        .unwrap();
    let reprocessed = orchestrator
        .reprocess_zone(zone.id, ReprocessOptions::default())
        .await
        .unwrap();
    assert_eq!(reprocessed.report.outcome, ZoneOutcome::Accepted);
    assert_eq!(reprocessed.report.attempts, 1);
    assert_eq!(
        reprocessed.merged.unwrap().merge_strategy,
        MergeStrategy::SingleAccept
    );
}

#[tokio::test]
async fn test_cancel_leaves_remaining_zones_incomplete() {
    let zones = (0..3).map(|_| text_zone()).collect::<Vec<_>>();
    let recordings = zones
        .iter()
        .map(|z| {
            Recording::output("alpha", z.id, text(TEXT), Some(0.9))
                .with_delay(Duration::from_millis(200))
        })
        .collect();
    let orchestrator = orchestrator(
        PipelineConfig {
            max_concurrent_zones: 1,
            ..config()
        },
        recordings,
    );
    let document_id = register(&orchestrator, zones.clone());

    let mut run = orchestrator
        .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
        .unwrap();
    let first = run.events.next().await.unwrap();
    assert_eq!(first.zone_id, zones[0].id);
    assert_eq!(first.kind, ZoneEventKind::Started);
    assert_eq!(
        orchestrator.document_status(document_id).unwrap(),
        DocumentStatus::Processing
    );
    run.cancel();

    while run.events.next().await.is_some() {}
    let report = run.report.await.unwrap();
    assert!(report.cancelled);
    assert!(!report.timed_out);
    assert_eq!(report.status, DocumentStatus::PartiallyCompleted);
    // the zone in flight finishes its attempt
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    assert_eq!(report.zones[1].outcome, ZoneOutcome::Incomplete);
    assert_eq!(report.zones[2].outcome, ZoneOutcome::Incomplete);
    assert_eq!(report.stats.incomplete, 2);
    assert_eq!(orchestrator.zone(zones[2].id).unwrap().status, ZoneStatus::Pending);
    assert_eq!(
        orchestrator.document_status(document_id).unwrap(),
        DocumentStatus::PartiallyCompleted
    );
}

#[tokio::test]
async fn test_document_timeout() {
    let zones = (0..2).map(|_| text_zone()).collect::<Vec<_>>();
    let recordings = zones
        .iter()
        .map(|z| {
            Recording::output("alpha", z.id, text(TEXT), Some(0.9))
                .with_delay(Duration::from_millis(200))
        })
        .collect();
    let orchestrator = orchestrator(
        PipelineConfig {
            max_concurrent_zones: 1,
            document_timeout_ms: Some(50),
            ..config()
        },
        recordings,
    );
    let document_id = register(&orchestrator, zones);

    let report = run(&orchestrator, document_id).await;
    assert!(report.timed_out);
    assert!(report.cancelled);
    assert_eq!(report.status, DocumentStatus::PartiallyCompleted);
    assert_eq!(report.zones[1].outcome, ZoneOutcome::Incomplete);
}

#[tokio::test]
async fn test_manual_override_is_skipped_unless_forced() {
    let locked = text_zone();
    let open = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", locked.id, text(TEXT), Some(0.9)),
            Recording::output("alpha", open.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![locked.clone(), open.clone()]);
    orchestrator.set_manual_override(locked.id, true).unwrap();

    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.status, DocumentStatus::Completed);
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Skipped);
    assert_eq!(report.stats.skipped, 1);
    assert!(orchestrator.merged_result(locked.id).is_none());
    assert_eq!(
        orchestrator.zone(locked.id).unwrap().status,
        ZoneStatus::ManualOverride
    );

    let refused = orchestrator
        .reprocess_zone(locked.id, ReprocessOptions::default())
        .await;
    assert!(matches!(
        refused,
        Err(OrchestratorError::ManualOverrideLocked(id)) if id == locked.id
    ));

    let forced = orchestrator
        .reprocess_zone(
            locked.id,
            ReprocessOptions {
                tools: None,
                force: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(forced.report.outcome, ZoneOutcome::Accepted);
    assert!(orchestrator.merged_result(locked.id).is_some());

    let summary = orchestrator.zone_summary(document_id).unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.by_status.get("completed"), Some(&2));
    assert_eq!(summary.by_type.get("text"), Some(&2));
}

#[tokio::test]
async fn test_second_run_while_processing_is_refused() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![Recording::output("alpha", zone.id, text(TEXT), Some(0.9))
            .with_delay(Duration::from_millis(100))],
    );
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let run = orchestrator
        .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
        .unwrap();
    let second = orchestrator.process_document(document_id, Arc::new(PerformanceSnapshot::default()));
    assert!(matches!(second, Err(OrchestratorError::AlreadyProcessing(_))));
    assert!(matches!(
        orchestrator
            .reprocess_zone(zone.id, ReprocessOptions::default())
            .await,
        Err(OrchestratorError::ZoneBusy(_))
    ));

    run.report.await.unwrap();
    assert!(orchestrator
        .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
        .is_ok());
}

#[tokio::test]
async fn test_ledger_collects_outcomes() {
    let zone = text_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::crash("alpha", zone.id, "segfault"),
            Recording::output("beta", zone.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![zone]);
    run(&orchestrator, document_id).await;

    let snapshot = orchestrator.ledger().unwrap().snapshot();
    let alpha = snapshot.stats(&ToolId::new("alpha"), ZoneType::Text).unwrap();
    let beta = snapshot.stats(&ToolId::new("beta"), ZoneType::Text).unwrap();
    assert_eq!((alpha.attempts, alpha.successes), (1, 0));
    assert_eq!((beta.attempts, beta.successes), (1, 1));
}

#[tokio::test]
async fn test_table_reject_then_accept() {
    let zone = table_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", zone.id, table(), Some(0.3)),
            Recording::output("beta", zone.id, table(), Some(0.85)),
        ],
    );
    orchestrator.set_threshold(ZoneType::Table, 0.4, 0.8).unwrap();
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);

    let history = orchestrator.attempt_history(zone.id);
    assert_eq!(
        history.iter().map(|a| a.decision).collect::<Vec<_>>(),
        vec![ThresholdDecision::Reject, ThresholdDecision::Accept]
    );
    let merged = orchestrator.merged_result(zone.id).unwrap();
    assert_eq!(merged.merge_strategy, MergeStrategy::SingleAccept);
    assert_eq!(merged.contributing_tools, vec![ToolId::new("beta")]);
    assert_eq!(merged.content, table());
}

#[tokio::test]
async fn test_table_borderlines_keep_the_best() {
    let zone = table_zone();
    let orchestrator = orchestrator(
        config(),
        vec![
            Recording::output("alpha", zone.id, table(), Some(0.6)),
            Recording::output("beta", zone.id, table(), Some(0.5)),
        ],
    );
    orchestrator.set_threshold(ZoneType::Table, 0.4, 0.8).unwrap();
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Exhausted);
    assert_eq!(report.zones[0].attempts, 2);

    let history = orchestrator.attempt_history(zone.id);
    assert_eq!(
        history.iter().map(|a| a.decision).collect::<Vec<_>>(),
        vec![ThresholdDecision::Borderline, ThresholdDecision::Borderline]
    );
    let merged = orchestrator.merged_result(zone.id).unwrap();
    assert_eq!(merged.merge_strategy, MergeStrategy::BestEffortBorderline);
    assert_eq!(merged.contributing_tools, vec![ToolId::new("alpha")]);
    assert_eq!(merged.final_confidence, history[0].score.value);
}

#[tokio::test]
async fn test_override_set_during_run_is_respected() {
    let first = text_zone();
    let second = text_zone();
    let orchestrator = orchestrator(
        PipelineConfig {
            max_concurrent_zones: 1,
            ..config()
        },
        vec![
            Recording::output("alpha", first.id, text(TEXT), Some(0.9))
                .with_delay(Duration::from_millis(200)),
            Recording::output("alpha", second.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![first.clone(), second.clone()]);

    let mut run = orchestrator
        .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
        .unwrap();
    let started = run.events.next().await.unwrap();
    assert_eq!(started.zone_id, first.id);
    // still waiting for a worker
    orchestrator.set_manual_override(second.id, true).unwrap();

    let mut skipped = vec![];
    while let Some(event) = run.events.next().await {
        if event.kind == ZoneEventKind::Skipped {
            skipped.push(event.zone_id);
        }
    }
    let report = run.report.await.unwrap();
    assert_eq!(skipped, vec![second.id]);
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    assert_eq!(report.zones[1].outcome, ZoneOutcome::Skipped);
    assert!(orchestrator.merged_result(second.id).is_none());
    assert_eq!(
        orchestrator.zone(second.id).unwrap().status,
        ZoneStatus::ManualOverride
    );
}

#[tokio::test]
async fn test_cancel_keeps_prior_zone_status() {
    let slow = text_zone();
    let done = text_zone();
    let locked = text_zone();
    let orchestrator = orchestrator(
        PipelineConfig {
            max_concurrent_zones: 1,
            ..config()
        },
        vec![
            Recording::output("alpha", slow.id, text(TEXT), Some(0.9))
                .with_delay(Duration::from_millis(200)),
            Recording::output("alpha", done.id, text(TEXT), Some(0.9)),
            Recording::output("alpha", locked.id, text(TEXT), Some(0.9)),
        ],
    );
    let document_id = register(&orchestrator, vec![slow.clone(), done.clone(), locked.clone()]);
    run(&orchestrator, document_id).await;
    orchestrator.set_manual_override(locked.id, true).unwrap();

    let mut run = orchestrator
        .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
        .unwrap();
    let started = run.events.next().await.unwrap();
    assert_eq!(started.zone_id, slow.id);
    run.cancel();
    while run.events.next().await.is_some() {}
    let report = run.report.await.unwrap();

    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    assert_eq!(report.zones[1].outcome, ZoneOutcome::Incomplete);
    assert_eq!(report.zones[2].outcome, ZoneOutcome::Skipped);
    // the earlier result is still current for the zone that wasn't reached
    assert_eq!(orchestrator.zone(done.id).unwrap().status, ZoneStatus::Completed);
    assert!(orchestrator.merged_result(done.id).is_some());
    assert_eq!(
        orchestrator.zone(locked.id).unwrap().status,
        ZoneStatus::ManualOverride
    );
}

/// Tracks how many invocations run at the same time.
struct Gauge {
    id: &'static str,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn new(id: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct Gauged(Arc<Gauge>);

#[async_trait]
impl ExtractionTool for Gauged {
    fn id(&self) -> ToolId {
        ToolId::new(self.0.id)
    }

    async fn extract(
        &self,
        _zone: &Zone,
        _page: Option<&PageContent>,
    ) -> Result<ToolOutput, ExtractionFailure> {
        let running = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.0.delay).await;
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ToolOutput::new(text(TEXT)).with_confidence(0.9))
    }
}

fn gauged_orchestrator(config: PipelineConfig, gauge: &Arc<Gauge>) -> EnhancedOrchestrator {
    let registry = ToolRegistry::new().with_tool(Arc::new(Gauged(gauge.clone())));
    EnhancedOrchestrator::new(config, registry, None).unwrap()
}

#[tokio::test]
async fn test_document_run_refused_while_zone_reprocesses() {
    let zone = text_zone();
    let gauge = Gauge::new("alpha", Duration::from_millis(150));
    let orchestrator = gauged_orchestrator(config(), &gauge);
    let document_id = register(&orchestrator, vec![zone.clone()]);

    let reprocess = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let zone_id = zone.id;
        async move {
            orchestrator
                .reprocess_zone(zone_id, ReprocessOptions::default())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let refused = orchestrator.process_document(document_id, Arc::new(PerformanceSnapshot::default()));
    assert!(matches!(refused, Err(OrchestratorError::ZoneBusy(id)) if id == zone.id));
    // the refusal leaves the document free for a later run
    assert_eq!(
        orchestrator.document_status(document_id).unwrap(),
        DocumentStatus::Queued
    );

    let reprocessed = reprocess.await.unwrap().unwrap();
    assert_eq!(reprocessed.report.outcome, ZoneOutcome::Accepted);
    let report = run(&orchestrator, document_id).await;
    assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    assert_eq!(gauge.peak(), 1);
}

#[tokio::test]
async fn test_tool_capacity_spans_documents() {
    let gauge = Gauge::new("alpha", Duration::from_millis(50));
    let orchestrator = gauged_orchestrator(
        PipelineConfig {
            tool_capacity: 1,
            ..config()
        },
        &gauge,
    );
    let runs = (0..3)
        .map(|_| {
            let document_id = register(&orchestrator, vec![text_zone()]);
            orchestrator
                .process_document(document_id, Arc::new(PerformanceSnapshot::default()))
                .unwrap()
        })
        .collect::<Vec<_>>();

    for run in runs {
        let report = run.report.await.unwrap();
        assert_eq!(report.zones[0].outcome, ZoneOutcome::Accepted);
    }
    assert_eq!(gauge.peak(), 1);
}

#[test]
fn test_unknown_zone_and_document() {
    let orchestrator = orchestrator(config(), vec![]);
    assert!(matches!(
        orchestrator.zones(Uuid::new_v4()),
        Err(OrchestratorError::DocumentNotFound(_))
    ));
    assert!(matches!(
        orchestrator.set_manual_override(Uuid::new_v4(), true),
        Err(OrchestratorError::ZoneNotFound(_))
    ));
    assert!(orchestrator.attempt_history(Uuid::new_v4()).is_empty());
}
