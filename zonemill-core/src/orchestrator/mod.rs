use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Instant,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};
use uuid::Uuid;

use crate::{
    assign::{PerformanceLedger, PerformanceSnapshot},
    confidence::ConfidenceEngine,
    config::PipelineConfig,
    entities::{
        DocumentID, MergedResult, PageContent, PageNumber, RunID, RunMetadata, ToolId, Zone,
        ZoneID, ZoneStatus, ZoneType,
    },
    error::OrchestratorError,
    extract::{ExtractionExecutor, ToolRegistry},
    threshold::{EffectiveThreshold, ThresholdManager},
};

mod progress;
mod report;
mod store;
mod zone;

pub use progress::{Progress, ProgressTracker, ZonePhase};
pub use report::{
    derive_status, DocumentReport, DocumentStatus, ProcessingStats, ZoneEventKind, ZoneOutcome,
    ZoneReport, ZoneStatusEvent, ZoneSummary,
};
pub use store::{AttemptSummary, ResultStore, RunHistory};

use zone::{process_zone, RunContext};

/// A document as handed over by upstream zone detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    #[serde(default = "Uuid::new_v4")]
    pub id: DocumentID,
    pub name: String,
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub pages: Vec<PageContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReprocessOptions {
    /// Restrict the candidates to these tools, in matrix order.
    #[serde(default)]
    pub tools: Option<Vec<ToolId>>,
    /// Reprocess even if the zone is under manual override.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct ReprocessResult {
    pub run_id: RunID,
    pub report: ZoneReport,
    /// Result published by this run, if any.
    pub merged: Option<MergedResult>,
}

/// Handle on a running document.
///
/// `events` ends once every zone task is done; `report` resolves after that.
pub struct DocumentRun {
    pub run_id: RunID,
    pub events: UnboundedReceiverStream<ZoneStatusEvent>,
    pub report: JoinHandle<DocumentReport>,
    cancel: CancellationToken,
    progress: Arc<ProgressTracker>,
}

impl DocumentRun {
    /// Stops dispatching zones. Zones in flight finish their current attempt
    /// and are reported incomplete.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress.snapshot()
    }
}

pub(crate) struct DocumentEntry {
    pub id: DocumentID,
    pub name: String,
    zones: RwLock<Vec<Zone>>,
    pages: HashMap<PageNumber, Arc<PageContent>>,
    processing: AtomicBool,
    last_status: RwLock<Option<DocumentStatus>>,
}

impl DocumentEntry {
    fn new(input: DocumentInput) -> Self {
        let zones = input
            .zones
            .into_iter()
            .map(|mut zone| {
                zone.document_id = input.id;
                zone
            })
            .collect();
        let pages = input
            .pages
            .into_iter()
            .map(|page| (page.page, Arc::new(page)))
            .collect();
        Self {
            id: input.id,
            name: input.name,
            zones: RwLock::new(zones),
            pages,
            processing: AtomicBool::new(false),
            last_status: RwLock::new(None),
        }
    }

    pub fn zones(&self) -> Vec<Zone> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn zone(&self, zone_id: ZoneID) -> Option<Zone> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|z| z.id == zone_id)
            .cloned()
    }

    pub fn page(&self, page: PageNumber) -> Option<Arc<PageContent>> {
        self.pages.get(&page).cloned()
    }

    fn update_zone<T>(&self, zone_id: ZoneID, f: impl FnOnce(&mut Zone) -> T) -> Option<T> {
        self.zones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .find(|z| z.id == zone_id)
            .map(f)
    }

    pub fn set_zone_status(&self, zone_id: ZoneID, status: ZoneStatus) {
        self.update_zone(zone_id, |z| z.set_status(status));
    }

    /// Keeps an inferred type on the zone so later runs reuse it.
    pub fn set_zone_type(&self, zone_id: ZoneID, zone_type: ZoneType) {
        self.update_zone(zone_id, |z| {
            z.zone_type = Some(zone_type);
            z.type_confidence = None;
        });
    }

    /// Marks the zone as processing, unless it already is or is locked.
    ///
    /// Returns the claimed zone and the status it had before.
    fn claim_zone(&self, zone_id: ZoneID, force: bool) -> Result<(Zone, ZoneStatus), OrchestratorError> {
        self.update_zone(zone_id, |z| match z.status {
            ZoneStatus::Processing => Err(OrchestratorError::ZoneBusy(zone_id)),
            ZoneStatus::ManualOverride if !force => {
                Err(OrchestratorError::ManualOverrideLocked(zone_id))
            }
            previous => {
                z.set_status(ZoneStatus::Processing);
                Ok((z.clone(), previous))
            }
        })
        .unwrap_or(Err(OrchestratorError::ZoneNotFound(zone_id)))
    }

    fn busy_zone(&self) -> Option<ZoneID> {
        self.zones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|z| z.status == ZoneStatus::Processing)
            .map(|z| z.id)
    }

    fn status(&self) -> DocumentStatus {
        if self.processing.load(Ordering::Acquire) {
            return DocumentStatus::Processing;
        }
        self.last_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(DocumentStatus::Queued)
    }

    fn finish(&self, status: DocumentStatus) {
        *self
            .last_status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
        self.processing.store(false, Ordering::Release);
    }
}

pub(crate) struct Shared {
    pub config: PipelineConfig,
    pub registry: Arc<ToolRegistry>,
    pub engine: ConfidenceEngine,
    pub thresholds: ThresholdManager,
    pub store: ResultStore,
    pub ledger: Option<Arc<PerformanceLedger>>,
    /// Bounds tool invocations across all runs and reprocesses.
    tool_limit: Arc<Semaphore>,
    documents: RwLock<HashMap<DocumentID, Arc<DocumentEntry>>>,
    zone_owner: RwLock<HashMap<ZoneID, DocumentID>>,
    last_history: RwLock<Arc<PerformanceSnapshot>>,
}

/// Runs documents through analysis, tool assignment, fallback and merging,
/// and keeps the results.
#[derive(Clone)]
pub struct EnhancedOrchestrator {
    shared: Arc<Shared>,
}

impl EnhancedOrchestrator {
    pub fn new(
        config: PipelineConfig,
        registry: ToolRegistry,
        ledger: Option<Arc<PerformanceLedger>>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let unregistered = config
            .matrix
            .tools()
            .filter(|tool| registry.get(tool).is_none())
            .unique()
            .join(", ");
        if !unregistered.is_empty() {
            tracing::warn!("No registered tool for {unregistered}, attempts will be reported unavailable");
        }

        let shared = Shared {
            engine: ConfidenceEngine::new(config.confidence.clone()),
            thresholds: ThresholdManager::new(config.thresholds.clone()),
            registry: Arc::new(registry),
            store: ResultStore::new(),
            ledger,
            tool_limit: Arc::new(Semaphore::new(config.tool_capacity.max(1))),
            documents: RwLock::new(HashMap::new()),
            zone_owner: RwLock::new(HashMap::new()),
            last_history: RwLock::new(Arc::new(PerformanceSnapshot::default())),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn ledger(&self) -> Option<&Arc<PerformanceLedger>> {
        self.shared.ledger.as_ref()
    }

    fn executor(&self) -> ExtractionExecutor {
        ExtractionExecutor::with_limit(
            self.shared.registry.clone(),
            self.shared.tool_limit.clone(),
        )
    }

    fn document(&self, document_id: DocumentID) -> Result<Arc<DocumentEntry>, OrchestratorError> {
        self.shared
            .documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&document_id)
            .cloned()
            .ok_or(OrchestratorError::DocumentNotFound(document_id))
    }

    fn owner_of(&self, zone_id: ZoneID) -> Result<Arc<DocumentEntry>, OrchestratorError> {
        let document_id = self
            .shared
            .zone_owner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&zone_id)
            .copied()
            .ok_or(OrchestratorError::ZoneNotFound(zone_id))?;
        self.document(document_id)
    }

    /// Registers (or replaces) a document. Zones are re-parented to it.
    pub fn register_document(&self, input: DocumentInput) -> Result<DocumentID, OrchestratorError> {
        let document_id = input.id;
        if let Ok(existing) = self.document(document_id) {
            if existing.processing.load(Ordering::Acquire) {
                return Err(OrchestratorError::AlreadyProcessing(document_id));
            }
        }

        let entry = Arc::new(DocumentEntry::new(input));
        let zone_ids = entry.zones().iter().map(|z| z.id).collect::<Vec<_>>();
        tracing::info!(
            "Registered document {} ({document_id}) with {} zones and {} pages",
            entry.name,
            zone_ids.len(),
            entry.pages.len()
        );
        {
            let mut owners = self
                .shared
                .zone_owner
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for zone_id in zone_ids {
                owners.insert(zone_id, document_id);
            }
        }
        self.shared
            .documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id, entry);
        Ok(document_id)
    }

    /// Starts processing every zone of the document in the background.
    ///
    /// `history` is read-only for the whole run. Must be called inside a tokio runtime.
    pub fn process_document(
        &self,
        document_id: DocumentID,
        history: Arc<PerformanceSnapshot>,
    ) -> Result<DocumentRun, OrchestratorError> {
        let document = self.document(document_id)?;
        if document
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyProcessing(document_id));
        }
        // a reprocess still holds one of the zones
        if let Some(zone_id) = document.busy_zone() {
            document.processing.store(false, Ordering::Release);
            return Err(OrchestratorError::ZoneBusy(zone_id));
        }
        *self
            .shared
            .last_history
            .write()
            .unwrap_or_else(PoisonError::into_inner) = history.clone();

        let zones = document.zones();
        let progress = Arc::new(ProgressTracker::new(zones.iter().map(|z| z.id)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let run_id = Uuid::new_v4();

        let ctx = Arc::new(RunContext {
            executor: self.executor(),
            shared: self.shared.clone(),
            document,
            run_id,
            history,
            progress: progress.clone(),
            events: Some(events_tx),
            cancel: cancel.clone(),
            only: None,
        });
        let report = tokio::spawn(run_document(ctx, zones).in_current_span());

        Ok(DocumentRun {
            run_id,
            events: UnboundedReceiverStream::new(events_rx),
            report,
            cancel,
            progress,
        })
    }

    /// Runs one zone again and publishes a superseding result.
    ///
    /// Uses the history snapshot of the last document run.
    pub async fn reprocess_zone(
        &self,
        zone_id: ZoneID,
        options: ReprocessOptions,
    ) -> Result<ReprocessResult, OrchestratorError> {
        let document = self.owner_of(zone_id)?;
        if document.processing.load(Ordering::Acquire) {
            return Err(OrchestratorError::ZoneBusy(zone_id));
        }
        let (zone, previous) = document.claim_zone(zone_id, options.force)?;
        let history = self
            .shared
            .last_history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let run_id = Uuid::new_v4();
        let ctx = Arc::new(RunContext {
            executor: self.executor(),
            shared: self.shared.clone(),
            document,
            run_id,
            history,
            progress: Arc::new(ProgressTracker::new([zone_id])),
            events: None,
            cancel: CancellationToken::new(),
            only: options.tools,
        });
        let report = process_zone(ctx, zone, previous).await;
        let merged = self
            .shared
            .store
            .current(zone_id)
            .filter(|m| m.run_id == run_id);
        tracing::info!(
            "Reprocessed zone {zone_id}: {:?} after {} attempts",
            report.outcome,
            report.attempts
        );
        Ok(ReprocessResult {
            run_id,
            report,
            merged,
        })
    }

    pub fn merged_result(&self, zone_id: ZoneID) -> Option<MergedResult> {
        self.shared.store.current(zone_id)
    }

    pub fn superseded_results(&self, zone_id: ZoneID) -> Vec<MergedResult> {
        self.shared.store.superseded(zone_id)
    }

    /// Attempts of the zone's most recent run, in order.
    pub fn attempt_history(&self, zone_id: ZoneID) -> Vec<AttemptSummary> {
        self.shared.store.latest_attempts(zone_id)
    }

    pub fn run_histories(&self, zone_id: ZoneID) -> Vec<RunHistory> {
        self.shared.store.runs(zone_id)
    }

    pub fn set_threshold(
        &self,
        zone_type: ZoneType,
        reject_below: f32,
        accept_above: f32,
    ) -> Result<(), OrchestratorError> {
        Ok(self
            .shared
            .thresholds
            .set_threshold(zone_type, reject_below, accept_above)?)
    }

    pub fn set_document_threshold(
        &self,
        document_id: DocumentID,
        zone_type: ZoneType,
        reject_below: f32,
        accept_above: f32,
    ) -> Result<(), OrchestratorError> {
        self.document(document_id)?;
        Ok(self.shared.thresholds.set_document_threshold(
            document_id,
            zone_type,
            reject_below,
            accept_above,
        )?)
    }

    pub fn effective_thresholds(
        &self,
        document_id: DocumentID,
    ) -> Result<Vec<EffectiveThreshold>, OrchestratorError> {
        self.document(document_id)?;
        Ok(self.shared.thresholds.effective_thresholds(document_id))
    }

    pub fn document_status(&self, document_id: DocumentID) -> Result<DocumentStatus, OrchestratorError> {
        Ok(self.document(document_id)?.status())
    }

    pub fn zones(&self, document_id: DocumentID) -> Result<Vec<Zone>, OrchestratorError> {
        Ok(self.document(document_id)?.zones())
    }

    pub fn zone(&self, zone_id: ZoneID) -> Result<Zone, OrchestratorError> {
        self.owner_of(zone_id)?
            .zone(zone_id)
            .ok_or(OrchestratorError::ZoneNotFound(zone_id))
    }

    /// Locks a zone against document runs, or releases the lock.
    ///
    /// A released zone goes back to completed if it has a result, pending otherwise.
    pub fn set_manual_override(&self, zone_id: ZoneID, enabled: bool) -> Result<(), OrchestratorError> {
        let document = self.owner_of(zone_id)?;
        let has_result = self.shared.store.current(zone_id).is_some();
        document
            .update_zone(zone_id, |z| match (z.status, enabled) {
                (ZoneStatus::Processing, _) => Err(OrchestratorError::ZoneBusy(zone_id)),
                (_, true) => {
                    z.set_status(ZoneStatus::ManualOverride);
                    Ok(())
                }
                (ZoneStatus::ManualOverride, false) => {
                    z.set_status(if has_result {
                        ZoneStatus::Completed
                    } else {
                        ZoneStatus::Pending
                    });
                    Ok(())
                }
                _ => Ok(()),
            })
            .unwrap_or(Err(OrchestratorError::ZoneNotFound(zone_id)))
    }

    pub fn zone_summary(&self, document_id: DocumentID) -> Result<ZoneSummary, OrchestratorError> {
        let zones = self.zones(document_id)?;
        let by_type = zones
            .iter()
            .map(|z| z.zone_type.map_or("unknown", |t| t.as_str()).to_owned())
            .counts()
            .into_iter()
            .collect();
        let by_status = zones
            .iter()
            .map(|z| z.status.as_str().to_owned())
            .counts()
            .into_iter()
            .collect();
        let confidences = zones
            .iter()
            .filter_map(|z| self.shared.store.current(z.id))
            .map(|m| m.final_confidence)
            .collect::<Vec<_>>();
        let average_confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f32>() / confidences.len() as f32);

        Ok(ZoneSummary {
            total: zones.len(),
            by_type,
            by_status,
            average_confidence,
        })
    }
}

#[instrument(skip_all, fields(document_id = %ctx.document.id, run_id = %ctx.run_id))]
async fn run_document(ctx: Arc<RunContext>, zones: Vec<Zone>) -> DocumentReport {
    let start_time = Instant::now();
    let config = &ctx.shared.config;
    let expected = zones
        .iter()
        .map(|z| (z.id, z.zone_type))
        .collect::<Vec<_>>();

    let timed_out = Arc::new(AtomicBool::new(false));
    let finished = CancellationToken::new();
    if let Some(budget) = config.document_timeout() {
        let cancel = ctx.cancel.clone();
        let finished = finished.clone();
        let timed_out = timed_out.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(budget) => {
                        tracing::warn!("Document budget of {}ms spent, cancelling", budget.as_millis());
                        timed_out.store(true, Ordering::Release);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                    _ = finished.cancelled() => {}
                }
            }
            .in_current_span(),
        );
    }
    // stops the watchdog when the run ends
    let _finished = finished.drop_guard();

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_zones));
    let mut set = JoinSet::new();
    let mut reports = Vec::with_capacity(zones.len());
    let mut claimed = HashMap::new();

    for zone in zones {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        // the zone may have been locked or reprocessed since the run started
        let (zone, previous) = match ctx.document.claim_zone(zone.id, false) {
            Ok(claim) => claim,
            Err(OrchestratorError::ManualOverrideLocked(zone_id)) => {
                ctx.skip(zone_id, zone.zone_type, &mut reports);
                continue;
            }
            Err(e) => {
                tracing::warn!("zone {} not dispatched: {e}", zone.id);
                continue;
            }
        };
        claimed.insert(zone.id, previous);
        let ctx = ctx.clone();
        set.spawn(
            async move {
                let _permit = permit;
                process_zone(ctx, zone, previous).await
            }
            .in_current_span(),
        );
    }

    while let Some(result) = set.join_next().await {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => tracing::error!("Error processing zone : {e:?}"),
        }
    }

    // Zones never dispatched keep their status, zones whose task died get
    // back the status they had before the run
    let reported = reports.iter().map(|r| r.zone_id).collect::<HashSet<_>>();
    for (zone_id, zone_type) in &expected {
        if reported.contains(zone_id) {
            continue;
        }
        match claimed.get(zone_id) {
            Some(previous) => {
                if ctx.progress.phase(*zone_id) == Some(ZonePhase::Processing) {
                    ctx.progress.finish(*zone_id, ZonePhase::Incomplete);
                }
                ctx.document.set_zone_status(*zone_id, *previous);
            }
            None if ctx.document.zone(*zone_id).map(|z| z.status) == Some(ZoneStatus::ManualOverride) => {
                ctx.skip(*zone_id, *zone_type, &mut reports);
                continue;
            }
            None => {}
        }
        reports.push(ZoneReport::bare(*zone_id, *zone_type, ZoneOutcome::Incomplete));
    }

    let order = expected
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (*id, i))
        .collect::<HashMap<_, _>>();
    reports.sort_by_key(|r| order.get(&r.zone_id).copied().unwrap_or(usize::MAX));

    let status = derive_status(&reports);
    let duration = start_time.elapsed();
    let stats = ProcessingStats::from_zones(&reports, duration);
    ctx.document.finish(status);

    tracing::info!(
        "Document {} {status} in {}ms: {}/{} zones accepted",
        ctx.document.name,
        duration.as_millis(),
        stats.completed,
        stats.total_zones
    );

    DocumentReport {
        document_id: ctx.document.id,
        name: ctx.document.name.clone(),
        run_id: ctx.run_id,
        status,
        cancelled: ctx.cancel.is_cancelled(),
        timed_out: timed_out.load(Ordering::Acquire),
        zones: reports,
        stats,
        metadata: RunMetadata::new(duration),
    }
}
