use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{
    mpsc::{self, Receiver, Sender},
    oneshot, Semaphore,
};
use tracing::{Instrument, Span};

use crate::{
    entities::{BBox, ExtractionContent, PageContent, RawExtraction, ToolId, ToolMetadata, Zone},
    error::ExtractionFailure,
};

pub mod replay;

/// What a tool hands back for one zone.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: ExtractionContent,
    pub reported_confidence: Option<f32>,
    pub content_bounds: Option<BBox>,
    pub model: Option<String>,
}

impl ToolOutput {
    pub fn new(content: ExtractionContent) -> Self {
        Self {
            content,
            reported_confidence: None,
            content_bounds: None,
            model: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.reported_confidence = Some(confidence);
        self
    }
}

/// One external extraction tool (OCR engine, layout model, cloud API...).
#[async_trait]
pub trait ExtractionTool: Send + Sync {
    fn id(&self) -> ToolId;

    /// Whether dependencies, models or credentials are present.
    fn is_available(&self) -> bool {
        true
    }

    fn availability_hint(&self) -> String {
        String::new()
    }

    async fn extract(
        &self,
        zone: &Zone,
        page: Option<&PageContent>,
    ) -> Result<ToolOutput, ExtractionFailure>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolId, Arc<dyn ExtractionTool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ExtractionTool>) {
        let id = tool.id();
        if self.tools.insert(id.clone(), tool).is_some() {
            tracing::warn!("tool {id} registered twice, keeping the last one");
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn ExtractionTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, id: &ToolId) -> Option<Arc<dyn ExtractionTool>> {
        self.tools.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<ToolId> {
        let mut ids = self.tools.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

#[derive(Debug)]
struct ExtractionRequest {
    zone: Arc<Zone>,
    page: Option<Arc<PageContent>>,
    tool: ToolId,
    attempt_index: usize,
    response_tx: oneshot::Sender<Result<RawExtraction, ExtractionFailure>>,
    queue_time: Instant,
}

/// Runs tool invocations with bounded parallelism.
///
/// Requests go through a channel to a single dispatcher that holds one
/// semaphore permit per running invocation.
#[derive(Debug, Clone)]
pub struct ExtractionExecutor {
    queue: Sender<(ExtractionRequest, Span)>,
}

impl ExtractionExecutor {
    /// Must be called inside a tokio runtime.
    pub fn new(registry: Arc<ToolRegistry>, capacity: usize) -> Self {
        Self::with_limit(registry, Arc::new(Semaphore::new(capacity.max(1))))
    }

    /// Executor whose invocations count against `limit`, shared with every
    /// other executor holding the same semaphore.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_limit(registry: Arc<ToolRegistry>, limit: Arc<Semaphore>) -> Self {
        let (queue_sender, queue_receiver) = mpsc::channel(limit.available_permits().max(1));
        tokio::task::spawn(start_dispatcher(registry, limit, queue_receiver));
        Self {
            queue: queue_sender,
        }
    }

    /// Runs `tool` on `zone`, failing with [`ExtractionFailure::Timeout`] once
    /// `timeout` elapses. Time spent waiting for capacity counts.
    pub async fn execute(
        &self,
        zone: Arc<Zone>,
        page: Option<Arc<PageContent>>,
        tool: &ToolId,
        attempt_index: usize,
        timeout: Duration,
    ) -> Result<RawExtraction, ExtractionFailure> {
        let started = Instant::now();
        let (response_tx, response_rx) = oneshot::channel();
        let req = ExtractionRequest {
            zone,
            page,
            tool: tool.clone(),
            attempt_index,
            response_tx,
            queue_time: started,
        };

        let run = async {
            self.queue
                .send((req, Span::current()))
                .await
                .map_err(|_| ExtractionFailure::unavailable("extraction queue closed"))?;
            response_rx
                .await
                .map_err(|_| ExtractionFailure::crashed("tool task dropped its response"))?
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionFailure::Timeout {
                elapsed: started.elapsed(),
            }),
        }
    }
}

async fn start_dispatcher(
    registry: Arc<ToolRegistry>,
    s: Arc<Semaphore>,
    mut input_rx: Receiver<(ExtractionRequest, Span)>,
) {
    while let Some((req, span)) = input_rx.recv().await {
        let queue_time = req.queue_time.elapsed().as_millis();
        let tool = req.tool.clone();
        tracing::debug!("extraction request for {tool} queued for {queue_time}ms");
        let _guard = span.enter();
        tokio::spawn(handle_request(s.clone(), registry.clone(), req).in_current_span());
    }
}

async fn handle_request(s: Arc<Semaphore>, registry: Arc<ToolRegistry>, req: ExtractionRequest) {
    let ExtractionRequest {
        zone,
        page,
        tool,
        attempt_index,
        mut response_tx,
        ..
    } = req;

    let Ok(_permit) = s.acquire().await else {
        let _ = response_tx.send(Err(ExtractionFailure::unavailable("executor shut down")));
        return;
    };
    if response_tx.is_closed() {
        return;
    }

    let result = tokio::select! {
        result = run_tool(&registry, &zone, page.as_deref(), &tool, attempt_index) => result,
        // requester timed out or went away, stop the tool
        _ = response_tx.closed() => {
            tracing::debug!("abandoning {tool} on zone {}", zone.id);
            return;
        }
    };
    let _ = response_tx.send(result);
}

async fn run_tool(
    registry: &ToolRegistry,
    zone: &Zone,
    page: Option<&PageContent>,
    tool_id: &ToolId,
    attempt_index: usize,
) -> Result<RawExtraction, ExtractionFailure> {
    let tool = registry
        .get(tool_id)
        .ok_or_else(|| ExtractionFailure::unavailable(format!("tool {tool_id} not registered")))?;
    if !tool.is_available() {
        return Err(ExtractionFailure::unavailable(format!(
            "{tool_id} ({})",
            tool.availability_hint()
        )));
    }

    let start = Instant::now();
    let output = AssertUnwindSafe(tool.extract(zone, page))
        .catch_unwind()
        .await
        .map_err(|_| ExtractionFailure::crashed(format!("{tool_id} panicked")))??;
    let duration = start.elapsed();
    tracing::debug!(
        "{tool_id} extracted zone {} in {}ms",
        zone.id,
        duration.as_millis()
    );

    Ok(RawExtraction {
        tool: tool_id.clone(),
        content: output.content,
        metadata: ToolMetadata {
            duration,
            reported_confidence: output.reported_confidence,
            content_bounds: output.content_bounds,
            model: output.model,
        },
        zone_id: zone.id,
        attempt_index,
    })
}
