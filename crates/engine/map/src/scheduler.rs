//! Debounced generation scheduling
//!
//! Interactive callers submit requests as fast as sliders move. The scheduler
//! waits for the input to go quiet, starts one generation for the newest
//! request and cancels everything older. Only a generation that is still
//! current when it finishes may publish its model.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{MapError, MapResult};
use crate::pipeline::{GeneratedModel, GenerationContext, GenerationRequest, Pipeline};

struct RegistryInner {
    next_id: u64,
    contexts: VecDeque<Arc<GenerationContext>>,
}

/// Bounded history of generation contexts
///
/// Starting a generation cancels every context still in flight, and
/// publication re-checks cancellation under the same lock, so a superseded
/// generation can never overwrite a newer one.
pub struct GenerationRegistry {
    capacity: usize,
    inner: Mutex<RegistryInner>,
}

impl GenerationRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                contexts: VecDeque::new(),
            }),
        }
    }

    /// Cancel all in-flight generations and register a new one
    pub fn begin(&self) -> Arc<GenerationContext> {
        let mut inner = self.inner.lock();
        for ctx in &inner.contexts {
            ctx.cancel();
        }
        let ctx = Arc::new(GenerationContext::new(inner.next_id));
        inner.next_id += 1;
        inner.contexts.push_back(Arc::clone(&ctx));
        while inner.contexts.len() > self.capacity {
            inner.contexts.pop_front();
        }
        ctx
    }

    /// Store `model` on `ctx` and run `notify` unless the context was cancelled
    ///
    /// Returns whether the model was published.
    pub fn publish<F>(&self, ctx: &GenerationContext, model: Arc<GeneratedModel>, notify: F) -> bool
    where
        F: FnOnce(Arc<GeneratedModel>),
    {
        let _guard = self.inner.lock();
        if ctx.is_cancelled() {
            return false;
        }
        ctx.set_result(Arc::clone(&model));
        notify(model);
        true
    }

    pub fn get(&self, id: u64) -> Option<Arc<GenerationContext>> {
        self.inner
            .lock()
            .contexts
            .iter()
            .find(|ctx| ctx.id() == id)
            .cloned()
    }

    /// Most recent context that produced a model
    pub fn latest(&self) -> Option<Arc<GeneratedModel>> {
        self.inner
            .lock()
            .contexts
            .iter()
            .rev()
            .find_map(|ctx| ctx.result())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().contexts.is_empty()
    }

    pub fn cancel_all(&self) {
        for ctx in &self.inner.lock().contexts {
            ctx.cancel();
        }
    }
}

type ModelSlot = Option<Arc<GeneratedModel>>;

/// Runs generations in the background with debouncing
pub struct GenerationScheduler {
    requests: mpsc::UnboundedSender<GenerationRequest>,
    output: watch::Receiver<ModelSlot>,
    registry: Arc<GenerationRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl GenerationScheduler {
    /// Start the scheduler loop on the current runtime
    pub fn spawn(pipeline: Arc<Pipeline>, config: &SchedulerConfig) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (tx, output) = watch::channel(None);
        let registry = Arc::new(GenerationRegistry::new(config.registry_capacity));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_loop(
            pipeline,
            Arc::clone(&registry),
            rx,
            Arc::new(tx),
            config.debounce(),
            shutdown.clone(),
        ));

        Self {
            requests,
            output,
            registry,
            shutdown,
            task,
        }
    }

    /// Queue a request; it runs once no newer request arrives for the quiet period
    pub fn submit(&self, request: GenerationRequest) -> MapResult<()> {
        self.requests
            .send(request)
            .map_err(|_| MapError::Worker("scheduler has stopped".to_string()))
    }

    /// Receiver that changes whenever a generation publishes
    pub fn subscribe(&self) -> watch::Receiver<ModelSlot> {
        self.output.clone()
    }

    /// Last published model
    pub fn latest(&self) -> ModelSlot {
        self.output.borrow().clone()
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        &self.registry
    }

    /// Stop accepting requests, run the last pending one and wait for it
    pub async fn finish(self) -> MapResult<()> {
        let Self { requests, task, .. } = self;
        drop(requests);
        task.await?;
        Ok(())
    }

    /// Cancel everything and wait for the loop to exit
    pub async fn shutdown(self) -> MapResult<()> {
        self.shutdown.cancel();
        self.task.await?;
        Ok(())
    }
}

async fn run_loop(
    pipeline: Arc<Pipeline>,
    registry: Arc<GenerationRegistry>,
    mut rx: mpsc::UnboundedReceiver<GenerationRequest>,
    output: Arc<watch::Sender<ModelSlot>>,
    quiet: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: Option<(GenerationRequest, Instant)> = None;
    let mut running = JoinSet::new();
    let mut closed = false;

    loop {
        if closed && pending.is_none() {
            break;
        }
        let deadline = pending.as_ref().map(|(_, at)| *at);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = rx.recv(), if !closed => match received {
                Some(request) => {
                    debug!("generation request queued");
                    pending = Some((request, Instant::now() + quiet));
                }
                None => {
                    closed = true;
                    // Senders are gone; start the last request right away
                    if let Some((_, at)) = pending.as_mut() {
                        *at = Instant::now();
                    }
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((request, _)) = pending.take() {
                    start(&mut running, &pipeline, &registry, &output, request);
                }
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "generation task panicked");
                }
            }
        }
    }

    if shutdown.is_cancelled() {
        registry.cancel_all();
    }
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "generation task panicked");
        }
    }
    debug!("scheduler stopped");
}

fn start(
    running: &mut JoinSet<()>,
    pipeline: &Arc<Pipeline>,
    registry: &Arc<GenerationRegistry>,
    output: &Arc<watch::Sender<ModelSlot>>,
    request: GenerationRequest,
) {
    let ctx = registry.begin();
    let pipeline = Arc::clone(pipeline);
    let registry = Arc::clone(registry);
    let output = Arc::clone(output);

    running.spawn(async move {
        match pipeline.generate(&request, &ctx).await {
            Ok(model) => {
                let triangles = model.mesh.triangle_count();
                let published = registry.publish(&ctx, Arc::new(model), |model| {
                    output.send_replace(Some(model));
                });
                if published {
                    info!(id = ctx.id(), triangles, "generation published");
                } else {
                    debug!(id = ctx.id(), "generation superseded before publishing");
                }
            }
            Err(MapError::Cancelled) => debug!(id = ctx.id(), "generation cancelled"),
            Err(e) => warn!(id = ctx.id(), error = %e, "generation failed"),
        }
    });
}
