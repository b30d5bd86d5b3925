//! Generation Orchestrator
//!
//! Drives each job through Request Builder, Transport, Codec and Asset Sink,
//! one task per job. The job registry sits behind a single mutex and is only
//! written from here; callers get [`JobSnapshot`] copies.
//!
//! Admission is FIFO: one admission task takes jobs off a queue in
//! submission order and hands each a permit from a semaphore sized by
//! [`GeneratorConfig::max_concurrent_jobs`]. A slot holds at most one
//! non-terminal job; what happens to a second submission depends on
//! [`SlotPolicy`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::cancel::{CancelHandle, CancelToken, cancel_pair};
use crate::codec::{self, DecodeLimits, PixelBuffer};
use crate::config::{GeneratorConfig, SlotPolicy};
use crate::error::{JobError, OrchestratorError, TransportError};
use crate::job::{Job, JobEvent, JobId, JobSnapshot, JobState};
use crate::request::RequestBuilder;
use crate::sink::{AssetMetadata, AssetSink};
use crate::spec::GenerationSpec;
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 256;

/// Why the pipeline stopped before reaching the sink.
enum Halt {
    Cancelled,
    Failed(JobError),
    /// The registry refused a transition; someone else already finished the job
    Stale,
}

struct Entry {
    job: Job,
    cancel: CancelHandle,
    /// Latest snapshot, republished on every transition
    state_tx: watch::Sender<JobSnapshot>,
}

/// A submitted job waiting for admission.
struct Ticket {
    id: JobId,
    spec: GenerationSpec,
    cancel: CancelToken,
    /// Superseded job that must finish first
    predecessor: Option<watch::Receiver<JobSnapshot>>,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobId, Entry>,
    /// Slot key to the newest job submitted for it
    slots: HashMap<String, JobId>,
}

struct Inner {
    config: GeneratorConfig,
    builder: RequestBuilder,
    limits: DecodeLimits,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn AssetSink>,
    permits: Arc<Semaphore>,
    admission: OnceLock<mpsc::UnboundedSender<Ticket>>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<JobEvent>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: GeneratorConfig, transport: Arc<dyn Transport>, sink: Arc<dyn AssetSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            builder: RequestBuilder::new(&config),
            limits: DecodeLimits {
                max_dimension: config.max_decoded_dimension,
            },
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            transport,
            sink,
            admission: OnceLock::new(),
            registry: Mutex::new(Registry::default()),
            events,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.inner.config
    }

    /// Register a job and queue it for admission. Must run inside a tokio runtime.
    pub fn submit(&self, spec: GenerationSpec) -> Result<JobId, OrchestratorError> {
        let slot = spec.slot_key();
        let id = JobId::new();
        let (cancel, token) = cancel_pair();
        let job = Job::new(id, spec.clone(), slot.clone());
        let (state_tx, _) = watch::channel(job.snapshot());

        {
            let mut registry = self.inner.lock();
            registry.evict_expired(&self.inner.config);

            let mut predecessor = None;
            if let Some(prev_id) = registry.slots.get(&slot).copied() {
                let busy = registry
                    .jobs
                    .get(&prev_id)
                    .is_some_and(|entry| !entry.job.state.is_terminal());
                if busy {
                    match self.inner.config.slot_policy {
                        SlotPolicy::Reject => {
                            debug!("Rejecting job for busy slot '{}'", slot);
                            return Err(OrchestratorError::SlotBusy { slot, job: prev_id });
                        }
                        SlotPolicy::Supersede => {
                            info!("Job {} supersedes {} on slot '{}'", id, prev_id, slot);
                            predecessor = registry.jobs.get(&prev_id).map(|e| e.state_tx.subscribe());
                            self.inner.cancel_locked(&mut registry, prev_id);
                        }
                    }
                }
            }

            registry.jobs.insert(id, Entry { job, cancel, state_tx });
            registry.slots.insert(slot.clone(), id);
            self.inner.emit(id, JobState::Created);

            // queued under the registry lock so queue order is submission order
            let ticket = Ticket {
                id,
                spec,
                cancel: token,
                predecessor,
            };
            if self.admission().send(ticket).is_err() {
                self.inner
                    .transition_locked(&mut registry, id, JobState::Failed, |job| job.error = Some(JobError::ShutDown));
            }
        }

        info!("Job {} created for slot '{}'", id, slot);
        Ok(id)
    }

    /// Queue feeding the admission task, started on first use.
    fn admission(&self) -> &mpsc::UnboundedSender<Ticket> {
        self.inner.admission.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(admit(Arc::downgrade(&self.inner), self.inner.permits.clone(), rx));
            tx
        })
    }

    pub fn status(&self, id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        let mut registry = self.inner.lock();
        registry.evict_expired(&self.inner.config);
        registry
            .jobs
            .get(&id)
            .map(|entry| entry.job.snapshot())
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Request cancellation. Jobs not yet past `Building` are cancelled at once;
    /// later ones stop at their next suspension point. Terminal jobs are left alone.
    pub fn cancel(&self, id: JobId) -> Result<(), OrchestratorError> {
        let mut registry = self.inner.lock();
        if !registry.jobs.contains_key(&id) {
            return Err(OrchestratorError::NotFound(id));
        }
        self.inner.cancel_locked(&mut registry, id);
        Ok(())
    }

    /// Wait for the job to reach a terminal state. The final snapshot is
    /// returned even if the job is evicted in the meantime.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        let state_rx = {
            let registry = self.inner.lock();
            registry
                .jobs
                .get(&id)
                .map(|entry| entry.state_tx.subscribe())
                .ok_or(OrchestratorError::NotFound(id))?
        };
        terminal(state_rx).await.ok_or(OrchestratorError::NotFound(id))
    }

    /// Hand over a terminal job's final snapshot and drop it from the registry.
    pub fn take(&self, id: JobId) -> Result<JobSnapshot, OrchestratorError> {
        let mut registry = self.inner.lock();
        let finished = registry
            .jobs
            .get(&id)
            .map(|entry| entry.job.state.is_terminal())
            .ok_or(OrchestratorError::NotFound(id))?;
        if !finished {
            return Err(OrchestratorError::NotTerminal(id));
        }
        let entry = registry.jobs.remove(&id).ok_or(OrchestratorError::NotFound(id))?;
        Ok(entry.job.snapshot())
    }

    /// All known jobs, newest first.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let registry = self.inner.lock();
        let mut jobs: Vec<JobSnapshot> = registry.jobs.values().map(|e| e.job.snapshot()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Drop terminal jobs older than the retention window. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        self.inner.lock().evict_expired(&self.inner.config)
    }

    /// Cancel every job that has not finished.
    pub fn shutdown(&self) {
        let mut registry = self.inner.lock();
        let ids: Vec<JobId> = registry.jobs.keys().copied().collect();
        for id in ids {
            self.inner.cancel_locked(&mut registry, id);
        }
        info!("Orchestrator shut down");
    }
}

impl Registry {
    fn evict_expired(&mut self, config: &GeneratorConfig) -> usize {
        let retention = chrono::Duration::from_std(config.retention).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs
            .retain(|_, entry| !(entry.job.state.is_terminal() && now - entry.job.updated_at > retention));
        let evicted = before - self.jobs.len();
        if evicted > 0 {
            debug!("Evicted {} expired jobs", evicted);
        }
        evicted
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, id: JobId, state: JobState) {
        // no subscribers is fine
        let _ = self.events.send(JobEvent {
            id,
            state,
            at: Utc::now(),
        });
    }

    fn cancel_locked(&self, registry: &mut Registry, id: JobId) {
        let Some(entry) = registry.jobs.get(&id) else {
            return;
        };
        if entry.job.state.is_terminal() {
            return;
        }
        entry.cancel.cancel();
        if matches!(entry.job.state, JobState::Created | JobState::Building) {
            self.transition_locked(registry, id, JobState::Cancelled, |_| {});
        } else {
            debug!("Job {} flagged for cancellation in {}", id, entry.job.state);
        }
    }

    /// Apply `next` plus any field updates. Returns false if the transition is illegal.
    fn transition_locked(
        &self,
        registry: &mut Registry,
        id: JobId,
        next: JobState,
        update: impl FnOnce(&mut Job),
    ) -> bool {
        let Some(entry) = registry.jobs.get_mut(&id) else {
            return false;
        };
        let previous = entry.job.state;
        if !entry.job.advance(next) {
            debug!("Job {} ignored transition {} -> {}", id, previous, next);
            return false;
        }
        update(&mut entry.job);
        entry.state_tx.send_replace(entry.job.snapshot());
        self.emit(id, next);

        match next {
            JobState::Failed => warn!(
                "Job {} failed in {}: {}",
                id,
                previous,
                entry.job.error.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
            _ => info!("Job {} {} -> {}", id, previous, next),
        }

        if next.is_terminal() && registry.slots.get(&entry.job.slot) == Some(&id) {
            let slot = entry.job.slot.clone();
            registry.slots.remove(&slot);
        }
        true
    }

    fn transition(&self, id: JobId, next: JobState, update: impl FnOnce(&mut Job)) -> bool {
        let mut registry = self.lock();
        self.transition_locked(&mut registry, id, next, update)
    }

    fn enter(&self, id: JobId, next: JobState) -> Result<(), Halt> {
        if self.transition(id, next, |_| {}) {
            Ok(())
        } else {
            Err(Halt::Stale)
        }
    }

    fn record_attempts(&self, id: JobId, attempts: u32) {
        if let Some(entry) = self.lock().jobs.get_mut(&id) {
            entry.job.attempts = attempts;
        }
    }

    fn fail(&self, id: JobId, error: JobError) {
        self.transition(id, JobState::Failed, |job| job.error = Some(error));
    }

    /// Fire the job's cancel flag without touching its state.
    fn interrupt(&self, id: JobId) {
        if let Some(entry) = self.lock().jobs.get(&id) {
            entry.cancel.cancel();
        }
    }

    /// Building through entering Committing. Bounded by the job deadline.
    async fn prepare(
        &self,
        id: JobId,
        spec: &GenerationSpec,
        cancel: &CancelToken,
    ) -> Result<(PixelBuffer, AssetMetadata), Halt> {
        self.enter(id, JobState::Building)?;
        let request = self
            .builder
            .build(spec)
            .map_err(|e| Halt::Failed(JobError::Build(e)))?;

        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        self.enter(id, JobState::Sending)?;
        let delivery = match self.transport.send(request, cancel.clone()).await {
            Ok(delivery) => delivery,
            Err(failure) => {
                self.record_attempts(id, failure.attempts);
                return Err(match failure.error {
                    TransportError::Cancelled => Halt::Cancelled,
                    _ => Halt::Failed(failure.into()),
                });
            }
        };
        self.record_attempts(id, delivery.attempts);

        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        self.enter(id, JobState::Decoding)?;
        let pixels = codec::decode(delivery.payload, &self.limits).map_err(|e| Halt::Failed(e.into()))?;

        if cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let (destination, name) = spec.target();
        let metadata = AssetMetadata {
            name: format!("{}{}", self.config.texture_prefix, name),
            destination,
            generated_at: Utc::now(),
            spec_hash: spec.hash(),
            width: pixels.width,
            height: pixels.height,
            source_format: pixels.source_format,
        };
        self.enter(id, JobState::Committing)?;
        Ok((pixels, metadata))
    }

    async fn commit(&self, id: JobId, pixels: PixelBuffer, metadata: AssetMetadata) {
        let path = metadata.object_path();
        match self.sink.commit(pixels, metadata).await {
            Ok(identity) => {
                info!("Job {} committed {} ({})", id, identity.path, identity.id);
                self.transition(id, JobState::Completed, |job| job.asset = Some(identity));
            }
            Err(e) => {
                warn!("Job {} could not commit {}: {}", id, path, e);
                self.fail(id, JobError::Sink(e));
            }
        }
    }
}

/// Final snapshot of the watched job, or `None` if its entry vanished first.
async fn terminal(mut state_rx: watch::Receiver<JobSnapshot>) -> Option<JobSnapshot> {
    state_rx
        .wait_for(|snapshot| snapshot.state.is_terminal())
        .await
        .ok()
        .map(|snapshot| snapshot.clone())
}

/// Hands out permits strictly in queue order.
async fn admit(inner: Weak<Inner>, permits: Arc<Semaphore>, mut queue: mpsc::UnboundedReceiver<Ticket>) {
    while let Some(ticket) = queue.recv().await {
        let admitted = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => None,
            permit = permits.clone().acquire_owned() => Some(permit),
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match admitted {
            Some(Ok(permit)) => {
                tokio::spawn(supervise(inner, ticket, permit));
            }
            Some(Err(_)) => inner.fail(ticket.id, JobError::ShutDown),
            None => {
                inner.transition(ticket.id, JobState::Cancelled, |_| {});
            }
        }
    }
}

/// Run the job on its own task so a panic fails the job instead of stranding it.
async fn supervise(inner: Arc<Inner>, ticket: Ticket, permit: OwnedSemaphorePermit) {
    let id = ticket.id;
    if let Err(e) = tokio::spawn(run_job(inner.clone(), ticket, permit)).await {
        warn!("Job {} task ended abnormally: {}", id, e);
        inner.fail(id, JobError::Aborted(e.to_string()));
    }
}

async fn run_job(inner: Arc<Inner>, ticket: Ticket, _permit: OwnedSemaphorePermit) {
    let Ticket {
        id,
        spec,
        cancel,
        predecessor,
    } = ticket;

    // a superseded job must be terminal before its replacement may start
    if let Some(previous) = predecessor {
        tokio::select! {
            _ = terminal(previous) => {}
            _ = cancel.cancelled() => {}
        }
    }

    let deadline = inner.config.job_deadline;
    let work = inner.prepare(id, &spec, &cancel);
    tokio::pin!(work);

    let prepared = tokio::select! {
        prepared = &mut work => prepared,
        _ = tokio::time::sleep(deadline) => {
            // let the pipeline stop at its next suspension point so attempts are recorded
            inner.interrupt(id);
            let _ = work.await;
            let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
            inner.transition(id, JobState::Failed, |job| {
                job.error = Some(JobError::DeadlineExceeded {
                    deadline_ms,
                    attempts: job.attempts,
                })
            });
            return;
        }
    };

    match prepared {
        Ok((pixels, metadata)) => inner.commit(id, pixels, metadata).await,
        Err(Halt::Cancelled) => {
            inner.transition(id, JobState::Cancelled, |_| {});
        }
        Err(Halt::Failed(error)) => inner.fail(id, error),
        Err(Halt::Stale) => debug!("Job {} stopped, already finished elsewhere", id),
    }
}
