//! Job manager - admission, bounded execution and tracking of dump and
//! migration jobs.
//!
//! Every job gets its own task. The task waits for a slot of its kind's
//! [`WorkerPool`] or for its cancellation token, whichever comes first. State
//! transitions are made while holding the job's table entry, so a cancel and
//! an admission can never both win. A running job publishes its terminal
//! state before it gives its slot back.

pub mod events;
pub mod model;
pub mod pool;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dump::DumpEngine;
use crate::history::JobHistory;
use crate::migrate::MigrationEngine;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::remote::RemoteClient;
use crate::store::DumpStore;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::normalize_page_id;
pub use events::{JobEvent, EVENT_CAPACITY};
pub use model::{Job, JobError, JobKind, JobOutput, JobParams, JobState};
pub use pool::{Slot, Ticket, WorkerPool};

/// Tunables of a [`JobManager`].
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub max_dump: usize,
    pub max_migrate: usize,
    /// Wall-clock limit for a single job
    pub deadline: Option<Duration>,
    /// Public prefix under which the dump root is served
    pub static_base_url: String,
    /// Where finished jobs are logged; `None` disables the log
    pub history_dir: Option<PathBuf>,
}

impl JobSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_dump: config.jobs.max_dump,
            max_migrate: config.jobs.max_migrate,
            deadline: config.jobs.deadline(),
            static_base_url: config.storage.static_base_url.clone(),
            history_dir: Some(config.storage.history_dir.clone()),
        }
    }
}

/// Owner used while a dump directory is being deleted.
const DELETE_CLAIM: Uuid = Uuid::nil();

/// How long an engine gets to wind down after its deadline.
const DEADLINE_GRACE: Duration = Duration::from_secs(30);

struct TrackedJob {
    job: Job,
    cancel: CancellationToken,
}

/// Engine failure plus whatever the engine produced before failing.
struct Failure {
    error: EngineError,
    output: Option<JobOutput>,
}

impl From<EngineError> for Failure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            output: None,
        }
    }
}

struct Inner {
    jobs: DashMap<Uuid, TrackedJob>,
    /// Dump name to the job that owns the directory
    claims: DashMap<String, Uuid>,
    dump_pool: WorkerPool,
    migrate_pool: WorkerPool,
    dump_engine: DumpEngine,
    migrate_engine: MigrationEngine,
    store: DumpStore,
    static_base_url: String,
    deadline: Option<Duration>,
    history: Option<JobHistory>,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(client: Arc<dyn RemoteClient>, store: DumpStore, settings: JobSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            jobs: DashMap::new(),
            claims: DashMap::new(),
            dump_pool: WorkerPool::new(JobKind::Dump, settings.max_dump),
            migrate_pool: WorkerPool::new(JobKind::Migrate, settings.max_migrate),
            dump_engine: DumpEngine::new(client.clone()),
            migrate_engine: MigrationEngine::new(client),
            store,
            static_base_url: settings.static_base_url,
            deadline: settings.deadline,
            history: settings.history_dir.map(JobHistory::new),
            events,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn store(&self) -> &DumpStore {
        &self.inner.store
    }

    pub fn history(&self) -> Option<&JobHistory> {
        self.inner.history.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a dump of `page_id` (id or share URL).
    pub async fn submit_dump(&self, page_id: &str) -> Result<Job> {
        let page_id = normalize_page_id(page_id)?;
        self.ensure_accepting()?;
        Ok(self.track(Job::new(JobParams::Dump { page_id })))
    }

    /// Queue a migration of a complete dump under `target_page_id`.
    pub async fn submit_migrate(&self, dump_name: &str, target_page_id: &str) -> Result<Job> {
        let target_page_id = normalize_page_id(target_page_id)?;
        DumpStore::validate_name(dump_name)?;
        self.ensure_accepting()?;

        let job = Job::new(JobParams::Migrate {
            dump_name: dump_name.to_string(),
            target_page_id,
        });
        self.claim(dump_name, job.id)?;

        let checked = match self.inner.store.open(dump_name).await {
            Ok(dump) => dump.ensure_complete(),
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            self.release(dump_name, job.id);
            return Err(e);
        }
        Ok(self.track(job))
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Conflict("job manager is shutting down".into()));
        }
        Ok(())
    }

    fn track(&self, job: Job) -> Job {
        let id = job.id;
        let cancel = self.inner.shutdown.child_token();
        self.inner.jobs.insert(
            id,
            TrackedJob {
                job: job.clone(),
                cancel: cancel.clone(),
            },
        );
        // Taken before spawning so admission follows submission order.
        let ticket = self.inner.pool(job.kind).enqueue();
        self.inner.emit(JobEvent::Added(job.clone()));
        info!(job_id = %id, kind = %job.kind, "Job submitted");

        self.inner.tasks.spawn(run_job(self.inner.clone(), id, ticket, cancel));
        job
    }

    /// All tracked jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.inner.jobs.get(&id).map(|e| e.job.clone())
    }

    /// Cancel a job. Pending jobs end at once; running jobs are signalled and
    /// end `cancelled` when the engine notices.
    pub fn cancel(&self, id: Uuid) -> Result<Job> {
        let mut entry = self
            .inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("job {id}")))?;

        match entry.job.state {
            JobState::Pending => {
                entry.cancel.cancel();
                entry.job.cancel_requested = true;
                transition(&mut entry.job, JobState::Cancelled, "Cancelled before start");
                self.inner.emit(JobEvent::State(entry.job.clone()));
                info!(job_id = %id, "Pending job cancelled");
            }
            JobState::Running => {
                if !entry.job.cancel_requested {
                    entry.job.cancel_requested = true;
                    entry.job.message = "Cancelling".to_string();
                    entry.cancel.cancel();
                    self.inner.emit(JobEvent::CancelRequested { job_id: id });
                    info!(job_id = %id, "Cancellation requested");
                }
            }
            state => {
                return Err(EngineError::Conflict(format!(
                    "job {id} already {state}"
                )))
            }
        }
        Ok(entry.job.clone())
    }

    /// Forget a finished job. Jobs still pending or running are kept.
    pub fn remove(&self, id: Uuid) -> Result<Job> {
        match self
            .inner
            .jobs
            .remove_if(&id, |_, tracked| tracked.job.state.is_terminal())
        {
            Some((_, tracked)) => {
                self.inner.emit(JobEvent::Removed { job_id: id });
                debug!(job_id = %id, "Job removed");
                Ok(tracked.job)
            }
            None if self.inner.jobs.contains_key(&id) => Err(EngineError::Conflict(format!(
                "job {id} is still active"
            ))),
            None => Err(EngineError::NotFound(format!("job {id}"))),
        }
    }

    pub fn running_count(&self, kind: JobKind) -> usize {
        self.count(kind, JobState::Running)
    }

    pub fn pending_count(&self, kind: JobKind) -> usize {
        self.count(kind, JobState::Pending)
    }

    fn count(&self, kind: JobKind, state: JobState) -> usize {
        self.inner
            .jobs
            .iter()
            .filter(|e| e.job.kind == kind && e.job.state == state)
            .count()
    }

    pub fn pool_size(&self, kind: JobKind) -> usize {
        self.inner.pool(kind).size()
    }

    /// True while jobs of `kind` are queued or every slot is taken.
    pub fn is_saturated(&self, kind: JobKind) -> bool {
        self.pending_count(kind) > 0 || self.running_count(kind) >= self.pool_size(kind)
    }

    /// Delete a dump unless a job owns it.
    pub async fn delete_dump(&self, name: &str) -> Result<()> {
        DumpStore::validate_name(name)?;
        self.claim(name, DELETE_CLAIM)?;
        let result = self.inner.store.delete(name).await;
        self.release(name, DELETE_CLAIM);
        result
    }

    fn claim(&self, name: &str, owner: Uuid) -> Result<()> {
        claim(&self.inner, name, owner)
    }

    fn release(&self, name: &str, owner: Uuid) {
        release(&self.inner, name, owner)
    }

    /// Stop admitting, cancel everything and wait for the job tasks to end.
    pub async fn shutdown(&self) {
        info!("Shutting down job manager");
        self.inner.shutdown.cancel();
        self.inner.dump_pool.close();
        self.inner.migrate_pool.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("All jobs stopped");
    }
}

impl Inner {
    fn pool(&self, kind: JobKind) -> &WorkerPool {
        match kind {
            JobKind::Dump => &self.dump_pool,
            JobKind::Migrate => &self.migrate_pool,
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

fn claim(inner: &Inner, name: &str, owner: Uuid) -> Result<()> {
    match inner.claims.entry(name.to_string()) {
        Entry::Occupied(held) if *held.get() != owner => Err(EngineError::Conflict(format!(
            "dump {name} is in use by another job"
        ))),
        Entry::Occupied(_) => Ok(()),
        Entry::Vacant(slot) => {
            slot.insert(owner);
            Ok(())
        }
    }
}

fn release(inner: &Inner, name: &str, owner: Uuid) {
    inner.claims.remove_if(name, |_, holder| *holder == owner);
}

/// Move a job along the state machine; refuses edges the machine forbids.
fn transition(job: &mut Job, next: JobState, message: impl Into<String>) -> bool {
    if !job.state.can_transition_to(next) {
        warn!(job_id = %job.id, from = %job.state, to = %next, "Ignored invalid transition");
        return false;
    }
    let now = Utc::now();
    match next {
        JobState::Running => job.started_at = Some(now),
        _ => job.finished_at = Some(now),
    }
    job.state = next;
    job.message = message.into();
    true
}

fn progress_sink(inner: &Arc<Inner>, id: Uuid) -> ProgressSink {
    let weak = Arc::downgrade(inner);
    Arc::new(move |event: ProgressEvent| {
        let Some(inner) = weak.upgrade() else { return };
        if let ProgressEvent::DumpStarted { name } = &event {
            if let Err(e) = claim(&inner, name, id) {
                warn!(job_id = %id, "Dump directory already claimed: {}", e);
            }
        }
        let Some(mut entry) = inner.jobs.get_mut(&id) else { return };
        match &event {
            ProgressEvent::DumpStarted { name } => {
                entry.job.output = Some(JobOutput::Dump {
                    dump_name: name.clone(),
                });
            }
            ProgressEvent::Phase(phase) => entry.job.message = phase.clone(),
            _ => {}
        }
        entry.job.progress.apply(&event);
        inner.emit(JobEvent::Progress {
            job_id: id,
            progress: entry.job.progress.clone(),
            message: entry.job.message.clone(),
        });
    })
}

async fn run_job(inner: Arc<Inner>, id: Uuid, ticket: Ticket, cancel: CancellationToken) {
    let Some(kind) = inner.jobs.get(&id).map(|e| e.job.kind) else {
        return;
    };

    let slot = ticket.wait(&cancel).await;
    let params = slot.as_ref().and_then(|_| start(&inner, id));
    let (Some(slot), Some(params)) = (slot, params) else {
        // Cancelled while pending, or shutting down; never ran.
        let job = finish_unstarted(&inner, id);
        record_history(&inner, job).await;
        return;
    };
    info!(job_id = %id, kind = %kind, "Job started");

    // The engine sees its own token so a deadline can stop it without
    // counting as a cancellation of the job.
    let run = cancel.child_token();
    let work = AssertUnwindSafe(execute(&inner, id, &params, &run)).catch_unwind();
    tokio::pin!(work);

    let mut expired = None;
    let outcome = match inner.deadline {
        Some(limit) => tokio::select! {
            outcome = &mut work => Some(outcome),
            _ = tokio::time::sleep(limit) => {
                warn!(job_id = %id, "Job exceeded its deadline of {:?}, stopping", limit);
                expired = Some(limit);
                run.cancel();
                tokio::time::timeout(DEADLINE_GRACE, &mut work).await.ok()
            }
        },
        None => Some(work.await),
    };

    let result = match outcome {
        Some(Ok(result)) => result,
        Some(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(job_id = %id, "Job panicked: {}", message);
            Err(Failure::from(EngineError::Internal(format!(
                "job panicked: {message}"
            ))))
        }
        None => {
            error!(job_id = %id, "Job ignored its deadline, abandoned");
            Err(Failure::from(EngineError::Internal(
                "job did not stop after its deadline".into(),
            )))
        }
    };
    let result = match (expired, result) {
        (Some(limit), Err(failure)) if !cancel.is_cancelled() => Err(Failure {
            error: EngineError::DeadlineExceeded(limit),
            output: failure.output,
        }),
        (_, result) => result,
    };

    let job = finish(&inner, id, &cancel, result);
    drop(slot);
    record_history(&inner, job).await;
}

/// pending -> running, unless the job was cancelled in the meantime.
fn start(inner: &Inner, id: Uuid) -> Option<JobParams> {
    let mut entry = inner.jobs.get_mut(&id)?;
    if entry.job.state != JobState::Pending
        || !transition(&mut entry.job, JobState::Running, "Running")
    {
        return None;
    }
    inner.emit(JobEvent::State(entry.job.clone()));
    Some(entry.job.params.clone())
}

async fn execute(
    inner: &Arc<Inner>,
    id: Uuid,
    params: &JobParams,
    cancel: &CancellationToken,
) -> std::result::Result<JobOutput, Failure> {
    let sink = progress_sink(inner, id);
    match params {
        JobParams::Dump { page_id } => {
            let dump = inner
                .dump_engine
                .dump(page_id, &inner.store, cancel, sink)
                .await?;
            Ok(JobOutput::Dump {
                dump_name: dump.name().to_string(),
            })
        }
        JobParams::Migrate {
            dump_name,
            target_page_id,
        } => {
            let dump = inner.store.open(dump_name).await?;
            let base = format!(
                "{}/{}",
                inner.static_base_url.trim_end_matches('/'),
                dump_name
            );
            inner
                .migrate_engine
                .migrate(&dump, target_page_id, &base, cancel, sink)
                .await
                .map(JobOutput::Migration)
                .map_err(|aborted| Failure {
                    error: aborted.error,
                    output: Some(JobOutput::Migration(aborted.report)),
                })
        }
    }
}

/// Record the terminal state and drop the job's dump claims.
fn finish(
    inner: &Inner,
    id: Uuid,
    cancel: &CancellationToken,
    result: std::result::Result<JobOutput, Failure>,
) -> Option<Job> {
    let mut entry = inner.jobs.get_mut(&id)?;
    let job = &mut entry.job;

    let moved = if cancel.is_cancelled() {
        let output = match result {
            Ok(output) => Some(output),
            Err(failure) => failure.output,
        };
        // A cancelled dump removes its directory.
        job.output = match job.kind {
            JobKind::Dump => None,
            JobKind::Migrate => output,
        };
        let message = if job.cancel_requested {
            "Cancelled"
        } else {
            "Cancelled by shutdown"
        };
        transition(job, JobState::Cancelled, message)
    } else {
        match result {
            Ok(output) => {
                job.output = Some(output);
                transition(job, JobState::Succeeded, "Completed")
            }
            Err(Failure { error, output }) => {
                if output.is_some() {
                    job.output = output;
                }
                // A stopped dump engine removes its directory.
                if job.kind == JobKind::Dump && matches!(error, EngineError::DeadlineExceeded(_)) {
                    job.output = None;
                }
                let detail = JobError::from(&error);
                warn!(job_id = %id, kind = ?detail.kind, "Job failed: {}", detail.message);
                job.error = Some(detail);
                transition(job, JobState::Failed, error.to_string())
            }
        }
    };

    if moved {
        info!(job_id = %id, state = %job.state, "Job finished");
        inner.emit(JobEvent::State(job.clone()));
    }
    inner.claims.retain(|_, owner| *owner != id);
    Some(job.clone())
}

fn finish_unstarted(inner: &Inner, id: Uuid) -> Option<Job> {
    let mut entry = inner.jobs.get_mut(&id)?;
    if entry.job.state == JobState::Pending
        && transition(&mut entry.job, JobState::Cancelled, "Cancelled by shutdown")
    {
        inner.emit(JobEvent::State(entry.job.clone()));
    }
    inner.claims.retain(|_, owner| *owner != id);
    Some(entry.job.clone())
}

async fn record_history(inner: &Inner, job: Option<Job>) {
    let (Some(history), Some(job)) = (&inner.history, job) else {
        return;
    };
    if let Err(e) = history.record(&job).await {
        warn!(job_id = %job.id, "Failed to record job history: {}", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
