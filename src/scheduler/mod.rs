//! The monitoring scheduler.
//!
//! One long-running control loop is maintained per active task, each owning
//! an isolated store session. A tick publishes a check request and advances
//! `next_check` exactly once, unconditionally: the advance never waits for
//! the worker result, which decouples scheduling cadence from worker
//! latency and guarantees forward progress under downstream outages.
//!
//! Loops recover locally from tick failures with a safe `next_check`
//! advance on an independent session. A loop that fails too many ticks in a
//! row crashes into a bounded, backed-off recovery task that respawns it
//! while the task is still active.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{publish_with_retry, BusError, MessageBus, CHECK_REQUESTS_QUEUE},
    config::{AppConfig, RetryPolicy},
    models::messages::CheckRequest,
    persistence::{PersistenceError, Session, Store},
};

/// Errors surfaced by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A store operation failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A bus operation failed after exhausting its retry policy.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A check request could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Scheduler tunables, extracted from the application configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Floor applied to task check intervals.
    pub min_check_interval: Duration,
    /// Consecutive tick failures before the loop crashes into recovery.
    pub max_consecutive_errors: u32,
    /// Pause after a failed tick before the loop tries again.
    pub error_backoff: Duration,
    /// Backoff schedule for respawning a crashed loop.
    pub recovery: RetryPolicy,
    /// Retry policy for publishing check requests.
    pub publish_retry: RetryPolicy,
}

impl SchedulerConfig {
    /// Extracts the scheduler tunables from the application configuration.
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            min_check_interval: config.min_check_interval_secs,
            max_consecutive_errors: config.max_consecutive_errors,
            error_backoff: config.loop_error_backoff_secs,
            recovery: config.recovery_retry.clone(),
            publish_retry: config.bus_publish_retry.clone(),
        }
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

struct RecoveryHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns one control loop per active task and their recovery tasks.
pub struct MonitoringScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Store,
    bus: Arc<dyn MessageBus>,
    config: SchedulerConfig,
    loops: Mutex<HashMap<i64, LoopHandle>>,
    recoveries: Mutex<HashMap<i64, RecoveryHandle>>,
    shutdown: CancellationToken,
}

impl MonitoringScheduler {
    /// Creates a scheduler. No loops run until [`start`](Self::start).
    pub fn new(store: Store, bus: Arc<dyn MessageBus>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                bus,
                config,
                loops: Mutex::new(HashMap::new()),
                recoveries: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Discovers all active tasks and spawns one loop each.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let tasks = {
            let mut session = self.inner.store.session().await?;
            session.list_tasks(true).await?
        };
        let count = tasks.len();
        for task in tasks {
            spawn_loop(&self.inner, task.id).await;
        }
        tracing::info!(active_tasks = count, "monitoring scheduler started");
        Ok(count)
    }

    /// Spawns a loop for a newly created task.
    pub async fn on_task_created(&self, task_id: i64) {
        spawn_loop(&self.inner, task_id).await;
    }

    /// Spawns a loop for a re-activated task (no-op if one is running).
    pub async fn on_task_activated(&self, task_id: i64) {
        if !spawn_loop(&self.inner, task_id).await {
            self.wake(task_id).await;
        }
    }

    /// Stops the loop of a deactivated task, cancelling its in-flight tick.
    pub async fn on_task_deactivated(&self, task_id: i64) {
        self.inner.stop_loop(task_id).await;
    }

    /// Stops the loop of a deleted task, cancelling its in-flight tick.
    pub async fn on_task_deleted(&self, task_id: i64) {
        self.inner.stop_loop(task_id).await;
    }

    /// Wakes a sleeping loop so it re-reads its task immediately.
    pub async fn wake(&self, task_id: i64) {
        if let Some(handle) = self.inner.loops.lock().await.get(&task_id) {
            handle.wake.notify_one();
        }
    }

    /// Whether a live loop exists for the task.
    pub async fn is_running(&self, task_id: i64) -> bool {
        self.inner
            .loops
            .lock()
            .await
            .get(&task_id)
            .is_some_and(|handle| !handle.join.is_finished())
    }

    /// Stops all loops, waiting up to `grace` for in-flight ticks to settle
    /// before cancelling what remains.
    pub async fn stop(&self, grace: Duration) {
        tracing::info!("stopping monitoring scheduler");
        self.inner.shutdown.cancel();

        let mut handles: Vec<JoinHandle<()>> = {
            let mut loops = self.inner.loops.lock().await;
            loops
                .drain()
                .map(|(_, handle)| {
                    handle.wake.notify_one();
                    handle.join
                })
                .collect()
        };
        {
            let mut recoveries = self.inner.recoveries.lock().await;
            handles.extend(recoveries.drain().map(|(_, handle)| handle.join));
        }

        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("grace deadline elapsed, aborting remaining task loops");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("monitoring scheduler stopped");
    }
}

enum LoopExit {
    /// Cooperative stop (shutdown or deactivation signal).
    Stopped,
    /// The loop observed a deleted or deactivated task and exited cleanly.
    Finished,
    /// The consecutive-error budget was exhausted.
    Crashed,
}

enum TickOutcome {
    /// The tick slept until the schedule (or a wake signal) and must re-read
    /// the task before publishing.
    Slept,
    /// The tick published a check and advanced the schedule.
    Published,
    /// The task is gone or inactive.
    Exit,
    /// A stop signal arrived mid-tick.
    Cancelled,
}

/// Spawns the control loop for a task unless one is already live.
/// Returns whether a new loop was spawned.
fn spawn_loop<'a>(
    inner: &'a Arc<SchedulerInner>,
    task_id: i64,
) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
    Box::pin(async move {
        let mut loops = inner.loops.lock().await;
        if let Some(existing) = loops.get(&task_id) {
            if !existing.join.is_finished() {
                tracing::debug!(task_id, "loop already running, not spawning another");
                return false;
            }
        }

        let cancel = inner.shutdown.child_token();
        let wake = Arc::new(Notify::new());
        let join = tokio::spawn(run_task_loop(
            Arc::clone(inner),
            task_id,
            cancel.clone(),
            Arc::clone(&wake),
        ));
        loops.insert(task_id, LoopHandle { cancel, wake, join });
        tracing::info!(task_id, "task loop spawned");
        true
    })
}

/// Registers a recovery task for a crashed loop unless one is pending.
fn spawn_recovery<'a>(
    inner: &'a Arc<SchedulerInner>,
    task_id: i64,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let mut recoveries = inner.recoveries.lock().await;
        if let Some(existing) = recoveries.get(&task_id) {
            if !existing.join.is_finished() {
                return;
            }
        }
        let cancel = inner.shutdown.child_token();
        let join = tokio::spawn(run_recovery(Arc::clone(inner), task_id, cancel.clone()));
        recoveries.insert(task_id, RecoveryHandle { cancel, join });
        tracing::warn!(task_id, "recovery scheduled for crashed task loop");
    })
}

impl SchedulerInner {
    /// Cancels and joins the loop (and any pending recovery) for a task.
    async fn stop_loop(&self, task_id: i64) {
        let handle = self.loops.lock().await.remove(&task_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.wake.notify_one();
            let _ = handle.join.await;
            tracing::info!(task_id, "task loop stopped");
        }

        let recovery = self.recoveries.lock().await.remove(&task_id);
        if let Some(recovery) = recovery {
            recovery.cancel.cancel();
            let _ = recovery.join.await;
        }
    }
}

async fn run_task_loop(
    inner: Arc<SchedulerInner>,
    task_id: i64,
    cancel: CancellationToken,
    wake: Arc<Notify>,
) {
    let exit = drive_loop(&inner, task_id, &cancel, &wake).await;
    inner.loops.lock().await.remove(&task_id);

    match exit {
        LoopExit::Stopped => tracing::debug!(task_id, "task loop stopped cooperatively"),
        LoopExit::Finished => tracing::info!(task_id, "task loop finished"),
        LoopExit::Crashed => {
            tracing::error!(task_id, "task loop crashed after repeated tick failures");
            if !cancel.is_cancelled() {
                spawn_recovery(&inner, task_id).await;
            }
        }
    }
}

async fn drive_loop(
    inner: &Arc<SchedulerInner>,
    task_id: i64,
    cancel: &CancellationToken,
    wake: &Notify,
) -> LoopExit {
    // The loop's dedicated session; replaced with a fresh one after errors.
    let mut session = match inner.store.session().await {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(task_id, error = %error, "could not open the loop session");
            return LoopExit::Crashed;
        }
    };

    let mut consecutive_errors: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return LoopExit::Stopped;
        }

        match run_tick(inner, &mut session, task_id, cancel, wake).await {
            // Only a completed publish-and-advance cycle counts as a clean
            // tick; waking from a sleep does not clear the error budget.
            Ok(TickOutcome::Published) => consecutive_errors = 0,
            Ok(TickOutcome::Slept) => {}
            Ok(TickOutcome::Exit) => return LoopExit::Finished,
            Ok(TickOutcome::Cancelled) => return LoopExit::Stopped,
            Err(error) => {
                consecutive_errors += 1;
                tracing::error!(
                    task_id,
                    consecutive_errors,
                    error = %error,
                    "tick failed"
                );
                safe_advance(inner, task_id).await;
                if consecutive_errors >= inner.config.max_consecutive_errors {
                    return LoopExit::Crashed;
                }
                if wait_cancelled(cancel, inner.config.error_backoff).await {
                    return LoopExit::Stopped;
                }
                // Retry on a fresh session; the old one may carry broken
                // transaction state.
                match inner.store.session().await {
                    Ok(fresh) => session = fresh,
                    Err(error) => {
                        tracing::error!(task_id, error = %error, "could not reopen the loop session");
                    }
                }
            }
        }
    }
}

async fn run_tick(
    inner: &Arc<SchedulerInner>,
    session: &mut Session,
    task_id: i64,
    cancel: &CancellationToken,
    wake: &Notify,
) -> Result<TickOutcome, SchedulerError> {
    let Some(task) = session.fetch_task(task_id).await? else {
        tracing::info!(task_id, "task deleted, loop exiting");
        return Ok(TickOutcome::Exit);
    };
    if !task.is_active {
        tracing::info!(task_id, "task deactivated, loop exiting");
        return Ok(TickOutcome::Exit);
    }

    let now = Utc::now();
    if now < task.next_check {
        let sleep_for = (task.next_check - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TickOutcome::Cancelled),
            _ = wake.notified() => return Ok(TickOutcome::Slept),
            _ = tokio::time::sleep(sleep_for) => return Ok(TickOutcome::Slept),
        }
    }

    // Due: publish the check request, then advance the schedule in a single
    // UPDATE. The advance is unconditional and does not wait for the worker.
    let request = CheckRequest::new(task.id, task.url.clone(), task.filters.clone());
    let payload = serde_json::to_vec(&request)?;
    publish_with_retry(
        inner.bus.as_ref(),
        &inner.config.publish_retry,
        CHECK_REQUESTS_QUEUE,
        &payload,
    )
    .await?;

    let next_check = now + task.effective_interval(inner.config.min_check_interval);
    session.advance_schedule(task.id, now, next_check).await?;
    tracing::debug!(
        task_id,
        correlation_id = %request.correlation_id,
        next_check = %next_check,
        "check request published, schedule advanced"
    );
    Ok(TickOutcome::Published)
}

/// Attempts a minimal `next_check` advance on an independent session so a
/// failing task cannot be rescheduled into a hot loop.
async fn safe_advance(inner: &Arc<SchedulerInner>, task_id: i64) {
    let result: Result<(), PersistenceError> = async {
        let mut session = inner.store.session().await?;
        if let Some(task) = session.fetch_task(task_id).await? {
            let next_check = Utc::now() + task.effective_interval(inner.config.min_check_interval);
            session.reschedule(task_id, next_check).await?;
        }
        Ok(())
    }
    .await;
    if let Err(error) = result {
        tracing::warn!(task_id, error = %error, "safe advance of next_check failed");
    }
}

async fn run_recovery(inner: Arc<SchedulerInner>, task_id: i64, cancel: CancellationToken) {
    let policy = inner.config.recovery.clone();
    for attempt in 0..policy.max_attempts {
        let delay = policy.delay_for(attempt);
        if wait_cancelled(&cancel, delay).await {
            break;
        }

        let lookup = async {
            let mut session = inner.store.session().await?;
            session.fetch_task(task_id).await
        }
        .await;

        match lookup {
            Ok(Some(task)) if task.is_active => {
                tracing::info!(task_id, attempt, "recovery respawning task loop");
                spawn_loop(&inner, task_id).await;
                break;
            }
            Ok(_) => {
                tracing::info!(task_id, "task gone or inactive, recovery abandoned");
                break;
            }
            Err(error) => {
                tracing::warn!(task_id, attempt, error = %error, "recovery attempt failed");
            }
        }
    }
    inner.recoveries.lock().await.remove(&task_id);
}

/// Sleeps for `delay` unless cancelled first; returns whether it was
/// cancelled.
async fn wait_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
