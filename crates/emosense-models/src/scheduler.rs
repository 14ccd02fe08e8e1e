//! Background work coordinator.
//!
//! Units of work are registered under a unique name. Enqueuing a name that is
//! already known cancels the previous unit and starts the new one only after
//! the old one has stopped, so two units with the same name never overlap.
//! Each name owns a replay-latest [`watch`] channel that outlives individual
//! units, letting observers subscribe before, during or after a run.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::conditions::DeviceConditions;
use crate::types::CancelFlag;

/// Lifecycle of a unit of work as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Waiting to start, or waiting out a retry backoff.
    Enqueued,
    /// Waiting for device constraints to be met.
    Blocked,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkState::Succeeded | WorkState::Failed | WorkState::Cancelled
        )
    }
}

/// Latest known state of a named unit of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkInfo {
    pub state: WorkState,
    /// Fraction in `[0.0, 1.0]` while running.
    pub progress: f32,
    pub attempt: u32,
}

impl WorkInfo {
    fn new(state: WorkState, attempt: u32) -> Self {
        Self {
            state,
            progress: 0.0,
            attempt,
        }
    }

    /// Single-number progress: `1.0` succeeded, `-1.0` failed, the running
    /// fraction while running, `0.0` otherwise.
    pub fn progress_value(&self) -> f32 {
        match self.state {
            WorkState::Succeeded => 1.0,
            WorkState::Failed => -1.0,
            WorkState::Running => self.progress,
            _ => 0.0,
        }
    }
}

/// Result of one execution of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Success,
    /// Transient failure, eligible for another attempt after backoff.
    Retry(String),
    /// Terminal failure; the next triggering event starts over.
    Failure(String),
    Cancelled,
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `initial * 2^(attempt - 1)`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
    /// `step * attempt`, capped at `max`.
    Linear { step: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
            Backoff::Linear { step, max } => step.saturating_mul(attempt).min(max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(5 * 60 * 60),
            },
            max_attempts: 3,
        }
    }
}

/// Preconditions a unit needs before each attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub requires_network: bool,
    pub requires_battery_not_low: bool,
    pub requires_storage_not_low: bool,
}

impl Constraints {
    pub fn update_check() -> Self {
        Self {
            requires_network: true,
            requires_battery_not_low: true,
            requires_storage_not_low: false,
        }
    }

    pub fn download() -> Self {
        Self {
            requires_network: true,
            requires_battery_not_low: false,
            requires_storage_not_low: true,
        }
    }

    fn satisfied_by(&self, conditions: &dyn DeviceConditions) -> bool {
        (!self.requires_network || conditions.network_connected())
            && (!self.requires_battery_not_low || !conditions.battery_low())
            && (!self.requires_storage_not_low || !conditions.storage_low())
    }
}

type WorkFn = Arc<dyn Fn(WorkContext) -> BoxFuture<'static, WorkOutcome> + Send + Sync>;

/// A unit of work to register under a unique name.
pub struct WorkRequest {
    name: String,
    period: Option<Duration>,
    constraints: Constraints,
    retry: RetryPolicy,
    work: WorkFn,
}

impl WorkRequest {
    pub fn one_shot<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkOutcome> + Send + 'static,
    {
        Self {
            name: name.into(),
            period: None,
            constraints: Constraints::default(),
            retry: RetryPolicy::default(),
            work: Arc::new(move |ctx| -> BoxFuture<'static, WorkOutcome> { Box::pin(work(ctx)) }),
        }
    }

    /// Runs immediately, then once per `interval` until cancelled.
    pub fn periodic<F, Fut>(name: impl Into<String>, interval: Duration, work: F) -> Self
    where
        F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkOutcome> + Send + 'static,
    {
        Self {
            period: Some(interval),
            ..Self::one_shot(name, work)
        }
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Handle passed to each attempt of a unit of work.
pub struct WorkContext {
    slot: Arc<Slot>,
    generation: u64,
    cancel: CancelFlag,
    attempt: u32,
}

impl WorkContext {
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Publish running progress; ignored once the unit has been superseded.
    pub fn set_progress(&self, fraction: f32) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.slot.publish(
            self.generation,
            WorkInfo {
                state: WorkState::Running,
                progress: fraction.clamp(0.0, 1.0),
                attempt: self.attempt,
            },
        );
    }
}

/// Per-name observable state. `generation` identifies the unit allowed to publish.
struct Slot {
    tx: watch::Sender<WorkInfo>,
    generation: Mutex<u64>,
}

impl Slot {
    fn new() -> Self {
        let (tx, _) = watch::channel(WorkInfo::new(WorkState::Enqueued, 0));
        Self {
            tx,
            generation: Mutex::new(0),
        }
    }

    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the slot for a new unit and reset its state.
    fn advance(&self) -> u64 {
        let mut current = self.generation();
        *current += 1;
        self.tx.send_replace(WorkInfo::new(WorkState::Enqueued, 0));
        *current
    }

    fn publish(&self, generation: u64, info: WorkInfo) {
        let current = self.generation();
        if *current == generation {
            self.tx.send_replace(info);
        }
    }
}

struct ActiveUnit {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// Finished, unobserved slots kept around so late observers still see the outcome.
const RETAINED_FINISHED: usize = 16;

struct Entry {
    slot: Arc<Slot>,
    active: Option<ActiveUnit>,
    /// Registry order of the last enqueue (or creation); older slots are pruned first.
    seq: u64,
}

impl Entry {
    fn is_busy(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.handle.is_finished())
    }

    fn is_observed(&self) -> bool {
        self.slot.tx.receiver_count() > 0
    }
}

/// Drop slots that nothing runs or watches: never-run slots at once, finished
/// ones beyond the most recent [`RETAINED_FINISHED`].
fn prune(entries: &mut HashMap<String, Entry>) {
    entries.retain(|_, e| e.is_busy() || e.is_observed() || e.slot.tx.borrow().state.is_terminal());

    let mut finished: Vec<(u64, String)> = entries
        .iter()
        .filter(|(_, e)| !e.is_busy() && !e.is_observed())
        .map(|(name, e)| (e.seq, name.clone()))
        .collect();
    if finished.len() > RETAINED_FINISHED {
        finished.sort_unstable();
        let excess = finished.len() - RETAINED_FINISHED;
        for (_, name) in finished.into_iter().take(excess) {
            tracing::debug!(name = %name, "pruning finished unit of work");
            entries.remove(&name);
        }
    }
}

struct SchedulerInner {
    entries: Mutex<HashMap<String, Entry>>,
    conditions: Arc<dyn DeviceConditions>,
    constraint_poll: Duration,
    seq: AtomicU64,
}

impl SchedulerInner {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Clone-safe handle to the work registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(conditions: Arc<dyn DeviceConditions>, constraint_poll: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                entries: Mutex::new(HashMap::new()),
                conditions,
                constraint_poll,
                seq: AtomicU64::new(0),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `request`, replacing any unit already running under its name.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue_unique(&self, request: WorkRequest) {
        let mut entries = self.entries();
        prune(&mut entries);
        let seq = self.inner.next_seq();
        let entry = entries.entry(request.name.clone()).or_insert_with(|| Entry {
            slot: Arc::new(Slot::new()),
            active: None,
            seq,
        });
        entry.seq = seq;

        let previous = entry.active.take();
        if let Some(prev) = &previous {
            tracing::info!(name = %request.name, "replacing existing unit of work");
            prev.cancel.cancel();
        }

        let generation = entry.slot.advance();
        let cancel = CancelFlag::new();
        let name = request.name.clone();
        let unit = Unit {
            inner: self.inner.clone(),
            slot: entry.slot.clone(),
            generation,
            cancel: cancel.clone(),
            request,
        };

        let handle = tokio::spawn(async move {
            if let Some(prev) = previous {
                // Never overlap two units with the same name.
                if let Err(e) = prev.handle.await {
                    tracing::warn!(name = %name, error = %e, "replaced unit of work ended abnormally");
                }
            }
            unit.run().await;
        });

        entry.active = Some(ActiveUnit { cancel, handle });
    }

    /// Cancel the unit registered under `name`. Returns whether one was active.
    pub fn cancel_unique(&self, name: &str) -> bool {
        let entries = self.entries();
        match entries.get(name).and_then(|e| e.active.as_ref()) {
            Some(active) if !active.handle.is_finished() => {
                tracing::info!(name, "cancelling unit of work");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) {
        for (name, entry) in self.entries().iter() {
            if let Some(active) = &entry.active {
                tracing::debug!(name = %name, "cancelling unit of work");
                active.cancel.cancel();
            }
        }
    }

    /// Subscribe to the state of `name`; the current value is replayed first.
    ///
    /// Registers `name` if unknown so the subscription sees a later enqueue.
    pub fn watch(&self, name: &str) -> watch::Receiver<WorkInfo> {
        let mut entries = self.entries();
        prune(&mut entries);
        if let Some(entry) = entries.get(name) {
            return entry.slot.tx.subscribe();
        }
        let entry = Entry {
            slot: Arc::new(Slot::new()),
            active: None,
            seq: self.inner.next_seq(),
        };
        let rx = entry.slot.tx.subscribe();
        entries.insert(name.to_string(), entry);
        rx
    }

    /// Latest state of `name` without registering it.
    pub fn info(&self, name: &str) -> Option<WorkInfo> {
        self.entries().get(name).map(|e| *e.slot.tx.borrow())
    }

    /// Wait until the unit registered under `name` reaches a terminal state.
    ///
    /// Returns immediately with the current state if nothing is active.
    pub async fn wait_terminal(&self, name: &str) -> WorkInfo {
        let mut rx = self.watch(name);
        let idle = {
            let entries = self.entries();
            entries
                .get(name)
                .and_then(|e| e.active.as_ref())
                .map_or(true, |a| a.handle.is_finished())
        };
        if idle {
            return *rx.borrow();
        }
        let result = rx
            .wait_for(|info| info.state.is_terminal())
            .await
            .map(|info| *info);
        result.unwrap_or_else(|_| *rx.borrow())
    }
}

/// One registered unit, owned by its spawned task.
struct Unit {
    inner: Arc<SchedulerInner>,
    slot: Arc<Slot>,
    generation: u64,
    cancel: CancelFlag,
    request: WorkRequest,
}

impl Unit {
    async fn run(self) {
        let name = self.request.name.clone();
        let Some(period) = self.request.period else {
            let info = self.run_attempts().await;
            self.publish(info);
            return;
        };

        // Periodic units only ever terminate by cancellation; between runs they
        // report Enqueued like a freshly scheduled unit.
        loop {
            let info = self.run_attempts().await;
            if info.state == WorkState::Cancelled {
                self.publish(info);
                return;
            }
            self.publish(WorkInfo::new(WorkState::Enqueued, info.attempt));
            tracing::debug!(name = %name, outcome = ?info.state, next_in = ?period, "periodic unit idle");
            if self.sleep_or_cancel(period).await {
                self.publish(WorkInfo::new(WorkState::Cancelled, info.attempt));
                return;
            }
        }
    }

    /// Execute the unit once, retrying transient failures per the policy.
    async fn run_attempts(&self) -> WorkInfo {
        let name = &self.request.name;
        let retry = self.request.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            if !self.wait_for_constraints(attempt).await {
                tracing::info!(name = %name, "unit cancelled before start");
                return WorkInfo::new(WorkState::Cancelled, attempt);
            }

            self.publish(WorkInfo::new(WorkState::Running, attempt));
            tracing::debug!(name = %name, attempt, "unit running");

            let ctx = WorkContext {
                slot: self.slot.clone(),
                generation: self.generation,
                cancel: self.cancel.clone(),
                attempt,
            };
            match (self.request.work)(ctx).await {
                WorkOutcome::Success => {
                    tracing::info!(name = %name, attempt, "unit succeeded");
                    return WorkInfo::new(WorkState::Succeeded, attempt);
                }
                WorkOutcome::Cancelled => {
                    tracing::info!(name = %name, attempt, "unit cancelled");
                    return WorkInfo::new(WorkState::Cancelled, attempt);
                }
                WorkOutcome::Failure(reason) => {
                    tracing::warn!(name = %name, attempt, reason = %reason, "unit failed");
                    return WorkInfo::new(WorkState::Failed, attempt);
                }
                WorkOutcome::Retry(reason) if attempt >= retry.max_attempts => {
                    tracing::warn!(name = %name, attempt, reason = %reason, "unit failed; retries exhausted");
                    return WorkInfo::new(WorkState::Failed, attempt);
                }
                WorkOutcome::Retry(reason) => {
                    let delay = retry.backoff.delay(attempt);
                    tracing::warn!(name = %name, attempt, reason = %reason, retry_in = ?delay, "unit failed; retry scheduled");
                    self.publish(WorkInfo::new(WorkState::Enqueued, attempt));
                    if self.sleep_or_cancel(delay).await {
                        return WorkInfo::new(WorkState::Cancelled, attempt);
                    }
                }
            }
        }
    }

    /// Block until constraints hold. Returns `false` if cancelled meanwhile.
    async fn wait_for_constraints(&self, attempt: u32) -> bool {
        let constraints = self.request.constraints;
        let mut blocked = false;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if constraints.satisfied_by(self.inner.conditions.as_ref()) {
                return true;
            }
            if !blocked {
                tracing::info!(name = %self.request.name, ?constraints, "unit blocked on device constraints");
                self.publish(WorkInfo::new(WorkState::Blocked, attempt));
                blocked = true;
            }
            if self.sleep_or_cancel(self.inner.constraint_poll).await {
                return false;
            }
        }
    }

    /// Sleep for `duration`; returns `true` if woken by cancellation.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    fn publish(&self, info: WorkInfo) {
        self.slot.publish(self.generation, info);
    }
}
