//! Task runner: a fixed worker pool applying timeout, retry-with-backoff and
//! per-name rate limiting to arbitrary units of work.
//!
//! Every attempt receives its own [`CancellationToken`]. When an attempt
//! exceeds its timeout the token is cancelled and the attempt is recorded as
//! `{"error":"timeout","attempt":n}`; work that observes the token (RPC calls
//! do) stops instead of running on in the background.

mod deferred;

use crate::config::RunnerConfig;
use crate::error::{codes, error_json, is_error_result, panic_message, EngineResult};
use crate::queue::TaskQueue;
use crate::spec::CompletionCallback;
use deferred::DeferredTasks;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type TaskWork = Arc<dyn Fn(&CancellationToken) -> Value + Send + Sync>;

/// One invocation of some work, consumed once by the runner.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub work: TaskWork,
    pub on_complete: Option<CompletionCallback>,
    pub timeout_ms: u64,
    pub retry_limit: u32,
    pub rate_limit_ms: u64,
    pub attempt: u32,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(&CancellationToken) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            work: Arc::new(work),
            on_complete: None,
            timeout_ms: 0,
            retry_limit: 0,
            rate_limit_ms: 0,
            attempt: 0,
        }
    }

    pub fn with_on_complete<F>(mut self, on_complete: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(on_complete));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_rate_limit_ms(mut self, rate_limit_ms: u64) -> Self {
        self.rate_limit_ms = rate_limit_ms;
        self
    }

    /// Hands `result` to the completion callback. A panicking callback is
    /// logged and swallowed.
    pub(crate) fn complete(&self, result: &Value) {
        if let Some(callback) = &self.on_complete {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(result))) {
                error!(
                    "[TaskRunner] Completion callback for '{}' panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry_limit", &self.retry_limit)
            .field("rate_limit_ms", &self.rate_limit_ms)
            .field("attempt", &self.attempt)
            .finish()
    }
}

pub(crate) enum Job {
    Run(Task),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopped,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct Shared {
    queue: Arc<TaskQueue<Job>>,
    deferred: Arc<DeferredTasks>,
    last_success: Mutex<HashMap<String, Instant>>,
    base_backoff_ms: u64,
    state: AtomicU8,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    fn record_success(&self, name: &str) {
        self.last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Instant::now());
    }

    /// Remaining wait before `task` may run again, if any.
    fn rate_limit_wait(&self, task: &Task) -> Option<Duration> {
        let last = *self
            .last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task.name)?;
        let interval = Duration::from_millis(task.rate_limit_ms);
        let elapsed = last.elapsed();
        if elapsed < interval {
            Some(interval - elapsed)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Threads {
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

pub struct TaskRunner {
    shared: Arc<Shared>,
    threads: Mutex<Threads>,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Arc::new(TaskQueue::new()),
                deferred: Arc::new(DeferredTasks::new()),
                last_success: Mutex::new(HashMap::new()),
                base_backoff_ms: config.base_backoff_ms,
                state: AtomicU8::new(STATE_IDLE),
            }),
            threads: Mutex::new(Threads::default()),
            config,
        }
    }

    /// Starts with the configured worker count.
    pub fn start_default(&self) -> EngineResult<()> {
        self.start(self.config.worker_count())
    }

    /// Spins up `workers` threads (at least one). No-op when already running.
    pub fn start(&self, workers: usize) -> EngineResult<()> {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.is_running() {
            return Ok(());
        }
        let workers = workers.max(1);
        self.shared.state.store(STATE_RUNNING, Ordering::SeqCst);

        threads.timer = Some(self.shared.deferred.spawn_timer(self.shared.queue.clone())?);
        for i in 0..workers {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("task-runner-{}", i))
                .spawn(move || worker_loop(&shared))?;
            threads.workers.push(handle);
        }
        info!("[TaskRunner] Started with {} workers", workers);
        Ok(())
    }

    /// Pushes one shutdown sentinel per worker and joins them. Tasks still
    /// queued or deferred complete with `runner_stopped`.
    pub fn stop(&self) {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }

        for _ in 0..threads.workers.len() {
            self.shared.queue.push(Job::Shutdown);
        }
        for handle in threads.workers.drain(..) {
            if handle.join().is_err() {
                error!("[TaskRunner] Worker thread panicked during shutdown");
            }
        }
        self.shared.deferred.shutdown();
        if let Some(timer) = threads.timer.take() {
            let _ = timer.join();
        }
        drop(threads);

        let mut leftovers: Vec<Task> = self
            .shared
            .queue
            .drain()
            .into_iter()
            .filter_map(|job| match job {
                Job::Run(task) => Some(task),
                Job::Shutdown => None,
            })
            .collect();
        leftovers.extend(self.shared.deferred.drain());
        if !leftovers.is_empty() {
            warn!(
                "[TaskRunner] Completing {} pending tasks as stopped",
                leftovers.len()
            );
        }
        for task in leftovers {
            task.complete(&error_json(codes::RUNNER_STOPPED));
        }
        info!("[TaskRunner] Stopped");
    }

    pub fn enqueue(&self, task: Task) {
        if self.state() == RunnerState::Stopped {
            warn!("[TaskRunner] Rejecting '{}': runner stopped", task.name);
            task.complete(&error_json(codes::RUNNER_STOPPED));
            return;
        }
        debug!("[TaskRunner] Enqueued '{}'", task.name);
        self.shared.queue.push(Job::Run(task));
    }

    pub fn enqueue_function_call<W, C>(&self, name: &str, work: W, on_complete: C, timeout_ms: u64)
    where
        W: Fn(&CancellationToken) -> Value + Send + Sync + 'static,
        C: Fn(&Value) + Send + Sync + 'static,
    {
        self.enqueue(
            Task::new(name, work)
                .with_on_complete(on_complete)
                .with_timeout_ms(timeout_ms),
        );
    }

    pub fn enqueue_capability_call<W, C>(
        &self,
        name: &str,
        work: W,
        on_complete: C,
        timeout_ms: u64,
    ) where
        W: Fn(&CancellationToken) -> Value + Send + Sync + 'static,
        C: Fn(&Value) + Send + Sync + 'static,
    {
        self.enqueue(
            Task::new(name, work)
                .with_on_complete(on_complete)
                .with_timeout_ms(timeout_ms),
        );
    }

    pub fn state(&self) -> RunnerState {
        match self.shared.state.load(Ordering::SeqCst) {
            STATE_RUNNING => RunnerState::Running,
            STATE_STOPPED => RunnerState::Stopped,
            _ => RunnerState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Tasks waiting in the FIFO (excludes rate-limit deferrals).
    pub fn queued_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.shared.deferred.len()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = match shared.queue.pop() {
            Job::Shutdown => break,
            Job::Run(task) => task,
        };
        if !shared.is_running() {
            task.complete(&error_json(codes::RUNNER_STOPPED));
            continue;
        }
        let name = task.name.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| process(shared, task))) {
            error!(
                "[TaskRunner] '{}' aborted: {}",
                name,
                panic_message(payload.as_ref())
            );
        }
    }
}

fn process(shared: &Shared, mut task: Task) {
    if task.rate_limit_ms > 0 {
        if let Some(wait) = shared.rate_limit_wait(&task) {
            if task.timeout_ms > 0 && wait >= Duration::from_millis(task.timeout_ms) {
                warn!(
                    "[TaskRunner] '{}' rate limited ({}ms remaining exceeds timeout)",
                    task.name,
                    wait.as_millis()
                );
                task.complete(&error_json(codes::RATE_LIMITED));
            } else {
                shared.deferred.defer(task, Instant::now() + wait);
            }
            return;
        }
    }

    let total_attempts = task.retry_limit.saturating_add(1).max(1);
    let mut last_error: Option<Value> = None;

    for attempt in 1..=total_attempts {
        if !shared.is_running() {
            break;
        }
        task.attempt = attempt;
        let result = run_attempt(&task, attempt);
        if !is_error_result(&result) {
            shared.record_success(&task.name);
            task.complete(&result);
            return;
        }
        debug!(
            "[TaskRunner] '{}' attempt {}/{} failed: {}",
            task.name, attempt, total_attempts, result
        );
        last_error = Some(result);
        if attempt < total_attempts {
            thread::sleep(backoff_delay(
                shared.base_backoff_ms,
                attempt,
                task.timeout_ms,
            ));
        }
    }

    let outcome = last_error.unwrap_or_else(|| {
        if shared.is_running() {
            error_json(codes::FAILED)
        } else {
            error_json(codes::RUNNER_STOPPED)
        }
    });
    warn!(
        "[TaskRunner] '{}' failed after {} attempts: {}",
        task.name, task.attempt, outcome
    );
    task.complete(&outcome);
}

/// `base * 2^(attempt-1)`, capped at the task timeout when one is set.
fn backoff_delay(base_ms: u64, attempt: u32, timeout_ms: u64) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    let mut backoff = base_ms.saturating_mul(factor);
    if timeout_ms > 0 {
        backoff = backoff.min(timeout_ms);
    }
    Duration::from_millis(backoff)
}

fn invoke_work(work: &TaskWork, token: &CancellationToken, attempt: u32) -> Value {
    match catch_unwind(AssertUnwindSafe(|| work(token))) {
        Ok(value) => value,
        Err(payload) => json!({
            "error": format!("exception: {}", panic_message(payload.as_ref())),
            "attempt": attempt,
        }),
    }
}

fn run_attempt(task: &Task, attempt: u32) -> Value {
    let token = CancellationToken::new();
    if task.timeout_ms == 0 {
        return invoke_work(&task.work, &token, attempt);
    }

    let (tx, rx) = mpsc::channel();
    let work = task.work.clone();
    let child = token.clone();
    let spawned = thread::Builder::new()
        .name("task-attempt".to_string())
        .spawn(move || {
            let _ = tx.send(invoke_work(&work, &child, attempt));
        });
    if let Err(e) = spawned {
        return json!({ "error": format!("exception: {}", e), "attempt": attempt });
    }

    match rx.recv_timeout(Duration::from_millis(task.timeout_ms)) {
        Ok(value) => value,
        Err(RecvTimeoutError::Timeout) => {
            token.cancel();
            json!({ "error": codes::TIMEOUT, "attempt": attempt })
        }
        Err(RecvTimeoutError::Disconnected) => json!({
            "error": "exception: attempt ended without a result",
            "attempt": attempt,
        }),
    }
}
