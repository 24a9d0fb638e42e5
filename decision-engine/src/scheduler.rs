//! Time-based firing of intents.
//!
//! One background loop wakes every tick, collects enabled tasks whose time
//! has come, re-arms or disables them, and hands each intent execution to
//! the task runner so a slow action never stalls the scan.
//!
//! Repeating tasks advance from their previous scheduled time, not from the
//! moment they ran. Occurrences missed while paused or stopped are skipped,
//! so a task fires at most once per scan.

use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::intent::Intent;
use crate::runner::{Task, TaskRunner};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type TaskHandle = u32;

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatKind {
    OneShot,
    Days,
    Weeks,
    Months,
    Years,
    /// Raw seconds.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatInterval {
    pub kind: RepeatKind,
    pub value: u32,
}

impl Default for RepeatInterval {
    fn default() -> Self {
        Self::one_shot()
    }
}

impl RepeatInterval {
    pub fn new(kind: RepeatKind, value: u32) -> Self {
        Self { kind, value }
    }

    pub fn one_shot() -> Self {
        Self::new(RepeatKind::OneShot, 0)
    }

    pub fn every_seconds(seconds: u32) -> Self {
        Self::new(RepeatKind::Custom, seconds)
    }

    /// Months are 30 days and years 365 days.
    pub fn to_seconds(&self) -> u64 {
        let value = u64::from(self.value);
        match self.kind {
            RepeatKind::OneShot => 0,
            RepeatKind::Days => value * 86_400,
            RepeatKind::Weeks => value * 604_800,
            RepeatKind::Months => value * 30 * 86_400,
            RepeatKind::Years => value * 365 * 86_400,
            RepeatKind::Custom => value,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.kind != RepeatKind::OneShot && self.to_seconds() > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub time: DateTime<Utc>,
    pub repeat: RepeatInterval,
    /// Last instant a repeating task may fire.
    pub end_time: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn once(time: DateTime<Utc>) -> Self {
        Self {
            time,
            repeat: RepeatInterval::one_shot(),
            end_time: None,
        }
    }

    pub fn repeating(time: DateTime<Utc>, repeat: RepeatInterval) -> Self {
        Self {
            time,
            repeat,
            end_time: None,
        }
    }

    pub fn until(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    handle: TaskHandle,
    intent: Arc<Intent>,
    schedule: Schedule,
    enabled: bool,
    repeat_count: u32,
}

impl ScheduledTask {
    /// Allocates the next process-wide handle.
    pub fn new(intent: Arc<Intent>, schedule: Schedule) -> Self {
        Self {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::SeqCst),
            intent,
            schedule,
            enabled: true,
            repeat_count: 0,
        }
    }

    pub fn at(intent: Arc<Intent>, time: DateTime<Utc>) -> Self {
        Self::new(intent, Schedule::once(time))
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn intent(&self) -> &Arc<Intent> {
        &self.intent
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    /// Runs the intent's action on the calling thread.
    pub fn execute_intent(&self) -> EngineResult<()> {
        self.intent.execute()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.schedule.time <= now
    }

    /// Bookkeeping after a fire at `now`: one-shots are disabled, repeats
    /// move to the first occurrence after `now` unless that passes
    /// `end_time`.
    fn advance(&mut self, now: DateTime<Utc>) {
        self.repeat_count = self.repeat_count.saturating_add(1);
        if !self.schedule.repeat.is_repeating() {
            self.enabled = false;
            return;
        }

        let step = i64::try_from(self.schedule.repeat.to_seconds()).unwrap_or(i64::MAX);
        let behind = (now - self.schedule.time).num_seconds().max(0);
        let next = (behind / step)
            .checked_add(1)
            .and_then(|skipped| skipped.checked_mul(step))
            .and_then(ChronoDuration::try_seconds)
            .and_then(|offset| self.schedule.time.checked_add_signed(offset));

        match (next, self.schedule.end_time) {
            (None, _) => {
                warn!(
                    "[Scheduler] Task {} has no representable next occurrence; disabling",
                    self.handle
                );
                self.enabled = false;
            }
            (Some(next), Some(end)) if next > end => {
                debug!(
                    "[Scheduler] Task {} reached its end time; disabling",
                    self.handle
                );
                self.enabled = false;
            }
            (Some(next), _) => self.schedule.time = next,
        }
    }

    pub fn info(&self) -> ScheduledTaskInfo {
        ScheduledTaskInfo {
            handle: self.handle,
            intent_name: self.intent.name().to_string(),
            time_epoch_ms: self.schedule.time.timestamp_millis(),
            repeat_seconds: self.schedule.repeat.to_seconds(),
            end_epoch_ms: self.schedule.end_time.map(|t| t.timestamp_millis()),
            enabled: self.enabled,
            repeat_count: self.repeat_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskInfo {
    pub handle: TaskHandle,
    pub intent_name: String,
    pub time_epoch_ms: i64,
    pub repeat_seconds: u64,
    pub end_epoch_ms: Option<i64>,
    pub enabled: bool,
    pub repeat_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

struct LoopControl {
    state: SchedulerState,
    exit: bool,
}

struct SchedulerShared {
    tasks: Mutex<Vec<ScheduledTask>>,
    control: Mutex<LoopControl>,
    wake: Condvar,
    runner: Arc<TaskRunner>,
    tick: Duration,
}

impl SchedulerShared {
    fn tasks(&self) -> MutexGuard<'_, Vec<ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn control(&self) -> MutexGuard<'_, LoopControl> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Collects due tasks under the lock, then dispatches them without it.
    fn run_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<(TaskHandle, Arc<Intent>)> = {
            let mut tasks = self.tasks();
            tasks
                .iter_mut()
                .filter(|t| t.is_due(now))
                .map(|t| {
                    t.advance(now);
                    (t.handle, t.intent.clone())
                })
                .collect()
        };

        for (handle, intent) in &due {
            debug!(
                "[Scheduler] Task {} due; dispatching '{}'",
                handle,
                intent.name()
            );
            self.runner.enqueue(intent_task(format!("scheduled:{}", handle), intent.clone()));
        }
        due.len()
    }

    fn run_loop(&self) {
        loop {
            {
                let mut control = self.control();
                while !control.exit && control.state != SchedulerState::Running {
                    control = self
                        .wake
                        .wait(control)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if control.exit {
                    break;
                }
            }

            self.run_due(Utc::now());

            let control = self.control();
            if control.exit {
                break;
            }
            let _ = self
                .wake
                .wait_timeout(control, self.tick)
                .unwrap_or_else(|e| e.into_inner());
        }
        debug!("[Scheduler] Loop exited");
    }
}

/// Runner task executing `intent` for a due scheduled task.
pub(crate) fn intent_task(name: String, intent: Arc<Intent>) -> Task {
    Task::new(name, move |_: &CancellationToken| -> Value {
        match intent.execute() {
            Ok(()) => json!({ "status": "ok", "intent": intent.name() }),
            Err(e) => {
                warn!("[Intent] '{}' failed: {}", intent.name(), e);
                json!({ "error": e.to_string(), "intent": intent.name() })
            }
        }
    })
}

pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the loop thread; it idles until `start()`.
    pub fn new(runner: Arc<TaskRunner>, config: SchedulerConfig) -> EngineResult<Self> {
        let shared = Arc::new(SchedulerShared {
            tasks: Mutex::new(Vec::new()),
            control: Mutex::new(LoopControl {
                state: SchedulerState::Idle,
                exit: false,
            }),
            wake: Condvar::new(),
            runner,
            tick: config.tick(),
        });
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || loop_shared.run_loop())
            .map_err(EngineError::Io)?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    fn transition(&self, from: &[SchedulerState], to: SchedulerState) -> bool {
        let mut control = self.shared.control();
        if !from.contains(&control.state) {
            return false;
        }
        info!("[Scheduler] {:?} -> {:?}", control.state, to);
        control.state = to;
        self.shared.wake.notify_all();
        true
    }

    pub fn start(&self) -> bool {
        self.transition(
            &[SchedulerState::Idle, SchedulerState::Stopped, SchedulerState::Paused],
            SchedulerState::Running,
        )
    }

    pub fn stop(&self) -> bool {
        self.transition(
            &[SchedulerState::Running, SchedulerState::Paused],
            SchedulerState::Stopped,
        )
    }

    pub fn pause(&self) -> bool {
        self.transition(&[SchedulerState::Running], SchedulerState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(&[SchedulerState::Paused], SchedulerState::Running)
    }

    pub fn restart(&self) -> bool {
        self.stop();
        self.start()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.control().state
    }

    pub fn add_task(&self, task: ScheduledTask) -> TaskHandle {
        let handle = task.handle();
        info!(
            "[Scheduler] Added task {} for '{}' at {}",
            handle,
            task.intent().name(),
            task.schedule().time
        );
        self.shared.tasks().push(task);
        handle
    }

    pub fn add_task_for_intent(&self, intent: Arc<Intent>, schedule: Schedule) -> TaskHandle {
        self.add_task(ScheduledTask::new(intent, schedule))
    }

    pub fn remove_task(&self, handle: TaskHandle) -> bool {
        self.remove_first(|t| t.handle == handle)
    }

    /// Removes the first task bound to this exact intent instance.
    pub fn remove_task_for_intent(&self, intent: &Arc<Intent>) -> bool {
        self.remove_first(|t| Arc::ptr_eq(&t.intent, intent))
    }

    /// Removes the first task whose intent has this name.
    pub fn remove_task_by_name(&self, intent_name: &str) -> bool {
        self.remove_first(|t| t.intent.name() == intent_name)
    }

    fn remove_first<F>(&self, pred: F) -> bool
    where
        F: Fn(&ScheduledTask) -> bool,
    {
        let mut tasks = self.shared.tasks();
        match tasks.iter().position(pred) {
            Some(index) => {
                let removed = tasks.remove(index);
                info!("[Scheduler] Removed task {}", removed.handle);
                true
            }
            None => false,
        }
    }

    pub fn set_task_enabled(&self, handle: TaskHandle, enabled: bool) -> bool {
        match self.shared.tasks().iter_mut().find(|t| t.handle == handle) {
            Some(task) => {
                task.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn task(&self, handle: TaskHandle) -> Option<ScheduledTaskInfo> {
        self.shared
            .tasks()
            .iter()
            .find(|t| t.handle == handle)
            .map(ScheduledTask::info)
    }

    pub fn list_tasks(&self) -> Vec<ScheduledTaskInfo> {
        self.shared.tasks().iter().map(ScheduledTask::info).collect()
    }

    pub fn task_count(&self) -> usize {
        self.shared.tasks().len()
    }

    /// Runs one scan at `now` regardless of the loop state. Returns how many
    /// tasks were dispatched.
    pub fn run_due_at(&self, now: DateTime<Utc>) -> usize {
        self.shared.run_due(now)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let mut control = self.shared.control();
            control.exit = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }
}
