//! Predicate-gated triggers and the manager that polls them.
//!
//! A time trigger's default predicate is `now >= at`; an event trigger has
//! none until one is injected. The poll loop only fires triggers that have a
//! predicate and disables time triggers after they fire. A manual fire is
//! gated by `enabled` and by the predicate when one is set.

use crate::config::TriggerConfig;
use crate::error::{panic_message, EngineError, EngineResult};
use crate::intent::IntentRegistry;
use crate::registry::FunctionRegistry;
use crate::runner::{Task, TaskRunner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type TriggerHandle = u32;
pub type TriggerPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
pub type TriggerAction = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Time { at: DateTime<Utc> },
    Event,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Time { .. } => "time",
            TriggerKind::Event => "event",
        }
    }
}

pub struct Trigger {
    kind: TriggerKind,
    enabled: AtomicBool,
    state: AtomicBool,
    predicate: RwLock<Option<TriggerPredicate>>,
    action: RwLock<Option<TriggerAction>>,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("state", &self.trigger_state())
            .field("has_predicate", &self.has_predicate())
            .finish()
    }
}

impl Trigger {
    fn with_kind(kind: TriggerKind, predicate: Option<TriggerPredicate>) -> Self {
        Self {
            kind,
            enabled: AtomicBool::new(false),
            state: AtomicBool::new(false),
            predicate: RwLock::new(predicate),
            action: RwLock::new(None),
        }
    }

    /// Disabled time trigger that passes once `at` is reached.
    pub fn time(at: DateTime<Utc>) -> Self {
        Self::with_kind(
            TriggerKind::Time { at },
            Some(Arc::new(move || Utc::now() >= at)),
        )
    }

    /// Disabled event trigger with no predicate.
    pub fn event() -> Self {
        Self::with_kind(TriggerKind::Event, None)
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn is_time(&self) -> bool {
        matches!(self.kind, TriggerKind::Time { .. })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// True once the trigger has fired at least once.
    pub fn trigger_state(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    pub fn set_predicate<F>(&self, predicate: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        *self.predicate.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(predicate));
    }

    pub fn has_predicate(&self) -> bool {
        self.predicate
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn set_action<F>(&self, action: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.set_action_arc(Arc::new(action));
    }

    fn set_action_arc(&self, action: TriggerAction) {
        *self.action.write().unwrap_or_else(|e| e.into_inner()) = Some(action);
    }

    pub fn action(&self) -> Option<TriggerAction> {
        self.action.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Evaluates the predicate; `None` when there is none. A panicking
    /// predicate counts as not passing.
    fn evaluate(&self) -> Option<bool> {
        let predicate = self
            .predicate
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        match catch_unwind(AssertUnwindSafe(|| predicate())) {
            Ok(pass) => Some(pass),
            Err(payload) => {
                error!(
                    "[Triggers] Predicate panicked: {}",
                    panic_message(payload.as_ref())
                );
                Some(false)
            }
        }
    }

    /// Gate shared by manual and polled firing: enabled, and the predicate
    /// passes when one is set. Records the fire in `trigger_state`.
    pub fn check_fire(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.evaluate().unwrap_or(true) {
            self.state.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Fires on the calling thread. Returns whether the gate passed.
    pub fn trigger(&self) -> bool {
        if !self.check_fire() {
            return false;
        }
        if let Some(action) = self.action() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action())) {
                error!(
                    "[Triggers] Action panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        true
    }
}

/// What a trigger does when it fires. Built from a request with the
/// priority intent, then capability, then function.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerBinding {
    Intent(String),
    Capability { name: String, args: Value },
    Function { name: String, args: Value },
    None,
}

impl TriggerBinding {
    pub fn from_json(body: &Value) -> Self {
        let text = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let args = match body.get("args") {
            Some(a @ Value::Object(_)) => a.clone(),
            _ => json!({}),
        };
        if let Some(name) = text("intentName") {
            TriggerBinding::Intent(name)
        } else if let Some(name) = text("capabilityName") {
            TriggerBinding::Capability { name, args }
        } else if let Some(name) = text("functionName") {
            TriggerBinding::Function { name, args }
        } else {
            TriggerBinding::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    pub handle: TriggerHandle,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub enabled: bool,
    pub triggered: bool,
    pub has_check: bool,
    pub has_action: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_epoch_ms: Option<i64>,
}

struct TriggerShared {
    triggers: Mutex<BTreeMap<TriggerHandle, Arc<Trigger>>>,
    next_handle: AtomicU32,
    stop: Mutex<bool>,
    wake: Condvar,
    runner: Arc<TaskRunner>,
    intents: Arc<IntentRegistry>,
    registry: Arc<FunctionRegistry>,
    poll_interval: Duration,
}

impl TriggerShared {
    fn triggers(&self) -> MutexGuard<'_, BTreeMap<TriggerHandle, Arc<Trigger>>> {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, handle: TriggerHandle, trigger: &Trigger) {
        let action = match trigger.action() {
            Some(action) => action,
            None => {
                debug!("[Triggers] Trigger {} fired with no action bound", handle);
                return;
            }
        };
        self.runner.enqueue(Task::new(
            format!("trigger:{}", handle),
            move |_: &CancellationToken| {
                action();
                json!({ "status": "ok" })
            },
        ));
    }

    /// One scan over enabled triggers that carry a predicate.
    fn poll_once(&self) -> usize {
        let snapshot: Vec<(TriggerHandle, Arc<Trigger>)> = self
            .triggers()
            .iter()
            .map(|(h, t)| (*h, t.clone()))
            .collect();

        let mut fired = 0;
        for (handle, trigger) in snapshot {
            if !trigger.is_enabled() || !trigger.has_predicate() {
                continue;
            }
            if trigger.check_fire() {
                if trigger.is_time() {
                    trigger.set_enabled(false);
                }
                info!("[Triggers] Trigger {} fired", handle);
                self.dispatch(handle, &trigger);
                fired += 1;
            }
        }
        fired
    }

    fn run_loop(&self) {
        let mut stop = self.stop.lock().unwrap_or_else(|e| e.into_inner());
        while !*stop {
            drop(stop);
            self.poll_once();
            stop = self.stop.lock().unwrap_or_else(|e| e.into_inner());
            if *stop {
                break;
            }
            stop = self
                .wake
                .wait_timeout(stop, self.poll_interval)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        debug!("[Triggers] Poll loop exited");
    }

    fn action_for(&self, binding: &TriggerBinding) -> EngineResult<Option<TriggerAction>> {
        let action: TriggerAction = match binding {
            TriggerBinding::None => return Ok(None),
            TriggerBinding::Intent(name) => {
                let intent = self.intents.get_intent(name).ok_or_else(|| EngineError::NotFound {
                    kind: "intent",
                    name: name.clone(),
                })?;
                Arc::new(move || {
                    if let Err(e) = intent.execute() {
                        warn!("[Triggers] Intent '{}' failed: {}", intent.name(), e);
                    }
                })
            }
            TriggerBinding::Capability { name, args } => {
                let registry = self.registry.clone();
                let (name, args) = (name.clone(), args.clone());
                Arc::new(move || {
                    let label = name.clone();
                    registry.run_capability_async(&name, args.clone(), move |result: &Value| {
                        debug!("[Triggers] Capability '{}' completed: {}", label, result);
                    });
                })
            }
            TriggerBinding::Function { name, args } => {
                let registry = self.registry.clone();
                let (name, args) = (name.clone(), args.clone());
                Arc::new(move || {
                    let label = name.clone();
                    registry.run_function_async(&name, args.clone(), move |result: &Value| {
                        debug!("[Triggers] Function '{}' completed: {}", label, result);
                    });
                })
            }
        };
        Ok(Some(action))
    }
}

pub struct TriggerManager {
    shared: Arc<TriggerShared>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerManager {
    pub fn new(
        runner: Arc<TaskRunner>,
        intents: Arc<IntentRegistry>,
        registry: Arc<FunctionRegistry>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(TriggerShared {
                triggers: Mutex::new(BTreeMap::new()),
                next_handle: AtomicU32::new(0),
                stop: Mutex::new(false),
                wake: Condvar::new(),
                runner,
                intents,
                registry,
                poll_interval: config.poll_interval(),
            }),
            poll_thread: Mutex::new(None),
        }
    }

    /// Starts the poll thread. No-op when already running.
    pub fn start(&self) -> EngineResult<()> {
        let mut slot = self.poll_thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        *self.shared.stop.lock().unwrap_or_else(|e| e.into_inner()) = false;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("trigger-poll".to_string())
            .spawn(move || shared.run_loop())?;
        *slot = Some(handle);
        info!("[Triggers] Poll loop started");
        Ok(())
    }

    pub fn stop(&self) {
        let handle = self
            .poll_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            *self.shared.stop.lock().unwrap_or_else(|e| e.into_inner()) = true;
            self.shared.wake.notify_all();
            if handle.join().is_err() {
                error!("[Triggers] Poll thread panicked");
            }
            info!("[Triggers] Poll loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.poll_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn add_trigger(&self, trigger: Trigger) -> TriggerHandle {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("[Triggers] Added {} trigger {}", trigger.kind.as_str(), handle);
        self.shared.triggers().insert(handle, Arc::new(trigger));
        handle
    }

    pub fn remove_trigger(&self, handle: TriggerHandle) -> bool {
        self.shared.triggers().remove(&handle).is_some()
    }

    pub fn get_trigger(&self, handle: TriggerHandle) -> Option<Arc<Trigger>> {
        self.shared.triggers().get(&handle).cloned()
    }

    /// Creates an enabled one-shot time trigger.
    pub fn create_time_trigger(
        &self,
        at: DateTime<Utc>,
        binding: TriggerBinding,
    ) -> EngineResult<TriggerHandle> {
        let trigger = Trigger::time(at);
        if let Some(action) = self.shared.action_for(&binding)? {
            trigger.set_action_arc(action);
        }
        trigger.set_enabled(true);
        Ok(self.add_trigger(trigger))
    }

    /// Creates an enabled event trigger. It only fires through the poll loop
    /// once a predicate is set on it.
    pub fn create_event_trigger(&self, binding: TriggerBinding) -> EngineResult<TriggerHandle> {
        let trigger = Trigger::event();
        if let Some(action) = self.shared.action_for(&binding)? {
            trigger.set_action_arc(action);
        }
        trigger.set_enabled(true);
        Ok(self.add_trigger(trigger))
    }

    pub fn bind_trigger(&self, handle: TriggerHandle, binding: TriggerBinding) -> EngineResult<()> {
        let trigger = self.get_trigger(handle).ok_or(EngineError::NotFound {
            kind: "trigger",
            name: handle.to_string(),
        })?;
        match self.shared.action_for(&binding)? {
            Some(action) => {
                trigger.set_action_arc(action);
                Ok(())
            }
            None => Err(EngineError::InvalidPayload(
                "one of intentName, capabilityName or functionName is required".to_string(),
            )),
        }
    }

    pub fn set_trigger_enabled(&self, handle: TriggerHandle, enabled: bool) -> bool {
        match self.get_trigger(handle) {
            Some(trigger) => {
                trigger.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Manually fires a trigger through the runner. `Ok(false)` when the
    /// trigger is disabled or its predicate does not pass.
    pub fn fire_trigger(&self, handle: TriggerHandle) -> EngineResult<bool> {
        let trigger = self.get_trigger(handle).ok_or(EngineError::NotFound {
            kind: "trigger",
            name: handle.to_string(),
        })?;
        if !trigger.check_fire() {
            return Ok(false);
        }
        self.shared.dispatch(handle, &trigger);
        Ok(true)
    }

    pub fn poll_once(&self) -> usize {
        self.shared.poll_once()
    }

    pub fn list_triggers(&self) -> Vec<TriggerInfo> {
        self.shared
            .triggers()
            .iter()
            .map(|(handle, t)| TriggerInfo {
                handle: *handle,
                kind: t.kind.as_str(),
                enabled: t.is_enabled(),
                triggered: t.trigger_state(),
                has_check: t.has_predicate(),
                has_action: t.action().is_some(),
                time_epoch_ms: match t.kind {
                    TriggerKind::Time { at } => Some(at.timestamp_millis()),
                    TriggerKind::Event => None,
                },
            })
            .collect()
    }
}

impl Drop for TriggerManager {
    fn drop(&mut self) {
        self.stop();
    }
}
