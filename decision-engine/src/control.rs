//! JSON control surface for the HTTP layer.
//!
//! Every operation takes a JSON body and answers `{"success": true, ...}`
//! or `{"success": false, "message": "..."}`. Request bodies are decoded
//! into typed structs first so a malformed body fails with the serde
//! message rather than half-applying.

use crate::error::{EngineError, EngineResult};
use crate::intent::IntentRegistry;
use crate::registry::FunctionRegistry;
use crate::scheduler::{RepeatInterval, Schedule, Scheduler, TaskHandle};
use crate::spec::FunctionSpec;
use crate::triggers::{TriggerBinding, TriggerHandle, TriggerManager};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WhenRequest {
    time_epoch_ms: Option<i64>,
    delay_ms: Option<i64>,
}

impl WhenRequest {
    /// Absolute time wins over a relative delay; neither means now.
    fn resolve(&self, now: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
        if let Some(ms) = self.time_epoch_ms {
            return epoch_ms(ms);
        }
        let delay = ChronoDuration::try_milliseconds(self.delay_ms.unwrap_or(0).max(0));
        delay
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| EngineError::InvalidPayload("delay out of range".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddTaskRequest {
    intent_name: String,
    #[serde(flatten)]
    when: WhenRequest,
    #[serde(default)]
    repeat_seconds: u32,
    end_epoch_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HandleRequest {
    handle: u32,
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    handle: TriggerHandle,
    enable: bool,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

fn epoch_ms(ms: i64) -> EngineResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EngineError::InvalidPayload(format!("timestamp out of range: {}", ms)))
}

fn parse_payload<T: DeserializeOwned>(operation: &str, body: &Value) -> EngineResult<T> {
    serde_json::from_value(body.clone()).map_err(|err| {
        EngineError::InvalidPayload(format!(
            "{}: request does not match schema: {}",
            operation, err
        ))
    })
}

fn success(extra: Value) -> Value {
    let mut out = Map::new();
    out.insert("success".to_string(), Value::Bool(true));
    if let Value::Object(fields) = extra {
        out.extend(fields);
    }
    Value::Object(out)
}

fn failure(message: impl Into<String>) -> Value {
    json!({ "success": false, "message": message.into() })
}

fn respond(operation: &str, result: EngineResult<Value>) -> Value {
    match result {
        Ok(extra) => success(extra),
        Err(e) => {
            warn!("[Control] {} failed: {}", operation, e);
            failure(e.to_string())
        }
    }
}

pub struct ControlSurface {
    scheduler: Arc<Scheduler>,
    triggers: Arc<TriggerManager>,
    registry: Arc<FunctionRegistry>,
    intents: Arc<IntentRegistry>,
}

impl ControlSurface {
    pub fn new(
        scheduler: Arc<Scheduler>,
        triggers: Arc<TriggerManager>,
        registry: Arc<FunctionRegistry>,
        intents: Arc<IntentRegistry>,
    ) -> Self {
        Self {
            scheduler,
            triggers,
            registry,
            intents,
        }
    }

    /// Routes `operation` by name. Unknown operations fail without side
    /// effects.
    pub fn handle(&self, operation: &str, body: &Value) -> Value {
        debug!("[Control] {} {}", operation, body);
        match operation {
            "scheduler_command" => self.scheduler_command_json(body),
            "list_tasks" => self.list_tasks(),
            "add_task" => self.add_task(body),
            "remove_task" => self.remove_task(body),
            "create_time_trigger" => self.create_time_trigger(body),
            "create_event_trigger" => self.create_event_trigger(body),
            "bind_trigger" => self.bind_trigger(body),
            "set_trigger_enabled" => self.set_trigger_enabled(body),
            "fire_trigger" => self.fire_trigger(body),
            "list_triggers" => self.list_triggers(),
            "register_function" => self.register_function(body),
            "list_functions" => self.list_functions(),
            "list_capabilities" => self.list_capabilities(),
            "list_intents" => self.list_intents(),
            other => failure(format!("unknown operation: {}", other)),
        }
    }

    pub fn scheduler_command(&self, command: &str) -> Value {
        let applied = match command {
            "start" => self.scheduler.start(),
            "stop" => self.scheduler.stop(),
            "pause" => self.scheduler.pause(),
            "resume" => self.scheduler.resume(),
            "restart" => self.scheduler.restart(),
            other => return failure(format!("unknown scheduler command: {}", other)),
        };
        let state = self.scheduler.state();
        if applied {
            success(json!({ "state": state }))
        } else {
            json!({
                "success": false,
                "message": format!("cannot {} while {:?}", command, state).to_lowercase(),
                "state": state,
            })
        }
    }

    /// Same as `scheduler_command` with a `{"command": ...}` body.
    pub fn scheduler_command_json(&self, body: &Value) -> Value {
        match parse_payload::<CommandRequest>("scheduler_command", body) {
            Ok(req) => self.scheduler_command(&req.command),
            Err(e) => failure(e.to_string()),
        }
    }

    pub fn list_tasks(&self) -> Value {
        success(json!({ "tasks": self.scheduler.list_tasks() }))
    }

    pub fn add_task(&self, body: &Value) -> Value {
        respond("add_task", self.try_add_task(body))
    }

    fn try_add_task(&self, body: &Value) -> EngineResult<Value> {
        let req: AddTaskRequest = parse_payload("add_task", body)?;
        let intent = self
            .intents
            .get_intent(&req.intent_name)
            .ok_or_else(|| EngineError::NotFound {
                kind: "intent",
                name: req.intent_name.clone(),
            })?;
        let time = req.when.resolve(Utc::now())?;
        let mut schedule = if req.repeat_seconds > 0 {
            Schedule::repeating(time, RepeatInterval::every_seconds(req.repeat_seconds))
        } else {
            Schedule::once(time)
        };
        if let Some(end) = req.end_epoch_ms {
            schedule = schedule.until(epoch_ms(end)?);
        }
        let handle: TaskHandle = self.scheduler.add_task_for_intent(intent, schedule);
        Ok(json!({ "handle": handle }))
    }

    pub fn remove_task(&self, body: &Value) -> Value {
        respond(
            "remove_task",
            parse_payload::<HandleRequest>("remove_task", body).and_then(|req| {
                if self.scheduler.remove_task(req.handle) {
                    Ok(json!({}))
                } else {
                    Err(EngineError::NotFound {
                        kind: "task",
                        name: req.handle.to_string(),
                    })
                }
            }),
        )
    }

    pub fn create_time_trigger(&self, body: &Value) -> Value {
        respond(
            "create_time_trigger",
            parse_payload::<WhenRequest>("create_time_trigger", body).and_then(|when| {
                let at = when.resolve(Utc::now())?;
                let handle = self
                    .triggers
                    .create_time_trigger(at, TriggerBinding::from_json(body))?;
                Ok(json!({ "handle": handle }))
            }),
        )
    }

    pub fn create_event_trigger(&self, body: &Value) -> Value {
        respond(
            "create_event_trigger",
            self.triggers
                .create_event_trigger(TriggerBinding::from_json(body))
                .map(|handle| json!({ "handle": handle })),
        )
    }

    pub fn bind_trigger(&self, body: &Value) -> Value {
        respond(
            "bind_trigger",
            parse_payload::<HandleRequest>("bind_trigger", body).and_then(|req| {
                self.triggers
                    .bind_trigger(req.handle, TriggerBinding::from_json(body))?;
                Ok(json!({ "handle": req.handle }))
            }),
        )
    }

    pub fn set_trigger_enabled(&self, body: &Value) -> Value {
        respond(
            "set_trigger_enabled",
            parse_payload::<EnableRequest>("set_trigger_enabled", body).and_then(|req| {
                if self.triggers.set_trigger_enabled(req.handle, req.enable) {
                    Ok(json!({ "handle": req.handle, "enabled": req.enable }))
                } else {
                    Err(EngineError::NotFound {
                        kind: "trigger",
                        name: req.handle.to_string(),
                    })
                }
            }),
        )
    }

    pub fn fire_trigger(&self, body: &Value) -> Value {
        let result = parse_payload::<HandleRequest>("fire_trigger", body)
            .and_then(|req| self.triggers.fire_trigger(req.handle));
        match result {
            Ok(true) => success(json!({ "fired": true })),
            Ok(false) => json!({
                "success": false,
                "fired": false,
                "message": "trigger is disabled or its check did not pass",
            }),
            Err(e) => respond("fire_trigger", Err(e)),
        }
    }

    pub fn list_triggers(&self) -> Value {
        success(json!({ "triggers": self.triggers.list_triggers() }))
    }

    pub fn register_function(&self, body: &Value) -> Value {
        respond(
            "register_function",
            FunctionSpec::from_registration(body).and_then(|spec| {
                let name = spec.name.clone();
                self.registry.try_register_func(spec)?;
                Ok(json!({ "name": name }))
            }),
        )
    }

    pub fn list_functions(&self) -> Value {
        success(json!({ "functions": self.registry.catalogue_json() }))
    }

    pub fn list_capabilities(&self) -> Value {
        success(json!({ "capabilities": self.registry.capability_catalogue_json() }))
    }

    pub fn list_intents(&self) -> Value {
        let intents: Vec<Value> = self
            .intents
            .registered_intents()
            .iter()
            .map(|intent| intent.serialize())
            .collect();
        success(json!({ "intents": intents }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_time_wins_over_delay() {
        let now = Utc.timestamp_millis_opt(1_000_000).single().unwrap();
        let when = WhenRequest { time_epoch_ms: Some(5_000), delay_ms: Some(10) };
        assert_eq!(when.resolve(now).unwrap().timestamp_millis(), 5_000);

        let when = WhenRequest { time_epoch_ms: None, delay_ms: Some(250) };
        assert_eq!(when.resolve(now).unwrap().timestamp_millis(), 1_000_250);

        let when = WhenRequest::default();
        assert_eq!(when.resolve(now).unwrap(), now);
    }

    #[test]
    fn oversized_delay_is_rejected() {
        let when = WhenRequest { time_epoch_ms: None, delay_ms: Some(i64::MAX) };
        let err = when.resolve(Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));
    }

    #[test]
    fn success_merges_extra_fields() {
        assert_eq!(success(json!({"handle": 3})), json!({"success": true, "handle": 3}));
        assert_eq!(success(json!({})), json!({"success": true}));
        assert_eq!(failure("nope"), json!({"success": false, "message": "nope"}));
    }

    #[test]
    fn malformed_payload_names_the_operation() {
        let err = parse_payload::<HandleRequest>("remove_task", &json!({"handle": "x"}))
            .unwrap_err();
        assert!(err.to_string().contains("remove_task"));
    }
}
