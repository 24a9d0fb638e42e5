//! Decision engine core.
//!
//! A task runner with retries, timeouts and per-name rate limits; a
//! registry of app functions and capabilities reachable over JSON-RPC on
//! unix sockets; a scheduler and a trigger manager that fire intents or
//! calls; and keyword-based local intent recognition. [`engine`] wires them
//! together and [`control`] exposes them as JSON operations.

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod intent;
pub mod queue;
pub mod registry;
pub mod rpc;
pub mod runner;
pub mod scheduler;
pub mod spec;
pub mod triggers;

pub use config::EngineConfig;
pub use control::ControlSurface;
pub use engine::DecisionEngine;
pub use error::{EngineError, EngineResult};
pub use intent::{Intent, IntentRegistry, IntentType, LocalIntentRecognition};
pub use registry::{AppDirectory, FunctionRegistry, InMemoryAppDirectory, SqliteAppDirectory};
pub use rpc::{RpcClient, RpcError};
pub use runner::{Task, TaskRunner};
pub use scheduler::{RepeatInterval, Schedule, ScheduledTask, Scheduler};
pub use spec::{CapabilityKind, CapabilitySpec, FunctionSpec, ParamSpec};
pub use triggers::{Trigger, TriggerBinding, TriggerManager};
