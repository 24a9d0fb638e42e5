//! Error types for the decision engine.
//!
//! Two channels exist side by side:
//! - `EngineError` for synchronous failures (registration, manifest loading,
//!   configuration, intent execution).
//! - JSON values carrying an `error` key for everything delivered through a
//!   completion callback. The code strings live in [`codes`].

use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;

/// Error codes delivered to completion callbacks as `{"error": <code>}`.
pub mod codes {
    pub const FUNCTION_NOT_FOUND: &str = "function_not_found";
    pub const FUNCTION_DISABLED: &str = "function_disabled";
    pub const CAPABILITY_NOT_FOUND: &str = "capability_not_found";
    pub const CAPABILITY_DISABLED: &str = "capability_disabled";
    pub const CAPABILITY_NO_ACTION: &str = "capability_no_action";
    pub const SOCKET_NOT_FOUND: &str = "socket_not_found";
    pub const TIMEOUT: &str = "timeout";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const FAILED: &str = "failed";
    pub const RUNNER_STOPPED: &str = "runner_stopped";
    pub const RPC_ERROR: &str = "rpc_error";
    pub const RPC_TRANSPORT: &str = "rpc_transport";
    pub const CANCELLED: &str = "cancelled";
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid function name '{0}': expected v<digits>.<app>.<function>")]
    InvalidFunctionName(String),
    #[error("app '{0}' is not registered")]
    UnknownApp(String),
    #[error("'{0}' is already registered")]
    Duplicate(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("no action set for intent: {0}")]
    NoActionSet(String),
    #[error("action for '{name}' panicked: {message}")]
    ActionPanicked { name: String, message: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("app store error: {0}")]
    AppStore(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::AppStore(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Build the `{"error": code}` object used by the callback contract.
pub fn error_json(code: &str) -> Value {
    json!({ "error": code })
}

/// A result is a failure when it is a JSON object carrying an `error` key.
pub fn is_error_result(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.contains_key("error"))
        .unwrap_or(false)
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detection_requires_object_with_error_key() {
        assert!(is_error_result(&json!({"error": "x"})));
        assert!(!is_error_result(&json!({"status": "ok"})));
        assert!(!is_error_result(&json!("error")));
        assert!(!is_error_result(&json!([{"error": 1}])));
        assert!(!is_error_result(&Value::Null));
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let caught = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom");
        let caught = std::panic::catch_unwind(|| panic!("{}", String::from("owned"))).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "owned");
    }
}
