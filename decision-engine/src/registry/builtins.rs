//! In-process handlers for `core` capabilities, keyed by capability name.

use crate::spec::CapabilityAction;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Names that ship with a placeholder handler until the device drivers
/// are wired in.
pub const PLACEHOLDER_CAPABILITIES: &[&str] = &[
    "core.audio.play",
    "core.audio.stop",
    "core.nfc.read",
    "core.nfc.write",
    "core.ui.notify",
    "core.ui.message_box",
];

pub struct BuiltinCapabilities {
    handlers: RwLock<HashMap<String, CapabilityAction>>,
}

impl BuiltinCapabilities {
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let builtins = Self::empty();
        builtins.register("core.ping", |_: &Value, _: &CancellationToken| {
            json!({ "status": "ok" })
        });
        for name in PLACEHOLDER_CAPABILITIES {
            let capability = name.to_string();
            builtins.register(name, move |args: &Value, _: &CancellationToken| {
                info!("[Registry] Placeholder capability '{}' called with {}", capability, args);
                json!({ "status": "ok", "placeholder": true, "capability": capability })
            });
        }
        builtins
    }

    /// Adds or replaces the handler for `name`.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value, &CancellationToken) -> Value + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<CapabilityAction> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for BuiltinCapabilities {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_ping_and_placeholders() {
        let builtins = BuiltinCapabilities::with_defaults();
        let ping = builtins.get("core.ping").unwrap();
        assert_eq!(ping(&Value::Null, &CancellationToken::new()), json!({"status": "ok"}));

        let notify = builtins.get("core.ui.notify").unwrap();
        let out = notify(&json!({"text": "hi"}), &CancellationToken::new());
        assert_eq!(out["placeholder"], json!(true));
        assert_eq!(out["capability"], json!("core.ui.notify"));
        assert_eq!(builtins.names().len(), 1 + PLACEHOLDER_CAPABILITIES.len());
    }

    #[test]
    fn registration_extends_the_table() {
        let builtins = BuiltinCapabilities::empty();
        assert!(!builtins.contains("core.led.blink"));
        builtins.register("core.led.blink", |_: &Value, _: &CancellationToken| json!({"blinked": 3}));
        assert!(builtins.contains("core.led.blink"));
    }
}
