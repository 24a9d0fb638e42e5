//! Descriptors of callable work: functions offered by apps and device
//! capabilities, plus their manifest / registration / catalogue JSON forms.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FUNCTION_TIMEOUT_MS: u64 = 4000;
pub const DEFAULT_CAPABILITY_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_VERSION: &str = "1.0";

/// Callback receiving the final JSON result of a run.
pub type CompletionCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// In-process implementation of a capability. Receives the call arguments
/// and the attempt's cancellation token.
pub type CapabilityAction = Arc<dyn Fn(&Value, &CancellationToken) -> Value + Send + Sync>;

static FUNCTION_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(v[0-9_]+)\.([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_]*)$")
        .expect("function name pattern is valid")
});

/// Parts of a well-formed function name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionName<'a> {
    pub version: &'a str,
    pub app: &'a str,
    pub function: &'a str,
}

/// Splits `v<digits/underscores>.<app>.<function>`; `None` when malformed.
pub fn parse_function_name(name: &str) -> Option<FunctionName<'_>> {
    let caps = FUNCTION_NAME_RE.captures(name)?;
    Some(FunctionName {
        version: caps.get(1)?.as_str(),
        app: caps.get(2)?.as_str(),
        function: caps.get(3)?.as_str(),
    })
}

/// Names key registry maps and label worker threads, so they must be
/// non-blank and free of control characters.
pub fn validate_name(name: &str) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidName("name is empty".to_string()));
    }
    if name.chars().any(char::is_control) {
        return Err(EngineError::InvalidName(format!(
            "{:?} contains control characters",
            name
        )));
    }
    Ok(())
}

/// Last dot-separated segment, used as the JSON-RPC method.
pub fn short_method_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: String::new(),
            required: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

fn parse_parameters(value: Option<&Value>) -> EngineResult<Vec<ParamSpec>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v @ Value::Array(_)) => serde_json::from_value(v.clone())
            .map_err(|e| EngineError::InvalidPayload(format!("parameters: {}", e))),
        Some(_) => Err(EngineError::InvalidPayload(
            "parameters must be an array".to_string(),
        )),
    }
}

fn params_json(params: &[ParamSpec]) -> Value {
    serde_json::to_value(params).unwrap_or_else(|_| Value::Array(Vec::new()))
}

/// Reads the first present key among `keys` as an unsigned integer.
fn read_u64(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(Value::as_u64)
}

fn read_str<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(Value::as_str)
}

#[derive(Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub app_name: String,
    pub version: String,
    pub description: String,
    pub human_readable_name: String,
    pub parameters: Vec<ParamSpec>,
    pub on_complete: Option<CompletionCallback>,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub retry_limit: u32,
    pub last_called: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl Default for FunctionSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            app_name: String::new(),
            version: DEFAULT_VERSION.to_string(),
            description: String::new(),
            human_readable_name: String::new(),
            parameters: Vec::new(),
            on_complete: None,
            timeout_ms: DEFAULT_FUNCTION_TIMEOUT_MS,
            rate_limit_ms: 0,
            retry_limit: DEFAULT_RETRY_LIMIT,
            last_called: None,
            enabled: true,
        }
    }
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("app_name", &self.app_name)
            .field("version", &self.version)
            .field("parameters", &self.parameters)
            .field("timeout_ms", &self.timeout_ms)
            .field("rate_limit_ms", &self.rate_limit_ms)
            .field("retry_limit", &self.retry_limit)
            .field("enabled", &self.enabled)
            .field("has_on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses a registration payload. `name` and `parameters` are required.
    pub fn from_registration(payload: &Value) -> EngineResult<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("expected a JSON object".to_string()))?;
        let name = read_str(obj, &["name"])
            .ok_or_else(|| EngineError::InvalidPayload("missing 'name'".to_string()))?;
        if !obj.contains_key("parameters") {
            return Err(EngineError::InvalidPayload(
                "missing 'parameters'".to_string(),
            ));
        }

        let mut spec = FunctionSpec::new(name);
        spec.parameters = parse_parameters(obj.get("parameters"))?;
        if let Some(d) = read_str(obj, &["description"]) {
            spec.description = d.to_string();
        }
        if let Some(t) = read_u64(obj, &["timeout_ms", "timeoutMs"]) {
            spec.timeout_ms = t;
        }
        if let Some(a) = read_str(obj, &["app_name", "appName"]) {
            spec.app_name = a.to_string();
        }
        if let Some(v) = read_str(obj, &["version"]) {
            spec.version = v.to_string();
        }
        if let Some(h) = read_str(obj, &["human_readable_name", "humanReadableName"]) {
            spec.human_readable_name = h.to_string();
        }
        if let Some(r) = read_u64(obj, &["rate_limit", "rate_limit_ms", "rateLimitMs"]) {
            spec.rate_limit_ms = r;
        }
        if let Some(r) = read_u64(obj, &["retry_limit", "retryLimit"]) {
            spec.retry_limit = u32::try_from(r).unwrap_or(u32::MAX);
        }
        if let Some(e) = obj.get("enabled").and_then(Value::as_bool) {
            spec.enabled = e;
        }
        Ok(spec)
    }

    pub fn to_catalogue_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": params_json(&self.parameters),
            "timeoutMs": self.timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    #[default]
    Core,
    Rpc,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Core => "core",
            CapabilityKind::Rpc => "rpc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core" => Some(CapabilityKind::Core),
            "rpc" => Some(CapabilityKind::Rpc),
            _ => None,
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    pub action: Option<CapabilityAction>,
    pub timeout_ms: u64,
    pub retry_limit: u32,
    pub enabled: bool,
    pub kind: CapabilityKind,
    pub entry: String,
    pub parameters: Vec<ParamSpec>,
    pub last_called: Option<DateTime<Utc>>,
}

impl Default for CapabilitySpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            action: None,
            timeout_ms: DEFAULT_CAPABILITY_TIMEOUT_MS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            enabled: true,
            kind: CapabilityKind::Core,
            entry: String::new(),
            parameters: Vec::new(),
            last_called: None,
        }
    }
}

impl fmt::Debug for CapabilitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("entry", &self.entry)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry_limit", &self.retry_limit)
            .field("enabled", &self.enabled)
            .field("parameters", &self.parameters)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>, kind: CapabilityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn with_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&Value, &CancellationToken) -> Value + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    /// Parses one manifest file's content. Unlike `CapabilitySpec::default()`,
    /// a manifest without `retry_limit` does not retry.
    pub fn from_manifest(manifest: &Value) -> EngineResult<Self> {
        let obj = manifest
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("expected a JSON object".to_string()))?;
        let name = read_str(obj, &["name"])
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::InvalidPayload("missing 'name'".to_string()))?;
        validate_name(name)?;

        let kind = match read_str(obj, &["type"]) {
            None => CapabilityKind::Core,
            Some(t) => CapabilityKind::parse(t).ok_or_else(|| {
                EngineError::InvalidPayload(format!("unknown capability type '{}'", t))
            })?,
        };

        Ok(CapabilitySpec {
            name: name.to_string(),
            description: read_str(obj, &["description"]).unwrap_or_default().to_string(),
            action: None,
            timeout_ms: read_u64(obj, &["timeout_ms", "timeoutMs"])
                .unwrap_or(DEFAULT_CAPABILITY_TIMEOUT_MS),
            retry_limit: read_u64(obj, &["retry_limit", "retryLimit"])
                .map(|r| u32::try_from(r).unwrap_or(u32::MAX))
                .unwrap_or(0),
            enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            kind,
            entry: read_str(obj, &["entry"]).unwrap_or_default().to_string(),
            parameters: parse_parameters(obj.get("parameters"))?,
            last_called: None,
        })
    }

    pub fn to_catalogue_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "timeoutMs": self.timeout_ms,
            "type": self.kind.as_str(),
            "entry": self.entry,
            "parameters": params_json(&self.parameters),
        })
    }
}
