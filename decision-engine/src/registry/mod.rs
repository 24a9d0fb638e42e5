//! Function and capability registry.
//!
//! The registry owns the name-keyed spec maps and is the single entry point
//! for running work by name. Lookups copy the descriptor out before dispatch so no
//! lock is held while work runs. Every outcome, including lookup misses,
//! reaches the caller through its completion callback.

pub mod apps;
pub mod builtins;
pub mod manifest;

pub use apps::{AppDirectory, InMemoryAppDirectory, SqliteAppDirectory};
pub use builtins::BuiltinCapabilities;

use crate::config::RegistryConfig;
use crate::error::{codes, error_json, is_error_result, panic_message, EngineError, EngineResult};
use crate::rpc::RpcClient;
use crate::runner::{Task, TaskRunner};
use crate::spec::{
    parse_function_name, short_method_name, validate_name, CapabilityKind, CapabilitySpec,
    CompletionCallback, FunctionSpec,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SpecMap<T> = Arc<Mutex<HashMap<String, T>>>;

fn lock<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(|e| e.into_inner())
}

/// Treats `target` as a socket path when it looks like one.
pub fn is_path_like(target: &str) -> bool {
    target.contains('/') || target.starts_with('.')
}

/// Socket resolution and JSON-RPC dispatch, shared by synthesized actions.
#[derive(Clone)]
struct RpcDispatch {
    apps: Arc<dyn AppDirectory>,
    rpc: Arc<RpcClient>,
    default_timeout_ms: u64,
}

impl RpcDispatch {
    fn resolve_socket(&self, target: &str) -> Option<String> {
        if target.is_empty() {
            return None;
        }
        self.apps
            .socket_location(target)
            .or_else(|| is_path_like(target).then(|| target.to_string()))
    }

    fn call(
        &self,
        target: &str,
        method: &str,
        timeout_ms: u64,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Value {
        let socket = match self.resolve_socket(target) {
            Some(s) => s,
            None => {
                warn!("[Registry] No socket for '{}' (method '{}')", target, method);
                return error_json(codes::SOCKET_NOT_FOUND);
            }
        };
        let timeout_ms = if timeout_ms > 0 {
            timeout_ms
        } else {
            self.default_timeout_ms
        };
        match self
            .rpc
            .call(&socket, method, args, Duration::from_millis(timeout_ms), cancel)
        {
            Ok(result) => result,
            Err(e) => e.to_json(),
        }
    }

    fn perform_function_rpc(
        &self,
        spec: &FunctionSpec,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Value {
        let app = if spec.app_name.is_empty() {
            parse_function_name(&spec.name)
                .map(|n| n.app.to_string())
                .unwrap_or_default()
        } else {
            spec.app_name.clone()
        };
        self.call(
            &app,
            short_method_name(&spec.name),
            spec.timeout_ms,
            args,
            cancel,
        )
    }

    fn perform_capability_rpc(
        &self,
        spec: &CapabilitySpec,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Value {
        self.call(
            &spec.entry,
            short_method_name(&spec.name),
            spec.timeout_ms,
            args,
            cancel,
        )
    }
}

/// Runs a callback, logging instead of propagating a panic.
fn notify(name: &str, callback: &(dyn Fn(&Value) + Send + Sync), value: &Value) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
        error!(
            "[Registry] Completion handler for '{}' panicked: {}",
            name,
            panic_message(payload.as_ref())
        );
    }
}

fn normalize_capability_result(value: Value) -> Value {
    if value.is_null() {
        json!({ "status": "ok" })
    } else {
        value
    }
}

pub struct FunctionRegistry {
    functions: SpecMap<FunctionSpec>,
    capabilities: SpecMap<CapabilitySpec>,
    builtins: BuiltinCapabilities,
    dispatch: RpcDispatch,
    runner: Arc<TaskRunner>,
    config: RegistryConfig,
}

impl FunctionRegistry {
    pub fn new(
        runner: Arc<TaskRunner>,
        rpc: Arc<RpcClient>,
        apps: Arc<dyn AppDirectory>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            functions: Arc::new(Mutex::new(HashMap::new())),
            capabilities: Arc::new(Mutex::new(HashMap::new())),
            builtins: BuiltinCapabilities::with_defaults(),
            dispatch: RpcDispatch {
                apps,
                rpc,
                default_timeout_ms: config.default_rpc_timeout_ms,
            },
            runner,
            config,
        }
    }

    pub fn builtins(&self) -> &BuiltinCapabilities {
        &self.builtins
    }

    pub fn apps(&self) -> &Arc<dyn AppDirectory> {
        &self.dispatch.apps
    }

    // ---- registration -------------------------------------------------

    /// Inserts a capability. RPC capabilities without an action get one
    /// that calls `entry`. Returns false for empty or duplicate names.
    pub fn register_capability(&self, spec: CapabilitySpec) -> bool {
        let name = spec.name.clone();
        match self.try_register_capability(spec) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Registry] Rejecting capability {:?}: {}", name, e);
                false
            }
        }
    }

    pub fn try_register_capability(&self, mut spec: CapabilitySpec) -> EngineResult<()> {
        validate_name(&spec.name)?;
        if spec.kind == CapabilityKind::Rpc && spec.action.is_none() {
            let dispatch = self.dispatch.clone();
            let target = spec.clone();
            spec.action = Some(Arc::new(move |args: &Value, cancel: &CancellationToken| {
                dispatch.perform_capability_rpc(&target, args, cancel)
            }));
        }

        let mut caps = lock(&self.capabilities);
        if caps.contains_key(&spec.name) {
            return Err(EngineError::Duplicate(spec.name));
        }
        debug!(
            "[Registry] Registered {} capability '{}'",
            spec.kind, spec.name
        );
        caps.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn unregister_capability(&self, name: &str) -> bool {
        lock(&self.capabilities).remove(name).is_some()
    }

    /// Registers `spec`, logging the reason when it is rejected.
    pub fn register_func(&self, spec: FunctionSpec) -> bool {
        let name = spec.name.clone();
        match self.try_register_func(spec) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Registry] Rejecting function {:?}: {}", name, e);
                false
            }
        }
    }

    /// Validates the `v<ver>.<app>.<fn>` grammar and that the app is
    /// installed before inserting.
    pub fn try_register_func(&self, mut spec: FunctionSpec) -> EngineResult<()> {
        let app = parse_function_name(&spec.name)
            .map(|parts| parts.app.to_string())
            .ok_or_else(|| EngineError::InvalidFunctionName(spec.name.clone()))?;
        if !self.dispatch.apps.is_registered(&app) {
            return Err(EngineError::UnknownApp(app));
        }
        if spec.app_name.is_empty() {
            spec.app_name = app;
        }

        let mut funcs = lock(&self.functions);
        if funcs.contains_key(&spec.name) {
            return Err(EngineError::Duplicate(spec.name));
        }
        info!("[Registry] Registered function '{}'", spec.name);
        funcs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn unregister_func(&self, name: &str) -> bool {
        let removed = lock(&self.functions).remove(name).is_some();
        if removed {
            info!("[Registry] Unregistered function '{}'", name);
        }
        removed
    }

    // ---- lookup -------------------------------------------------------

    pub fn find_function(&self, name: &str) -> Option<FunctionSpec> {
        lock(&self.functions).get(name).cloned()
    }

    pub fn find_capability(&self, name: &str) -> Option<CapabilitySpec> {
        lock(&self.capabilities).get(name).cloned()
    }

    pub fn set_function_enabled(&self, name: &str, enabled: bool) -> bool {
        match lock(&self.functions).get_mut(name) {
            Some(spec) => {
                spec.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_capability_enabled(&self, name: &str, enabled: bool) -> bool {
        match lock(&self.capabilities).get_mut(name) {
            Some(spec) => {
                spec.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.functions).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.capabilities).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn catalogue_json(&self) -> Value {
        let funcs = lock(&self.functions);
        let mut entries: Vec<&FunctionSpec> = funcs.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Value::Array(entries.iter().map(|f| f.to_catalogue_json()).collect())
    }

    pub fn capability_catalogue_json(&self) -> Value {
        let caps = lock(&self.capabilities);
        let mut entries: Vec<&CapabilitySpec> = caps.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Value::Array(entries.iter().map(|c| c.to_catalogue_json()).collect())
    }

    // ---- manifests ----------------------------------------------------

    /// Loads every manifest under `paths`. Core capabilities pick up their
    /// built-in handler by name; RPC capabilities without `entry` default
    /// to the owning app. Returns how many capabilities were registered.
    pub fn load_capability_manifests<P: AsRef<Path>>(&self, paths: &[P]) -> usize {
        let mut loaded = 0usize;
        for root in paths {
            let root = root.as_ref();
            for entry in manifest::discover_manifests(root) {
                let mut spec = entry.spec;
                match spec.kind {
                    CapabilityKind::Core => match self.builtins.get(&spec.name) {
                        Some(handler) => spec.action = Some(handler),
                        None => warn!(
                            "[Registry] Unrecognized core capability '{}' in {}; no action bound",
                            spec.name,
                            entry.path.display()
                        ),
                    },
                    CapabilityKind::Rpc => {
                        if spec.entry.is_empty() {
                            if let Some(app) = entry.owning_app {
                                spec.entry = app;
                            }
                        }
                    }
                }
                if self.register_capability(spec) {
                    loaded += 1;
                }
            }
        }
        info!("[Registry] Loaded {} capability manifests", loaded);
        loaded
    }

    /// Loads the configured shared directories plus the per-app layout.
    pub fn load_default_capability_manifests(&self) -> usize {
        let paths: Vec<PathBuf> = self.config.manifest_paths();
        self.load_capability_manifests(&paths)
    }

    // ---- execution ----------------------------------------------------

    pub fn perform_function_rpc(
        &self,
        spec: &FunctionSpec,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Value {
        self.dispatch.perform_function_rpc(spec, args, cancel)
    }

    pub fn perform_capability_rpc(
        &self,
        spec: &CapabilitySpec,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Value {
        self.dispatch.perform_capability_rpc(spec, args, cancel)
    }

    /// Runs a function over RPC through the task runner. The function's own
    /// completion handler runs before `on_complete`; a panic in one does
    /// not suppress the other.
    pub fn run_function_async<C>(&self, name: &str, args: Value, on_complete: C)
    where
        C: Fn(&Value) + Send + Sync + 'static,
    {
        let spec = match self.find_function(name) {
            Some(spec) => spec,
            None => {
                warn!("[Registry] Function '{}' not found", name);
                notify(name, &on_complete, &error_json(codes::FUNCTION_NOT_FOUND));
                return;
            }
        };
        if !spec.enabled {
            warn!("[Registry] Function '{}' is disabled", name);
            notify(name, &on_complete, &error_json(codes::FUNCTION_DISABLED));
            return;
        }

        let dispatch = self.dispatch.clone();
        let functions = self.functions.clone();
        let own_handler: Option<CompletionCallback> = spec.on_complete.clone();
        let task_name = spec.name.clone();
        let (timeout_ms, retry_limit, rate_limit_ms) =
            (spec.timeout_ms, spec.retry_limit, spec.rate_limit_ms);

        let task = Task::new(name, move |cancel: &CancellationToken| {
            dispatch.perform_function_rpc(&spec, &args, cancel)
        })
        .with_timeout_ms(timeout_ms)
        .with_retry_limit(retry_limit)
        .with_rate_limit_ms(rate_limit_ms)
        .with_on_complete(move |result: &Value| {
            if !is_error_result(result) {
                if let Some(spec) = lock(&functions).get_mut(&task_name) {
                    spec.last_called = Some(Utc::now());
                }
            }
            if let Some(handler) = &own_handler {
                notify(&task_name, handler.as_ref(), result);
            }
            notify(&task_name, &on_complete, result);
        });
        self.runner.enqueue(task);
    }

    /// Runs a capability's action through the task runner. Core capabilities
    /// without an explicit action fall back to the built-in table.
    pub fn run_capability_async<C>(&self, name: &str, args: Value, on_complete: C)
    where
        C: Fn(&Value) + Send + Sync + 'static,
    {
        let spec = match self.find_capability(name) {
            Some(spec) => spec,
            None => {
                warn!("[Registry] Capability '{}' not found", name);
                notify(name, &on_complete, &error_json(codes::CAPABILITY_NOT_FOUND));
                return;
            }
        };
        if !spec.enabled {
            warn!("[Registry] Capability '{}' is disabled", name);
            notify(name, &on_complete, &error_json(codes::CAPABILITY_DISABLED));
            return;
        }

        let action = spec.action.clone().or_else(|| match spec.kind {
            CapabilityKind::Core => self.builtins.get(&spec.name),
            CapabilityKind::Rpc => None,
        });
        let action = match action {
            Some(action) => action,
            None => {
                warn!("[Registry] Capability '{}' has no action", name);
                notify(name, &on_complete, &error_json(codes::CAPABILITY_NO_ACTION));
                return;
            }
        };

        let capabilities = self.capabilities.clone();
        let cap_name = spec.name.clone();
        let task = Task::new(name, move |cancel: &CancellationToken| {
            normalize_capability_result(action(&args, cancel))
        })
        .with_timeout_ms(spec.timeout_ms)
        .with_retry_limit(spec.retry_limit)
        .with_on_complete(move |result: &Value| {
            if !is_error_result(result) {
                if let Some(spec) = lock(&capabilities).get_mut(&cap_name) {
                    spec.last_called = Some(Utc::now());
                }
            }
            notify(&cap_name, &on_complete, result);
        });
        self.runner.enqueue(task);
    }
}
