mod common;

use common::{channel_callback, echo_handler, FakeApp, WAIT};
use decision_engine::config::{RegistryConfig, RpcConfig, RunnerConfig};
use decision_engine::error::EngineError;
use decision_engine::registry::{
    AppDirectory, FunctionRegistry, InMemoryAppDirectory, SqliteAppDirectory,
};
use decision_engine::rpc::RpcClient;
use decision_engine::runner::TaskRunner;
use decision_engine::spec::{CapabilityKind, CapabilitySpec, FunctionSpec};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    registry: FunctionRegistry,
    apps: Arc<InMemoryAppDirectory>,
    _runner: Arc<TaskRunner>,
}

fn fixture(config: RegistryConfig) -> Fixture {
    let runner = Arc::new(TaskRunner::new(RunnerConfig {
        workers: 2,
        base_backoff_ms: 5,
    }));
    runner.start(2).unwrap();
    let apps = Arc::new(InMemoryAppDirectory::new());
    let registry = FunctionRegistry::new(
        runner.clone(),
        Arc::new(RpcClient::new(RpcConfig::default())),
        apps.clone(),
        config,
    );
    Fixture {
        registry,
        apps,
        _runner: runner,
    }
}

fn no_manifests() -> RegistryConfig {
    RegistryConfig {
        capability_dirs: Vec::new(),
        apps_dir: None,
        default_rpc_timeout_ms: 1000,
    }
}

#[test]
fn function_names_must_follow_the_grammar_and_name_a_known_app() {
    let fx = fixture(no_manifests());
    fx.apps.register_app("lights", None);

    assert!(!fx.registry.register_func(FunctionSpec::new("lights.on")));
    assert!(!fx.registry.register_func(FunctionSpec::new("v1.lights")));
    assert!(!fx.registry.register_func(FunctionSpec::new("v1.unknown.on")));
    assert!(fx.registry.register_func(FunctionSpec::new("v1.lights.on")));
    assert!(!fx.registry.register_func(FunctionSpec::new("v1.lights.on")));

    let spec = fx.registry.find_function("v1.lights.on").unwrap();
    assert_eq!(spec.app_name, "lights");
    assert_eq!(fx.registry.function_names(), vec!["v1.lights.on"]);

    assert!(fx.registry.unregister_func("v1.lights.on"));
    assert!(fx.registry.find_function("v1.lights.on").is_none());
}

#[test]
fn rejected_registrations_explain_why() {
    let fx = fixture(no_manifests());
    fx.apps.register_app("lights", None);

    assert!(matches!(
        fx.registry.try_register_func(FunctionSpec::new("lights.on")),
        Err(EngineError::InvalidFunctionName(_))
    ));
    assert!(matches!(
        fx.registry.try_register_func(FunctionSpec::new("v1.garage.open")),
        Err(EngineError::UnknownApp(app)) if app == "garage"
    ));
    fx.registry
        .try_register_func(FunctionSpec::new("v1.lights.on"))
        .unwrap();
    assert!(matches!(
        fx.registry.try_register_func(FunctionSpec::new("v1.lights.on")),
        Err(EngineError::Duplicate(name)) if name == "v1.lights.on"
    ));

    assert!(matches!(
        fx.registry
            .try_register_capability(CapabilitySpec::new("core.bad\u{0}name", CapabilityKind::Core)),
        Err(EngineError::InvalidName(_))
    ));
    assert!(!fx
        .registry
        .register_capability(CapabilitySpec::new(" ", CapabilityKind::Core)));
    assert!(fx.registry.find_capability("core.bad\u{0}name").is_none());
}

#[test]
fn core_ping_answers_ok() {
    let fx = fixture(no_manifests());
    assert!(fx
        .registry
        .register_capability(CapabilitySpec::new("core.ping", CapabilityKind::Core)));

    let (callback, rx) = channel_callback();
    fx.registry.run_capability_async("core.ping", json!({}), callback);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), json!({"status": "ok"}));

    let spec = fx.registry.find_capability("core.ping").unwrap();
    assert!(spec.last_called.is_some());
}

#[test]
fn unknown_and_disabled_capabilities_report_synchronously() {
    let fx = fixture(no_manifests());
    let (callback, rx) = channel_callback();
    fx.registry.run_capability_async("core.nothing", json!({}), callback);
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(10)).unwrap(),
        json!({"error": "capability_not_found"})
    );

    fx.registry.register_capability(
        CapabilitySpec::new("local.echo", CapabilityKind::Core)
            .with_action(|args: &Value, _: &CancellationToken| args.clone()),
    );
    fx.registry.set_capability_enabled("local.echo", false);
    let (callback, rx) = channel_callback();
    fx.registry.run_capability_async("local.echo", json!({"x": 1}), callback);
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(10)).unwrap(),
        json!({"error": "capability_disabled"})
    );

    let (callback, rx) = channel_callback();
    fx.registry.run_function_async("v1.nobody.nothing", json!({}), callback);
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(10)).unwrap(),
        json!({"error": "function_not_found"})
    );
}

#[test]
fn unknown_core_capability_without_action_has_no_action() {
    let fx = fixture(no_manifests());
    fx.registry
        .register_capability(CapabilitySpec::new("core.teleport", CapabilityKind::Core));
    let (callback, rx) = channel_callback();
    fx.registry.run_capability_async("core.teleport", json!({}), callback);
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        json!({"error": "capability_no_action"})
    );
}

/// Knows a single app that never publishes a socket, and counts lookups.
struct SocketlessApp {
    name: &'static str,
    lookups: AtomicU32,
}

impl AppDirectory for SocketlessApp {
    fn is_registered(&self, app: &str) -> bool {
        app == self.name
    }

    fn socket_location(&self, _app: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        None
    }
}

#[test]
fn function_without_socket_fails_after_every_attempt() {
    let runner = Arc::new(TaskRunner::new(RunnerConfig {
        workers: 1,
        base_backoff_ms: 5,
    }));
    runner.start(1).unwrap();
    let apps = Arc::new(SocketlessApp {
        name: "ghost",
        lookups: AtomicU32::new(0),
    });
    let registry = FunctionRegistry::new(
        runner,
        Arc::new(RpcClient::new(RpcConfig::default())),
        apps.clone(),
        no_manifests(),
    );

    let mut spec = FunctionSpec::new("v1.ghost.haunt");
    spec.retry_limit = 2;
    spec.timeout_ms = 500;
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    spec.on_complete = Some(Arc::new(move |_: &Value| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(registry.register_func(spec));

    let (callback, rx) = channel_callback();
    registry.run_function_async("v1.ghost.haunt", json!({}), callback);
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        json!({"error": "socket_not_found"})
    );
    assert_eq!(apps.lookups.load(Ordering::SeqCst), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry
        .find_function("v1.ghost.haunt")
        .unwrap()
        .last_called
        .is_none());
}

#[test]
fn panicking_own_handler_does_not_starve_the_caller() {
    let fx = fixture(no_manifests());
    fx.apps.register_app("ghost", None);
    let mut spec = FunctionSpec::new("v1.ghost.boo");
    spec.retry_limit = 0;
    spec.on_complete = Some(Arc::new(|_: &Value| panic!("own handler exploded")));
    assert!(fx.registry.register_func(spec));

    let (callback, rx) = channel_callback();
    fx.registry.run_function_async("v1.ghost.boo", json!({}), callback);
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        json!({"error": "socket_not_found"})
    );
}

#[test]
fn panicking_caller_does_not_skip_the_own_handler() {
    let fx = fixture(no_manifests());
    fx.apps.register_app("ghost", None);
    let (own, rx) = channel_callback();
    let mut spec = FunctionSpec::new("v1.ghost.rattle");
    spec.retry_limit = 0;
    spec.on_complete = Some(Arc::new(own));
    assert!(fx.registry.register_func(spec));

    fx.registry
        .run_function_async("v1.ghost.rattle", json!({}), |_: &Value| {
            panic!("caller exploded")
        });
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        json!({"error": "socket_not_found"})
    );
}

#[test]
fn function_call_reaches_the_app_over_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(dir.path(), "lights", echo_handler());
    let fx = fixture(no_manifests());
    fx.apps.register_app("lights", Some(app.socket_str()));

    let spec = FunctionSpec::from_registration(&json!({
        "name": "v1.lights.set_level",
        "description": "Dim the lights",
        "parameters": [{"name": "level", "type": "int"}],
        "timeout_ms": 2000,
    }))
    .unwrap();
    assert!(fx.registry.register_func(spec));

    let (callback, rx) = channel_callback();
    fx.registry
        .run_function_async("v1.lights.set_level", json!({"level": 3}), callback);
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        json!({"method": "set_level", "params": {"level": 3}})
    );
    assert_eq!(app.request_count(), 1);
}

#[test]
fn manifests_load_with_owning_app_as_default_entry() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("capabilities");
    let apps_root = dir.path().join("apps");
    let app_caps = apps_root.join("media").join("capabilities");
    fs::create_dir_all(&shared).unwrap();
    fs::create_dir_all(&app_caps).unwrap();

    fs::write(
        shared.join("ping.json"),
        json!({"name": "core.ping", "type": "core", "description": "Liveness"}).to_string(),
    )
    .unwrap();
    fs::write(
        app_caps.join("play.json"),
        json!({"name": "media.play", "type": "rpc", "timeoutMs": 1500}).to_string(),
    )
    .unwrap();
    fs::write(app_caps.join("broken.json"), "{not json").unwrap();
    fs::write(app_caps.join("notes.txt"), "ignored").unwrap();

    let fx = fixture(RegistryConfig {
        capability_dirs: vec![shared],
        apps_dir: Some(apps_root),
        default_rpc_timeout_ms: 1000,
    });
    assert_eq!(fx.registry.load_default_capability_manifests(), 2);
    assert_eq!(fx.registry.capability_names(), vec!["core.ping", "media.play"]);

    let play = fx.registry.find_capability("media.play").unwrap();
    assert_eq!(play.kind, CapabilityKind::Rpc);
    assert_eq!(play.entry, "media");
    assert_eq!(play.retry_limit, 0);
    assert!(play.action.is_some());

    assert_eq!(
        fx.registry.capability_catalogue_json(),
        json!([
            {"name": "core.ping", "description": "Liveness", "timeoutMs": 2000,
             "type": "core", "entry": "", "parameters": []},
            {"name": "media.play", "description": "", "timeoutMs": 1500,
             "type": "rpc", "entry": "media", "parameters": []},
        ])
    );
}

#[test]
fn rpc_capability_resolves_socket_from_the_app_store() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(dir.path(), "media", echo_handler());

    let db: PathBuf = dir.path().join("apps.db");
    let store = SqliteAppDirectory::open(&db).unwrap();
    store.ensure_schema().unwrap();
    store
        .insert_app("app-42", "media", Some(app.socket_str().as_str()))
        .unwrap();

    let runner = Arc::new(TaskRunner::new(RunnerConfig::default()));
    runner.start(1).unwrap();
    let registry = FunctionRegistry::new(
        runner.clone(),
        Arc::new(RpcClient::new(RpcConfig::default())),
        Arc::new(store),
        no_manifests(),
    );

    let mut spec = CapabilitySpec::new("media.play", CapabilityKind::Rpc);
    spec.entry = "media".to_string();
    assert!(registry.register_capability(spec));

    let (callback, rx) = channel_callback();
    registry.run_capability_async("media.play", json!({"track": 7}), callback);
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        json!({"method": "play", "params": {"track": 7}})
    );
}

#[test]
fn path_like_entry_is_used_as_socket() {
    let dir = tempfile::tempdir().unwrap();
    let app = FakeApp::start(dir.path(), "direct", echo_handler());
    let fx = fixture(no_manifests());

    let mut spec = CapabilitySpec::new("direct.status", CapabilityKind::Rpc);
    spec.entry = app.socket_str();
    let result = fx
        .registry
        .perform_capability_rpc(&spec, &Value::Null, &CancellationToken::new());
    assert_eq!(result, json!({"method": "status", "params": []}));
}
