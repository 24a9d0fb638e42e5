//! Engine wiring: builds every service once and hands out shared handles.

use crate::config::EngineConfig;
use crate::control::ControlSurface;
use crate::error::EngineResult;
use crate::intent::{IntentRegistry, LocalIntentRecognition};
use crate::registry::{AppDirectory, FunctionRegistry, InMemoryAppDirectory, SqliteAppDirectory};
use crate::rpc::RpcClient;
use crate::runner::TaskRunner;
use crate::scheduler::Scheduler;
use crate::triggers::TriggerManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct DecisionEngine {
    config: EngineConfig,
    runner: Arc<TaskRunner>,
    rpc: Arc<RpcClient>,
    registry: Arc<FunctionRegistry>,
    intents: Arc<IntentRegistry>,
    recognizer: Arc<LocalIntentRecognition>,
    scheduler: Arc<Scheduler>,
    triggers: Arc<TriggerManager>,
    control: ControlSurface,
    started: AtomicBool,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig, apps: Arc<dyn AppDirectory>) -> EngineResult<Self> {
        let runner = Arc::new(TaskRunner::new(config.runner.clone()));
        let rpc = Arc::new(RpcClient::new(config.rpc.clone()));
        let registry = Arc::new(FunctionRegistry::new(
            runner.clone(),
            rpc.clone(),
            apps,
            config.registry.clone(),
        ));
        let intents = Arc::new(IntentRegistry::new());
        let recognizer = Arc::new(LocalIntentRecognition::new(
            intents.clone(),
            config.recognition.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(runner.clone(), config.scheduler.clone())?);
        let triggers = Arc::new(TriggerManager::new(
            runner.clone(),
            intents.clone(),
            registry.clone(),
            config.triggers.clone(),
        ));
        let control = ControlSurface::new(
            scheduler.clone(),
            triggers.clone(),
            registry.clone(),
            intents.clone(),
        );

        Ok(Self {
            config,
            runner,
            rpc,
            registry,
            intents,
            recognizer,
            scheduler,
            triggers,
            control,
            started: AtomicBool::new(false),
        })
    }

    /// Opens the sqlite app directory when `[apps] database` is set,
    /// otherwise starts with an empty in-memory one.
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        let apps: Arc<dyn AppDirectory> = match &config.apps.database {
            Some(path) => {
                let store = SqliteAppDirectory::open(path)?;
                store.ensure_schema()?;
                Arc::new(store)
            }
            None => Arc::new(InMemoryAppDirectory::new()),
        };
        Self::new(config, apps)
    }

    /// Starts the runner, loads manifests, then starts the scheduler and
    /// the trigger poll loop. Returns how many capabilities were loaded.
    pub fn start(&self) -> EngineResult<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        self.runner.start(self.config.runner.worker_count())?;
        let loaded = self.registry.load_default_capability_manifests();
        self.scheduler.start();
        self.triggers.start()?;
        info!("[Engine] Started ({} capabilities loaded)", loaded);
        Ok(loaded)
    }

    /// Stops services in reverse start order. Pending runner work completes
    /// with `runner_stopped`.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.triggers.stop();
        self.scheduler.stop();
        self.runner.stop();
        info!("[Engine] Stopped");
    }

    /// Stops everything and joins the recognizer threads. The engine cannot
    /// be restarted afterwards.
    pub fn shutdown(&self) {
        self.stop();
        self.recognizer.shutdown();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub fn intents(&self) -> &Arc<IntentRegistry> {
        &self.intents
    }

    pub fn recognizer(&self) -> &Arc<LocalIntentRecognition> {
        &self.recognizer
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn triggers(&self) -> &Arc<TriggerManager> {
        &self.triggers
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }
}

impl Drop for DecisionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
