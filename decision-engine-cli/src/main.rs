use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use decision_engine::{DecisionEngine, EngineConfig, FunctionSpec};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "decision-engine")]
#[command(about = "Decision engine: capabilities, scheduling, triggers and intents")]
struct Args {
    /// Path to the engine configuration file (TOML format)
    #[arg(long, env = "DECISION_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// How long to wait for a run to complete, in seconds
    #[arg(long, default_value_t = 60)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the function and capability catalogues as JSON
    Catalogue,
    /// Run a capability and print its result
    RunCapability {
        name: String,
        /// JSON arguments
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Run an app function over RPC and print its result
    RunFunction {
        name: String,
        /// JSON arguments
        #[arg(long, default_value = "{}")]
        args: String,
        /// Registration payload (JSON file) to register before running
        #[arg(long)]
        register: Option<PathBuf>,
    },
    /// Match text against the registered intents
    Recognize {
        text: String,
        /// Execute the matched intent and print its response
        #[arg(long)]
        execute: bool,
    },
    /// Invoke a control operation with a JSON body
    Control {
        operation: String,
        #[arg(long, default_value = "{}")]
        body: String,
    },
    /// Run the engine until Ctrl-C
    Daemon,
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON for {}", label))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("decision_engine=info".parse()?),
        )
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let wait = Duration::from_secs(args.wait_secs.max(1));

    let engine = DecisionEngine::from_config(config)?;
    engine.start()?;

    let outcome = run(&engine, args.command, wait);
    engine.shutdown();
    outcome
}

fn run(engine: &DecisionEngine, command: Command, wait: Duration) -> Result<()> {
    match command {
        Command::Catalogue => print_json(&serde_json::json!({
            "functions": engine.registry().catalogue_json(),
            "capabilities": engine.registry().capability_catalogue_json(),
        })),
        Command::RunCapability { name, args } => {
            let args = parse_json("--args", &args)?;
            let (tx, rx) = mpsc::channel();
            engine
                .registry()
                .run_capability_async(&name, args, move |result: &Value| {
                    let _ = tx.send(result.clone());
                });
            let result = rx
                .recv_timeout(wait)
                .map_err(|_| anyhow!("capability '{}' did not complete in time", name))?;
            print_json(&result)
        }
        Command::RunFunction {
            name,
            args,
            register,
        } => {
            if let Some(path) = register {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let spec = FunctionSpec::from_registration(&parse_json("--register", &raw)?)?;
                engine
                    .registry()
                    .try_register_func(spec)
                    .with_context(|| format!("registering {}", path.display()))?;
            }
            let args = parse_json("--args", &args)?;
            let (tx, rx) = mpsc::channel();
            engine
                .registry()
                .run_function_async(&name, args, move |result: &Value| {
                    let _ = tx.send(result.clone());
                });
            let result = rx
                .recv_timeout(wait)
                .map_err(|_| anyhow!("function '{}' did not complete in time", name))?;
            print_json(&result)
        }
        Command::Recognize { text, execute } => {
            let (tx, rx) = mpsc::channel();
            let accepted = engine
                .recognizer()
                .recognize_intent_async(&text, move |found| {
                    let _ = tx.send(found);
                });
            if !accepted {
                return Err(anyhow!("recognizer is not running"));
            }
            let found = rx
                .recv_timeout(wait)
                .map_err(|_| anyhow!("recognition did not complete in time"))?;
            match found {
                Some(m) => {
                    if execute {
                        m.intent.execute()?;
                    }
                    print_json(&serde_json::json!({
                        "intent": m.intent.name(),
                        "score": m.score,
                        "response": m.intent.response_string(),
                    }))
                }
                None => print_json(&Value::Null),
            }
        }
        Command::Control { operation, body } => {
            let body = parse_json("--body", &body)?;
            print_json(&engine.control().handle(&operation, &body))
        }
        Command::Daemon => {
            info!("Decision engine running; press Ctrl-C to stop");
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(tokio::signal::ctrl_c())?;
            info!("Shutting down");
            Ok(())
        }
    }
}
