//! # Policy REPL
//!
//! A simple Read-Eval-Print Loop for the Verdict policy engine.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin verdict
//! ```
//!
//! Then load policies and run queries:
//! - `.load <file>` - Compile and activate a policy file
//! - `.data <json>` - Merge a JSON document into the store
//! - `.input <json>` - Set the input document for `.query`
//! - `.query <path>` - Evaluate a document path (e.g. authz/allow)
//! - `.quit` - Exit
//!
//! Anything else is evaluated as a query string, e.g.
//! `data.authz.allow == true`.

use anyhow::Context;
use std::io::{self, Write};
use std::sync::Arc;
use verdict::storage::{parse_path, Mode, PatchOp};
use verdict::{Config, PolicyEngine, Value};

fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_logging(&config);

    let engine = Arc::new(PolicyEngine::new(config.clone()));

    // Plugins run on a background runtime while the REPL owns stdin.
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let manager = match verdict::plugins::Manager::new(Arc::clone(&engine), &config) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            eprintln!("invalid plugin configuration: {e}");
            std::process::exit(1);
        }
    };
    {
        let manager = Arc::clone(&manager);
        runtime.spawn(async move {
            if let Err(e) = manager.start().await {
                tracing::error!(error = %e, "plugin startup failed");
            }
        });
    }

    // Signal-driven shutdown: stop plugins cleanly, then exit 2.
    {
        let manager = Arc::clone(&manager);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.stop().await;
                std::process::exit(2);
            }
        });
    }

    println!("Verdict Policy Engine REPL");
    println!("==========================\n");
    println!("Commands:");
    println!("  .load <file>   - Compile and activate a policy file");
    println!("  .data <json>   - Merge a JSON document into the store");
    println!("  .input <json>  - Set the input document for .query");
    println!("  .query <path>  - Evaluate a document path");
    println!("  .help          - Show this help");
    println!("  .quit          - Exit\n");

    let mut input_doc: Option<Value> = None;

    loop {
        print!("> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with(".quit") || line.starts_with(".exit") {
            break;
        }
        if line.starts_with(".help") {
            println!(".load <file> | .data <json> | .input <json> | .query <path> | .quit");
            continue;
        }
        if let Some(file) = line.strip_prefix(".load ") {
            match load_policy(&engine, file.trim()) {
                Ok(()) => println!("activated {file}"),
                Err(e) => println!("error: {e:#}"),
            }
            continue;
        }
        if let Some(json) = line.strip_prefix(".data ") {
            match write_data(&engine, json.trim()) {
                Ok(()) => println!("ok"),
                Err(e) => println!("error: {e:#}"),
            }
            continue;
        }
        if let Some(json) = line.strip_prefix(".input ") {
            match Value::from_json_str(json.trim()) {
                Ok(value) => {
                    input_doc = Some(value);
                    println!("ok");
                }
                Err(e) => println!("error: {e}"),
            }
            continue;
        }
        if let Some(path) = line.strip_prefix(".query ") {
            match engine.query(path.trim(), input_doc.clone()) {
                Ok(decision) => match decision.result {
                    Some(value) => println!("{value}"),
                    None => println!("undefined"),
                },
                Err(e) => println!("error: {e}"),
            }
            continue;
        }

        // Free-form query string.
        match engine.eval_query_str(line) {
            Ok(solutions) if solutions.is_empty() => println!("undefined"),
            Ok(solutions) => {
                for solution in solutions {
                    if solution.is_empty() {
                        println!("true");
                    } else {
                        let parts: Vec<String> = solution
                            .iter()
                            .map(|(name, value)| format!("{name} = {value}"))
                            .collect();
                        println!("{}", parts.join(", "));
                    }
                }
            }
            Err(e) => println!("error: {e}"),
        }
    }

    println!("Goodbye!");
    runtime.block_on(manager.stop());
    std::process::exit(0);
}

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_policy(engine: &PolicyEngine, file: &str) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    let policy = engine
        .compile_modules(&[(file, &source)])
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    engine.set_policy(policy, None);
    Ok(())
}

fn write_data(engine: &PolicyEngine, json: &str) -> anyhow::Result<()> {
    let value = Value::from_json_str(json).context("parsing JSON")?;
    let Value::Object(map) = value else {
        anyhow::bail!("data document must be a JSON object");
    };
    let store = engine.store();
    let mut txn = store.new_transaction(Mode::Write);
    for (key, item) in map {
        let Some(key) = key.as_str() else {
            anyhow::bail!("data keys must be strings");
        };
        store
            .write(&mut txn, PatchOp::Add, &parse_path(&format!("/{key}")), item)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    store.commit(txn).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
