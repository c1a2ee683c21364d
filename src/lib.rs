//! # Verdict Policy Engine
//!
//! A general-purpose policy decision engine: policies are written in a
//! declarative rule language, data lives in a transactional document
//! store, and clients query paths of the virtual document tree to get
//! decisions.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Policy Source Code
//!     ↓
//! [Lexer + Parser]        → AST (modules, rules, terms)
//!     ↓
//! [Compiler]              → resolution, rewriting, safety,
//!     ↓                     types, recursion, conflicts, RuleIndex
//! CompiledPolicy (atomic snapshot)
//!     ↓
//! [Evaluator]  ←  Storage (base documents)
//!     ↓        ←  Built-ins (arithmetic .. http.send)
//! Decision (value + id + metrics)
//!     ↓
//! [Decision log / Status plugins] → control plane
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use verdict::{Config, PolicyEngine};
//! use verdict::value::Value;
//!
//! let engine = PolicyEngine::new(Config::default());
//! let policy = engine
//!     .compile_modules(&[(
//!         "authz.pol",
//!         "package authz\n\ndefault allow = false\nallow = true { input.user == \"alice\" }\n",
//!     )])
//!     .unwrap();
//! engine.set_policy(policy, Some("rev-1".to_string()));
//!
//! let input = Value::from_json_str(r#"{"user":"alice"}"#).unwrap();
//! let decision = engine.query("authz/allow", Some(input)).unwrap();
//! assert_eq!(decision.result, Some(Value::Bool(true)));
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Universal tagged value (numbers, strings, sets, refs) |
//! | `ast` | Modules, rules, heads, expressions, terms |
//! | `lexer` / `parser` | Source text → AST with error recovery |
//! | `compiler` | AST → executable policy with RuleIndex |
//! | `storage` | Transactional in-memory document store |
//! | `eval` | Top-down evaluator with unification and backtracking |
//! | `builtins` | Registry of pure and effectful functions |
//! | `bundle` | tar.gz policy/data bundles and validation |
//! | `plugins` | Bundle poller, status reporter, decision logger, discovery |
//! | `config` | Layered configuration (TOML + env) |

pub mod ast;
pub mod builtins;
pub mod bundle;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod eval;
pub mod lexer;
pub mod metrics;
pub mod parser;
pub mod plugins;
pub mod storage;
pub mod value;

pub use config::Config;
pub use errors::{Error, Result};
pub use eval::cancel::{CancelHandle, Cancellation};
pub use eval::{EvalError, QueryOptions, TraceEvent};
pub use metrics::Metrics;
pub use value::Value;

use arc_swap::ArcSwap;
use ast::Module;
use bundle::Bundle;
use chrono::{DateTime, SecondsFormat, Utc};
use compiler::{CompiledPolicy, Compiler};
use eval::Evaluator;
use parser::parse_module;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use storage::{Mode, PatchOp, Store};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The result of one external query, recorded with an audit identifier
/// and fanned out to the decision log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Random 128-bit audit identifier.
    pub decision_id: Uuid,

    /// Active bundle revision at evaluation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Queried path, `/`-separated.
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// The computed value; `None` when the reference was undefined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Client identifier supplied by the embedding service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,

    /// RFC 3339 timestamp with nanosecond precision.
    pub timestamp: String,

    #[serde(skip_serializing_if = "Metrics::is_empty", default)]
    pub metrics: Metrics,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The active compiled policy plus its revision, swapped atomically on
/// activation.
struct ActivePolicy {
    policy: Arc<CompiledPolicy>,
    revision: Option<String>,
}

/// The policy engine: owns the store, the built-in registry, and the
/// active-policy pointer. Queries pin both the policy and the data
/// snapshot at start, so an activation mid-query never disturbs an
/// in-flight evaluation.
pub struct PolicyEngine {
    config: Config,
    store: Store,
    registry: Arc<builtins::Registry>,
    active: ArcSwap<ActivePolicy>,
    decisions: parking_lot::Mutex<Option<crossbeam_channel::Sender<Decision>>>,
}

impl PolicyEngine {
    pub fn new(config: Config) -> Self {
        PolicyEngine {
            config,
            store: Store::new(),
            registry: Arc::new(builtins::Registry::standard()),
            active: ArcSwap::from_pointee(ActivePolicy {
                policy: Arc::new(CompiledPolicy::empty()),
                revision: None,
            }),
            decisions: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> Arc<builtins::Registry> {
        Arc::clone(&self.registry)
    }

    pub fn active_revision(&self) -> Option<String> {
        self.active.load().revision.clone()
    }

    /// Subscribe to decision events. Returns the receiving end of a
    /// bounded channel; events beyond the buffer are dropped (the
    /// decision logger records the drop count).
    pub fn subscribe_decisions(&self, buffer: usize) -> crossbeam_channel::Receiver<Decision> {
        let (tx, rx) = crossbeam_channel::bounded(buffer.max(1));
        *self.decisions.lock() = Some(tx);
        rx
    }

    /// Parse and compile modules against the current base documents.
    /// All parse and compile errors are collected and returned
    /// together; nothing is activated.
    pub fn compile_modules(&self, sources: &[(&str, &str)]) -> Result<CompiledPolicy> {
        let mut modules: Vec<Module> = Vec::new();
        let mut parse_errors = Vec::new();
        for (name, source) in sources {
            match parse_module(source) {
                Ok(module) => modules.push(module),
                Err(mut errors) => {
                    debug!(file = *name, count = errors.len(), "parse failed");
                    parse_errors.append(&mut errors);
                }
            }
        }
        if !parse_errors.is_empty() {
            return Err(Error::Parse(parse_errors));
        }

        let policy = Compiler::new(&self.registry)
            .with_max_errors(self.config.eval.max_errors)
            .with_base_paths(self.store.base_paths())
            .compile(modules)?;
        Ok(policy)
    }

    /// Swap in a compiled policy directly (no bundle).
    pub fn set_policy(&self, policy: CompiledPolicy, revision: Option<String>) {
        self.active.store(Arc::new(ActivePolicy {
            policy: Arc::new(policy),
            revision,
        }));
    }

    /// Activate a bundle: validate roots, compile its modules, write
    /// its data under the declared roots, and swap the compiled policy,
    /// all inside one write transaction. Any failure keeps the previous
    /// policy and data (fail-static).
    pub fn activate_bundle(&self, bundle: &Bundle) -> Result<()> {
        // Parse first so validation can see package paths.
        let mut modules = Vec::new();
        for (name, source) in &bundle.modules {
            match parse_module(source) {
                Ok(module) => modules.push(module),
                Err(errors) => {
                    warn!(file = name.as_str(), "bundle module failed to parse");
                    return Err(Error::Parse(errors));
                }
            }
        }
        let packages: Vec<Vec<String>> = modules.iter().map(Module::package_path).collect();
        bundle.validate(&packages)?;

        // Stage data writes under each declared root.
        let mut txn = self.store.new_transaction(Mode::Write);
        for root in bundle.manifest.root_paths() {
            let incoming = data_at(&bundle.data, &root);
            if root.is_empty() {
                self.store.write(
                    &mut txn,
                    PatchOp::Add,
                    &root,
                    incoming.unwrap_or_else(Value::empty_object),
                )?;
            } else {
                match incoming {
                    Some(value) => {
                        ensure_parents(&self.store, &mut txn, &root)?;
                        self.store.write(&mut txn, PatchOp::Add, &root, value)?;
                    }
                    None => {
                        // The bundle owns this root but ships no data
                        // for it; clear any previous contents.
                        if self.store.read(&txn, &root).is_ok() {
                            self.store.write(&mut txn, PatchOp::Remove, &root, Value::Null)?;
                        }
                    }
                }
            }
        }

        // Compile against the post-write base documents.
        let mut base_paths: Vec<Vec<String>> = Vec::new();
        if let Value::Object(map) = &bundle.data {
            base_paths.extend(
                map.keys()
                    .filter_map(|k| k.as_str().map(|s| vec![s.to_string()])),
            );
        }
        for existing in self.store.base_paths() {
            if !bundle.manifest.covers(&existing) && !base_paths.contains(&existing) {
                base_paths.push(existing);
            }
        }

        let policy = match Compiler::new(&self.registry)
            .with_max_errors(self.config.eval.max_errors)
            .with_base_paths(base_paths)
            .compile(modules)
        {
            Ok(policy) => policy,
            Err(errors) => {
                self.store.abort(txn);
                return Err(Error::Compile(errors));
            }
        };

        let revision = bundle.manifest.revision.clone();
        info!(revision = revision.as_deref().unwrap_or(""), "activating bundle");

        // Data publish and policy swap share the commit critical
        // section: both or neither.
        let active = &self.active;
        let policy = Arc::new(policy);
        self.store.commit_with(txn, || {
            active.store(Arc::new(ActivePolicy {
                policy: Arc::clone(&policy),
                revision: revision.clone(),
            }));
        })?;
        Ok(())
    }

    /// Answer a query for a path of the virtual document tree.
    pub fn query(&self, path: &str, input: Option<Value>) -> Result<Decision> {
        self.query_with_options(path, input, self.default_options(), None)
    }

    pub fn query_with_options(
        &self,
        path: &str,
        input: Option<Value>,
        opts: QueryOptions,
        requested_by: Option<String>,
    ) -> Result<Decision> {
        let segments: Vec<String> = path
            .split(['/', '.'])
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        // Pin the policy and data for the query's lifetime.
        let active = self.active.load();
        let data = self.store.snapshot();

        let mut metrics = Metrics::new();
        let mut evaluator = Evaluator::new(
            Arc::clone(&active.policy),
            Arc::clone(&self.registry),
            data,
            input.clone(),
            opts,
        );
        let outcome = metrics.time("eval_ns", || evaluator.eval_path(&segments));
        metrics.incr("queries");

        let mut decision = Decision {
            decision_id: Uuid::new_v4(),
            revision: active.revision.clone(),
            path: segments.join("/"),
            input,
            result: None,
            requested_by,
            timestamp: rfc3339_ns(Utc::now()),
            metrics,
            error: None,
        };

        match outcome {
            Ok(result) => {
                decision.result = result;
                self.emit(decision.clone());
                Ok(decision)
            }
            Err(err) => {
                decision.error = Some(err.to_string());
                self.emit(decision);
                Err(Error::Eval(err))
            }
        }
    }

    /// Evaluate an ad-hoc query string (used by the REPL and tests).
    pub fn eval_query_str(&self, source: &str) -> Result<Vec<BTreeMap<String, Value>>> {
        let query = parser::parse_query(source)?;
        let query = compiler::prepare_query(query, &self.registry)?;

        let active = self.active.load();
        let data = self.store.snapshot();
        let mut evaluator = Evaluator::new(
            Arc::clone(&active.policy),
            Arc::clone(&self.registry),
            data,
            None,
            self.default_options(),
        );
        Ok(evaluator.eval_query(&query)?)
    }

    fn default_options(&self) -> QueryOptions {
        let cancel = if self.config.eval.timeout_ms > 0 {
            Cancellation::new(Some(Duration::from_millis(self.config.eval.timeout_ms)))
        } else {
            Cancellation::unbounded()
        };
        QueryOptions {
            strict_builtin_errors: self.config.eval.strict_builtin_errors,
            trace: false,
            cancel,
            now_ns: None,
        }
    }

    fn emit(&self, decision: Decision) {
        let guard = self.decisions.lock();
        if let Some(tx) = guard.as_ref() {
            // A full buffer drops the event; the logger tracks drops
            // through its own accounting of what it received.
            let _ = tx.try_send(decision);
        }
    }
}

/// RFC 3339 with nanosecond precision, the decision-log wire format.
pub(crate) fn rfc3339_ns(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Navigate a ground data tree by path.
fn data_at(tree: &Value, path: &[String]) -> Option<Value> {
    let mut current = tree;
    for segment in path {
        current = current.get_key(&Value::String(segment.clone()))?;
    }
    Some(current.clone())
}

/// Make sure the object parents of `path` exist before an `add`.
fn ensure_parents(store: &Store, txn: &mut storage::Transaction, path: &[String]) -> Result<()> {
    for depth in 1..path.len() {
        let prefix = &path[..depth];
        if store.read(txn, prefix).is_err() {
            store.write(txn, PatchOp::Add, prefix, Value::empty_object())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(policy_src: &str) -> PolicyEngine {
        let engine = PolicyEngine::new(Config::default());
        let policy = engine
            .compile_modules(&[("test.pol", policy_src)])
            .expect("compile");
        engine.set_policy(policy, Some("r1".to_string()));
        engine
    }

    #[test]
    fn test_query_simple_allow() {
        let engine = engine_with(
            "package authz\n\ndefault allow = false\nallow = true { input.user == \"alice\" }\n",
        );
        let input = Value::from_json_str(r#"{"user":"alice"}"#).unwrap();
        let decision = engine.query("authz/allow", Some(input)).unwrap();
        assert_eq!(decision.result, Some(Value::Bool(true)));
        assert_eq!(decision.revision.as_deref(), Some("r1"));

        let input = Value::from_json_str(r#"{"user":"bob"}"#).unwrap();
        let decision = engine.query("authz/allow", Some(input)).unwrap();
        assert_eq!(decision.result, Some(Value::Bool(false)));
    }

    #[test]
    fn test_query_undefined() {
        let engine = engine_with("package p\n\nq = 1 { input.x }\n");
        let decision = engine.query("p/q", Some(Value::empty_object())).unwrap();
        assert_eq!(decision.result, None);
        assert!(decision.error.is_none());
    }

    #[test]
    fn test_decisions_emitted() {
        let engine = engine_with("package p\n\nq = 1\n");
        let rx = engine.subscribe_decisions(8);
        engine.query("p/q", None).unwrap();
        let event = rx.try_recv().expect("decision event");
        assert_eq!(event.path, "p/q");
        assert_eq!(event.result, Some(Value::number(1)));
    }

    #[test]
    fn test_decision_ids_unique() {
        let engine = engine_with("package p\n\nq = 1\n");
        let a = engine.query("p/q", None).unwrap();
        let b = engine.query("p/q", None).unwrap();
        assert_ne!(a.decision_id, b.decision_id);
    }

    #[test]
    fn test_timestamp_format() {
        let engine = engine_with("package p\n\nq = 1\n");
        let decision = engine.query("p/q", None).unwrap();
        // RFC 3339 with nanosecond precision: 2026-...T...:...Z
        assert!(decision.timestamp.ends_with('Z'));
        assert!(decision.timestamp.contains('T'));
        let frac = decision.timestamp.split('.').nth(1).expect("fraction");
        assert_eq!(frac.trim_end_matches('Z').len(), 9);
    }

    #[test]
    fn test_activate_bundle() {
        let engine = PolicyEngine::new(Config::default());
        let bundle = Bundle {
            manifest: bundle::Manifest {
                revision: Some("v7".to_string()),
                roots: Some(vec!["x".to_string(), "pkg".to_string()]),
            },
            modules: vec![(
                "pkg/rules.pol".to_string(),
                "package pkg\n\ndoubled = y { y := data.x.n * 2 }\n".to_string(),
            )],
            data: Value::from_json_str(r#"{"x":{"n":21}}"#).unwrap(),
        };
        engine.activate_bundle(&bundle).unwrap();
        assert_eq!(engine.active_revision().as_deref(), Some("v7"));

        let decision = engine.query("pkg/doubled", None).unwrap();
        assert_eq!(decision.result, Some(Value::number(42)));
    }

    #[test]
    fn test_failed_activation_is_fail_static() {
        let engine = PolicyEngine::new(Config::default());
        let good = Bundle {
            manifest: bundle::Manifest {
                revision: Some("good".to_string()),
                roots: Some(vec!["x".to_string()]),
            },
            modules: vec![],
            data: Value::from_json_str(r#"{"x":1}"#).unwrap(),
        };
        engine.activate_bundle(&good).unwrap();

        // Bundle B declares root /x but carries a broken module.
        let bad = Bundle {
            manifest: bundle::Manifest {
                revision: Some("bad".to_string()),
                roots: Some(vec!["x".to_string(), "p".to_string()]),
            },
            modules: vec![(
                "p/broken.pol".to_string(),
                "package p\n\nq = z { input.a }\n".to_string(),
            )],
            data: Value::from_json_str(r#"{"x":2}"#).unwrap(),
        };
        assert!(engine.activate_bundle(&bad).is_err());

        // Previous data and revision still active.
        assert_eq!(engine.active_revision().as_deref(), Some("good"));
        let txn = engine.store().new_transaction(Mode::Read);
        let x = engine
            .store()
            .read(&txn, &storage::parse_path("/x"))
            .unwrap();
        assert_eq!(x, Value::number(1));
    }

    #[test]
    fn test_eval_query_str() {
        let engine = engine_with("package p\n\nnums[x] { x := data.xs[_] }\n");
        let mut txn = engine.store().new_transaction(Mode::Write);
        engine
            .store()
            .write(
                &mut txn,
                PatchOp::Add,
                &storage::parse_path("/xs"),
                Value::from_json_str("[1,2,3]").unwrap(),
            )
            .unwrap();
        engine.store().commit(txn).unwrap();

        let solutions = engine.eval_query_str("data.p.nums[x]; x > 1").unwrap();
        assert_eq!(solutions.len(), 2);
    }

    #[test]
    fn test_compile_error_keeps_engine_running() {
        let engine = engine_with("package p\n\nq = 1\n");
        let err = engine
            .compile_modules(&[("bad.pol", "package p\n\nr = z { input.a }\n")])
            .unwrap_err();
        assert!(err.code().starts_with("compile/"));
        // Old policy still answers.
        let decision = engine.query("p/q", None).unwrap();
        assert_eq!(decision.result, Some(Value::number(1)));
    }
}
