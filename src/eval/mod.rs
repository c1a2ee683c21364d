//! # Evaluator
//!
//! Top-down, goal-directed execution of compiled policies. A query
//! names a path into the virtual document tree; the evaluator resolves
//! it by unifying rule heads, expanding rule bodies, iterating over
//! documents, and consulting built-ins, backtracking through choice
//! points as bindings fail.
//!
//! ## Semantics
//!
//! - References drive iteration: a variable operand ranges over the
//!   keys/indices of the enclosing container.
//! - Virtual documents materialize on demand. Complete rules must agree
//!   on one value; partial-set rules union their keys; partial-object
//!   rules merge entries (a key with two values is a conflict).
//! - Negation is negation-as-failure over a child scope.
//! - `with` pushes an override frame over `input`/`data`; frames pop on
//!   exit regardless of success, and invalidate the memo table.
//! - Results are memoized per (path, override-epoch) for one query.
//! - `time.now_ns` is pinned at evaluation start; effectful built-ins
//!   cache by exact request signature for the query's lifetime.
//!
//! Failure splits three ways: undefined (normal control flow),
//! recoverable built-in errors (undefined unless strict mode), and
//! fatal errors (conflict, cancellation) that abort the query.

pub mod bindings;
pub mod cancel;

use crate::ast::{CompareOp, Expr, ExprKind, Query, Rule, RuleKind, Term};
use crate::builtins::{BuiltinContext, BuiltinError, Registry};
use crate::compiler::CompiledPolicy;
use crate::value::Value;
use bindings::Bindings;
use cancel::Cancellation;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Expressions between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 256;

/// Fatal evaluation errors. Undefined results are `Ok(None)`, not
/// errors.
#[derive(Error, Debug, Clone)]
pub enum EvalError {
    /// Two outputs where at most one was allowed.
    #[error("eval/conflict: {0}")]
    Conflict(String),

    /// Runtime operand or reference misuse.
    #[error("eval/type: {0}")]
    Type(String),

    /// A built-in raised an error in strict mode.
    #[error("eval/builtin: {0}")]
    Builtin(String),

    /// Query cancelled or deadline exceeded.
    #[error("eval/cancelled: {0}")]
    Cancelled(String),
}

impl EvalError {
    pub fn code(&self) -> &'static str {
        match self {
            EvalError::Conflict(_) => "eval/conflict",
            EvalError::Type(_) => "eval/type",
            EvalError::Builtin(_) => "eval/builtin",
            EvalError::Cancelled(_) => "eval/cancelled",
        }
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Options for one query evaluation.
#[derive(Clone)]
pub struct QueryOptions {
    /// Surface built-in errors instead of treating them as undefined.
    pub strict_builtin_errors: bool,
    /// Record a trace of rule entries and exits.
    pub trace: bool,
    pub cancel: Cancellation,
    /// Evaluation timestamp override (nanoseconds); defaults to the
    /// wall clock at evaluator construction.
    pub now_ns: Option<i64>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            strict_builtin_errors: false,
            trace: false,
            cancel: Cancellation::unbounded(),
            now_ns: None,
        }
    }
}

/// One entry of the evaluation trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    EnterRule(String),
    ExitRule(String),
}

type Emit<'k> = &'k mut dyn FnMut(&mut Evaluator) -> EvalResult<()>;
type EmitValue<'k> = &'k mut dyn FnMut(&mut Evaluator, Value) -> EvalResult<()>;

/// A single-query evaluator. Build one per query; it pins the policy
/// and data snapshot for its whole lifetime.
pub struct Evaluator {
    policy: Arc<CompiledPolicy>,
    registry: Arc<Registry>,
    data: Arc<Value>,
    input: Option<Value>,

    cancel: Cancellation,
    strict: bool,
    now_ns: i64,

    bindings: Bindings,
    scope: u32,
    next_scope: u32,
    steps: u64,

    /// Virtual-document memo per (path, override epoch).
    memo: HashMap<(Vec<String>, u64), Option<Value>>,
    in_progress: HashSet<Vec<String>>,
    call_cache: HashMap<(String, Vec<Value>), Value>,

    /// Override frames: effective input per frame.
    with_input: Vec<Option<Value>>,
    /// Override frames: effective data overrides per frame.
    with_data: Vec<Vec<(Vec<String>, Value)>>,
    with_epoch: u64,

    trace_enabled: bool,
    trace: Vec<TraceEvent>,
}

impl Evaluator {
    pub fn new(
        policy: Arc<CompiledPolicy>,
        registry: Arc<Registry>,
        data: Arc<Value>,
        input: Option<Value>,
        opts: QueryOptions,
    ) -> Self {
        let now_ns = opts.now_ns.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0)
        });
        Evaluator {
            policy,
            registry,
            data,
            input,
            cancel: opts.cancel,
            strict: opts.strict_builtin_errors,
            now_ns,
            bindings: Bindings::new(),
            scope: 0,
            next_scope: 1,
            steps: 0,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
            call_cache: HashMap::new(),
            with_input: Vec::new(),
            with_data: Vec::new(),
            with_epoch: 0,
            trace_enabled: opts.trace,
            trace: Vec::new(),
        }
    }

    /// Materialize the document at `path` under the `data` root.
    /// `Ok(None)` means the reference is undefined.
    pub fn eval_path(&mut self, path: &[String]) -> EvalResult<Option<Value>> {
        self.check_cancel()?;
        let terms: Vec<Term> = std::iter::once(Term::var("data"))
            .chain(path.iter().map(|s| Term::string(s.clone())))
            .collect();
        let mut result: Option<Value> = None;
        self.eval_term(&Term::Ref(terms), &mut |_, v| {
            result = Some(v);
            Ok(())
        })?;
        Ok(result)
    }

    /// Evaluate a prepared query body, returning the variable bindings
    /// of each solution.
    pub fn eval_query(&mut self, query: &Query) -> EvalResult<Vec<BTreeMap<String, Value>>> {
        let mut vars = BTreeSet::new();
        for expr in &query.body {
            expr.collect_vars(&mut vars);
        }
        vars.retain(|v| !v.starts_with("$w"));

        let mut solutions = Vec::new();
        let body = query.body.clone();
        self.eval_body(&body, 0, &mut |ev| {
            let mut solution = BTreeMap::new();
            for var in &vars {
                if let Some(value) = ev.bindings.get(ev.scope, var) {
                    solution.insert(var.clone(), value.clone());
                }
            }
            solutions.push(solution);
            Ok(())
        })?;
        Ok(solutions)
    }

    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn check_cancel(&self) -> EvalResult<()> {
        self.cancel
            .check()
            .map_err(|e| EvalError::Cancelled(e.to_string()))
    }

    fn step(&mut self) -> EvalResult<()> {
        self.steps += 1;
        if self.steps % CANCEL_CHECK_INTERVAL == 0 {
            self.check_cancel()?;
        }
        Ok(())
    }

    fn effective_input(&self) -> Option<&Value> {
        match self.with_input.last() {
            Some(frame) => frame.as_ref(),
            None => self.input.as_ref(),
        }
    }

    fn data_overrides(&self) -> &[(Vec<String>, Value)] {
        self.with_data.last().map_or(&[], |frame| frame.as_slice())
    }

    fn fresh_scope(&mut self) -> u32 {
        let scope = self.next_scope;
        self.next_scope += 1;
        scope
    }

    fn trace_push(&mut self, event: TraceEvent) {
        if self.trace_enabled {
            self.trace.push(event);
        }
    }

    // ------------------------------------------------------------------
    // Bodies and expressions
    // ------------------------------------------------------------------

    fn eval_body(&mut self, body: &[Expr], idx: usize, k: Emit<'_>) -> EvalResult<()> {
        if idx == body.len() {
            return k(self);
        }
        let expr = &body[idx];
        self.eval_expr(expr, &mut |ev| ev.eval_body(body, idx + 1, k))
    }

    fn eval_expr(&mut self, expr: &Expr, k: Emit<'_>) -> EvalResult<()> {
        self.step()?;
        if expr.with.is_empty() {
            return self.eval_expr_core(expr, k);
        }
        self.eval_with(expr, 0, k)
    }

    /// Apply `with` modifiers one at a time, then run the expression
    /// inside the final frame. Frames pop on exit regardless of
    /// success.
    fn eval_with(&mut self, expr: &Expr, widx: usize, k: Emit<'_>) -> EvalResult<()> {
        if widx == expr.with.len() {
            return self.eval_expr_core(expr, k);
        }
        let modifier = expr.with[widx].clone();
        let target = target_path(&modifier.target).ok_or_else(|| {
            EvalError::Type(format!(
                "with target must be a static input or data path: {}",
                modifier.target
            ))
        })?;
        self.eval_term(&modifier.value.clone(), &mut |ev, value| {
            ev.push_with_frame(&target, value)?;
            let result = ev.eval_with(expr, widx + 1, k);
            ev.pop_with_frame();
            result
        })
    }

    fn push_with_frame(&mut self, target: &WithTarget, value: Value) -> EvalResult<()> {
        match target {
            WithTarget::Input(path) => {
                let new_input = if path.is_empty() {
                    value
                } else {
                    let mut base = self
                        .effective_input()
                        .cloned()
                        .unwrap_or_else(Value::empty_object);
                    set_path(&mut base, path, value);
                    base
                };
                self.with_input.push(Some(new_input));
                self.with_data.push(self.data_overrides().to_vec());
            }
            WithTarget::Data(path) => {
                let mut overrides = self.data_overrides().to_vec();
                overrides.retain(|(p, _)| p != path);
                overrides.push((path.clone(), value));
                self.with_data.push(overrides);
                let current = self.effective_input().cloned();
                self.with_input.push(current);
            }
        }
        self.with_epoch += 1;
        Ok(())
    }

    fn pop_with_frame(&mut self) {
        self.with_input.pop();
        self.with_data.pop();
        self.with_epoch += 1;
    }

    fn eval_expr_core(&mut self, expr: &Expr, k: Emit<'_>) -> EvalResult<()> {
        if expr.negated {
            let mark = self.bindings.mark();
            let mut found = false;
            self.eval_positive(&expr.kind, &mut |_| {
                found = true;
                Ok(())
            })?;
            self.bindings.undo_to(mark);
            if found {
                return Ok(());
            }
            return k(self);
        }
        self.eval_positive(&expr.kind, k)
    }

    fn eval_positive(&mut self, kind: &ExprKind, k: Emit<'_>) -> EvalResult<()> {
        match kind {
            ExprKind::Term(t) => self.eval_term(t, &mut |ev, v| {
                if v == Value::Bool(false) {
                    Ok(())
                } else {
                    k(ev)
                }
            }),
            ExprKind::Eq(a, b) => self.unify_terms(a, b, k),
            ExprKind::Comparison(op, a, b) => {
                let op = *op;
                self.eval_term(a, &mut |ev, va| {
                    ev.eval_term(b, &mut |ev, vb| {
                        if compare(op, &va, &vb) {
                            k(ev)
                        } else {
                            Ok(())
                        }
                    })
                })
            }
            ExprKind::Call(name, args, _) => self.eval_call_statement(name, args, k),
            ExprKind::SomeDecl(_) => k(self),
            ExprKind::In {
                key,
                value,
                collection,
            } => self.eval_membership(key.as_ref(), value, collection, k),
            ExprKind::Block(body) => {
                let body = body.clone();
                self.eval_body(&body, 0, k)
            }
            ExprKind::Assign(..) | ExprKind::Every { .. } => Err(EvalError::Type(
                "expression form not eliminated by compilation".to_string(),
            )),
        }
    }

    /// Statement-position call: exact arity requires a truthy result;
    /// one extra argument captures the result by unification.
    fn eval_call_statement(&mut self, name: &str, args: &[Term], k: Emit<'_>) -> EvalResult<()> {
        let declared = if let Some(builtin) = self.registry.get(name) {
            builtin.signature.args.len()
        } else if let Some(rest) = name.strip_prefix("data.") {
            // User function: arity comes from its first definition.
            let path: Vec<String> = rest.split('.').map(String::from).collect();
            let policy = Arc::clone(&self.policy);
            policy
                .tree
                .node(&path)
                .and_then(|n| n.rules.first())
                .and_then(|r| r.head.args.as_ref().map(Vec::len))
                .unwrap_or(args.len())
        } else {
            args.len()
        };

        if args.len() == declared + 1 {
            let (capture, inputs) = args.split_last().map(|(l, i)| (l.clone(), i.to_vec())).ok_or_else(
                || EvalError::Type(format!("call to '{name}' has no arguments")),
            )?;
            let name = name.to_string();
            return self.eval_values(&inputs, 0, &mut Vec::new(), &mut |ev, values| {
                let values = values.to_vec();
                ev.invoke_callable(&name, &values, &mut |ev, result| {
                    ev.unify_term_value(&capture, &result, k)
                })
            });
        }

        let name = name.to_string();
        let args = args.to_vec();
        self.eval_values(&args, 0, &mut Vec::new(), &mut |ev, values| {
            let values = values.to_vec();
            ev.invoke_callable(&name, &values, &mut |ev, result| {
                if result == Value::Bool(false) {
                    Ok(())
                } else {
                    k(ev)
                }
            })
        })
    }

    fn eval_membership(
        &mut self,
        key: Option<&Term>,
        value: &Term,
        collection: &Term,
        k: Emit<'_>,
    ) -> EvalResult<()> {
        let key = key.cloned();
        let value = value.clone();
        self.eval_term(collection, &mut |ev, coll| {
            let entries: Vec<(Value, Value)> = match &coll {
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (Value::number(i as i64), v.clone()))
                    .collect(),
                Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                Value::Set(items) => items.iter().map(|v| (v.clone(), v.clone())).collect(),
                other => {
                    // A scalar has no members: a type error in strict
                    // mode, plain undefined otherwise.
                    if ev.strict {
                        return Err(EvalError::Type(format!(
                            "membership requires a collection, got {}",
                            other.type_name()
                        )));
                    }
                    return Ok(());
                }
            };
            for (entry_key, entry_value) in entries {
                let mark = ev.bindings.mark();
                let value = value.clone();
                let key = key.clone();
                ev.unify_term_value(&value, &entry_value, &mut |ev| match &key {
                    Some(key_term) => ev.unify_term_value(key_term, &entry_key, k),
                    None => k(ev),
                })?;
                ev.bindings.undo_to(mark);
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Terms
    // ------------------------------------------------------------------

    /// Evaluate a term to ground values, emitting once per result.
    /// Iteration inside refs makes this multi-valued; the bindings made
    /// along the way stay in place for each emission.
    fn eval_term(&mut self, term: &Term, k: EmitValue<'_>) -> EvalResult<()> {
        match term {
            Term::Value(Value::Var(name)) => {
                // The document roots are values too: bare `input` is
                // the whole input document, bare `data` the whole tree.
                if name == "input" {
                    return match self.effective_input().cloned() {
                        Some(input) => k(self, input),
                        None => Ok(()),
                    };
                }
                if name == "data" {
                    return match self.materialize_subtree(&[])? {
                        Some(tree) => k(self, tree),
                        None => k(self, Value::empty_object()),
                    };
                }
                let name = name.clone();
                match self.bindings.get(self.scope, &name) {
                    Some(value) => {
                        let value = value.clone();
                        k(self, value)
                    }
                    None => Err(EvalError::Type(format!("variable '{name}' is not bound"))),
                }
            }
            Term::Value(v) => {
                let v = v.clone();
                k(self, v)
            }
            Term::Array(items) => {
                let items = items.clone();
                self.eval_values(&items, 0, &mut Vec::new(), &mut |ev, values| {
                    k(ev, Value::Array(values.to_vec()))
                })
            }
            Term::Set(items) => {
                let items = items.clone();
                self.eval_values(&items, 0, &mut Vec::new(), &mut |ev, values| {
                    k(ev, Value::Set(values.iter().cloned().collect()))
                })
            }
            Term::Object(pairs) => {
                let mut flat = Vec::new();
                for (key, value) in pairs {
                    flat.push(key.clone());
                    flat.push(value.clone());
                }
                self.eval_values(&flat, 0, &mut Vec::new(), &mut |ev, values| {
                    let mut map = BTreeMap::new();
                    for pair in values.chunks(2) {
                        let prev = map.insert(pair[0].clone(), pair[1].clone());
                        if prev.is_some_and(|p| p != pair[1]) {
                            return Err(EvalError::Conflict(format!(
                                "object literal has conflicting values for key {}",
                                pair[0]
                            )));
                        }
                    }
                    k(ev, Value::Object(map))
                })
            }
            Term::Call(name, args, _) => {
                let name = name.clone();
                let args = args.clone();
                self.eval_values(&args, 0, &mut Vec::new(), &mut |ev, values| {
                    let values = values.to_vec();
                    ev.invoke_callable(&name, &values, k)
                })
            }
            Term::Ref(parts) => self.eval_ref(parts, k),
            Term::ArrayCompr { term, body } => {
                let term = (**term).clone();
                let body = body.clone();
                let mark = self.bindings.mark();
                let mut out = Vec::new();
                self.eval_body(&body, 0, &mut |ev| {
                    ev.eval_term(&term, &mut |_, v| {
                        out.push(v);
                        Ok(())
                    })
                })?;
                self.bindings.undo_to(mark);
                k(self, Value::Array(out))
            }
            Term::SetCompr { term, body } => {
                let term = (**term).clone();
                let body = body.clone();
                let mark = self.bindings.mark();
                let mut out = BTreeSet::new();
                self.eval_body(&body, 0, &mut |ev| {
                    ev.eval_term(&term, &mut |_, v| {
                        out.insert(v);
                        Ok(())
                    })
                })?;
                self.bindings.undo_to(mark);
                k(self, Value::Set(out))
            }
            Term::ObjectCompr { key, value, body } => {
                let key = (**key).clone();
                let value = (**value).clone();
                let body = body.clone();
                let mark = self.bindings.mark();
                let mut out: BTreeMap<Value, Value> = BTreeMap::new();
                self.eval_body(&body, 0, &mut |ev| {
                    ev.eval_term(&key, &mut |ev, kv| {
                        let kv = kv.clone();
                        ev.eval_term(&value, &mut |_, vv| {
                            if let Some(prev) = out.get(&kv) {
                                if *prev != vv {
                                    return Err(EvalError::Conflict(format!(
                                        "object comprehension has conflicting values for key {kv}"
                                    )));
                                }
                            }
                            out.insert(kv.clone(), vv);
                            Ok(())
                        })
                    })
                })?;
                self.bindings.undo_to(mark);
                k(self, Value::Object(out))
            }
        }
    }

    /// Evaluate a sequence of terms, chaining through each combination
    /// of their values.
    fn eval_values(
        &mut self,
        terms: &[Term],
        idx: usize,
        acc: &mut Vec<Value>,
        k: &mut dyn FnMut(&mut Evaluator, &[Value]) -> EvalResult<()>,
    ) -> EvalResult<()> {
        if idx == terms.len() {
            let values: Vec<Value> = acc.clone();
            return k(self, &values);
        }
        let term = terms[idx].clone();
        self.eval_term(&term, &mut |ev, value| {
            acc.push(value);
            let result = ev.eval_values(terms, idx + 1, acc, k);
            acc.pop();
            result
        })
    }

    /// Dispatch a call: built-in or user-defined function.
    fn invoke_callable(
        &mut self,
        name: &str,
        args: &[Value],
        k: EmitValue<'_>,
    ) -> EvalResult<()> {
        if self.registry.contains(name) {
            let registry = Arc::clone(&self.registry);
            let mut ctx = BuiltinContext {
                cancel: &self.cancel,
                now_ns: self.now_ns,
                call_cache: &mut self.call_cache,
            };
            match registry.invoke(name, &mut ctx, args) {
                Ok(value) => return k(self, value),
                Err(BuiltinError::Cancelled) => {
                    return Err(EvalError::Cancelled("built-in interrupted".to_string()))
                }
                Err(BuiltinError::Message(msg)) => {
                    if self.strict {
                        return Err(EvalError::Builtin(msg));
                    }
                    // Recoverable: the call is undefined.
                    return Ok(());
                }
            }
        }
        if let Some(rest) = name.strip_prefix("data.") {
            let path: Vec<String> = rest.split('.').map(String::from).collect();
            return self.call_function(&path, args, k);
        }
        Err(EvalError::Type(format!("unknown function '{name}'")))
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    fn eval_ref(&mut self, parts: &[Term], k: EmitValue<'_>) -> EvalResult<()> {
        let Some(head) = parts.first() else {
            return Err(EvalError::Type("empty reference".to_string()));
        };
        let rest: Vec<Term> = parts[1..].to_vec();
        match head.as_var() {
            Some("input") => match self.effective_input().cloned() {
                Some(input) => self.walk_value(&input, &rest, k),
                None => Ok(()),
            },
            Some("data") => self.descend_data(Vec::new(), &rest, k),
            Some(name) => {
                let name = name.to_string();
                match self.bindings.get(self.scope, &name).cloned() {
                    Some(value) => self.walk_value(&value, &rest, k),
                    None => Err(EvalError::Type(format!("variable '{name}' is not bound"))),
                }
            }
            None => {
                let head = head.clone();
                self.eval_term(&head, &mut |ev, value| ev.walk_value(&value, &rest, k))
            }
        }
    }

    /// Walk a concrete value along the remaining ref segments.
    fn walk_value(&mut self, current: &Value, rest: &[Term], k: EmitValue<'_>) -> EvalResult<()> {
        self.step()?;
        let Some(seg) = rest.first() else {
            let v = current.clone();
            return k(self, v);
        };
        let tail: Vec<Term> = rest[1..].to_vec();

        // Unbound-variable segment: iterate the container.
        if let Some(name) = seg.as_var() {
            if !self.bindings.is_bound(self.scope, name) {
                let name = name.to_string();
                let entries: Vec<(Value, Value)> = match current {
                    Value::Array(items) => items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| (Value::number(i as i64), v.clone()))
                        .collect(),
                    Value::Object(map) => {
                        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                    }
                    Value::Set(items) => items.iter().map(|v| (v.clone(), v.clone())).collect(),
                    _ => return Ok(()),
                };
                for (key, value) in entries {
                    let mark = self.bindings.mark();
                    let scope = self.scope;
                    self.bindings.bind(scope, &name, key);
                    self.walk_value(&value, &tail, k)?;
                    self.bindings.undo_to(mark);
                }
                return Ok(());
            }
        }

        // Ground (or groundable) segment: evaluate and index.
        let seg = seg.clone();
        let current = current.clone();
        self.eval_term(&seg, &mut |ev, key| match current.index(&key) {
            Some(next) => {
                let next = next.clone();
                ev.walk_value(&next, &tail, k)
            }
            None => Ok(()),
        })
    }

    // ------------------------------------------------------------------
    // The data document: base + virtual + overrides
    // ------------------------------------------------------------------

    /// Resolve a ref under `data`, descending through static segments
    /// and materializing once a rule node, dynamic segment, or leaf is
    /// reached.
    fn descend_data(&mut self, path: Vec<String>, rest: &[Term], k: EmitValue<'_>) -> EvalResult<()> {
        // `with data.path as v` shadows everything below it.
        if let Some(covered) = self.override_covering(&path) {
            return match covered {
                Some(value) => self.walk_value(&value, rest, k),
                None => Ok(()),
            };
        }

        let policy = Arc::clone(&self.policy);
        if let Some(node) = policy.tree.node(&path) {
            if !node.rules.is_empty() {
                if node.rules[0].kind() == RuleKind::Function {
                    // Functions are callable, not documents.
                    return Ok(());
                }
                return match self.materialize_rules(&path)? {
                    Some(value) => self.walk_value(&value, rest, k),
                    None => Ok(()),
                };
            }
        }

        match rest.first() {
            None => match self.materialize_subtree(&path)? {
                Some(value) => {
                    let value = value.clone();
                    k(self, value)
                }
                None => Ok(()),
            },
            Some(Term::Value(Value::String(segment))) => {
                let mut next = path;
                next.push(segment.clone());
                self.descend_data(next, &rest[1..], k)
            }
            Some(_) => match self.materialize_subtree(&path)? {
                Some(value) => self.walk_value(&value, rest, k),
                None => Ok(()),
            },
        }
    }

    /// Effective override exactly covering `path`, if any. `Some(None)`
    /// means an override covers the path but the value underneath it is
    /// absent (the reference is undefined).
    fn override_covering(&self, path: &[String]) -> Option<Option<Value>> {
        for (override_path, value) in self.data_overrides().iter().rev() {
            if path.starts_with(override_path) {
                let rest = &path[override_path.len()..];
                let mut current = value;
                for segment in rest {
                    match current.get_key(&Value::String(segment.clone())) {
                        Some(next) => current = next,
                        None => return Some(None),
                    }
                }
                return Some(Some(current.clone()));
            }
        }
        None
    }

    /// Base document subtree at `path`, from the pinned data snapshot.
    fn base_at(&self, path: &[String]) -> Option<Value> {
        let mut current: &Value = &self.data;
        for segment in path {
            current = current.get_key(&Value::String(segment.clone()))?;
        }
        Some(current.clone())
    }

    /// Materialize the whole document subtree at `path`: base data
    /// merged with every virtual document below, with overrides
    /// applied.
    fn materialize_subtree(&mut self, path: &[String]) -> EvalResult<Option<Value>> {
        let memo_key = (path.to_vec(), self.with_epoch);
        if let Some(cached) = self.memo.get(&memo_key) {
            return Ok(cached.clone());
        }

        let policy = Arc::clone(&self.policy);
        let node = policy.tree.node(path);

        let result = if let Some(node) = node.filter(|n| !n.rules.is_empty()) {
            if node.rules[0].kind() == RuleKind::Function {
                None
            } else {
                self.materialize_rules(path)?
            }
        } else {
            let base = self.base_at(path);
            let mut children: BTreeMap<Value, Value> = BTreeMap::new();
            if let Some(node) = node {
                for name in node.children.keys() {
                    let mut child_path = path.to_vec();
                    child_path.push(name.clone());
                    if let Some(value) = self.materialize_subtree(&child_path)? {
                        children.insert(Value::String(name.clone()), value);
                    }
                }
            }
            match (base, children.is_empty()) {
                (Some(Value::Object(mut map)), false) => {
                    map.extend(children);
                    Some(Value::Object(map))
                }
                (Some(base), true) => Some(base),
                (Some(base), false) => {
                    // Disjointness makes this unreachable for valid
                    // policies; prefer the virtual tree.
                    let _ = base;
                    Some(Value::Object(children))
                }
                (None, false) => Some(Value::Object(children)),
                (None, true) => None,
            }
        };

        // Overrides strictly below this path overlay the result.
        let mut result = result;
        let deeper: Vec<(Vec<String>, Value)> = self
            .data_overrides()
            .iter()
            .filter(|(p, _)| p.len() > path.len() && p.starts_with(path))
            .cloned()
            .collect();
        if !deeper.is_empty() {
            let mut tree = result.take().unwrap_or_else(Value::empty_object);
            for (override_path, value) in deeper {
                set_path(&mut tree, &override_path[path.len()..], value);
            }
            result = Some(tree);
        }

        self.memo.insert(memo_key, result.clone());
        Ok(result)
    }

    /// Materialize the virtual document defined by the rules at `path`.
    fn materialize_rules(&mut self, path: &[String]) -> EvalResult<Option<Value>> {
        self.check_cancel()?;
        let memo_key = (path.to_vec(), self.with_epoch);
        if let Some(cached) = self.memo.get(&memo_key) {
            return Ok(cached.clone());
        }
        if !self.in_progress.insert(path.to_vec()) {
            return Err(EvalError::Type(format!(
                "rule data.{} references itself during its own evaluation",
                path.join(".")
            )));
        }
        let name = format!("data.{}", path.join("."));
        self.trace_push(TraceEvent::EnterRule(name.clone()));

        let result = self.materialize_rules_inner(path);

        self.in_progress.remove(path);
        self.trace_push(TraceEvent::ExitRule(name));

        let result = result?;
        self.memo.insert(memo_key, result.clone());
        Ok(result)
    }

    fn materialize_rules_inner(&mut self, path: &[String]) -> EvalResult<Option<Value>> {
        let policy = Arc::clone(&self.policy);
        let node = policy
            .tree
            .node(path)
            .ok_or_else(|| EvalError::Type(format!("no rules at data.{}", path.join("."))))?;

        let candidates: Vec<&Rule> = match &node.index {
            Some(index) => index
                .candidates(self.effective_input())
                .into_iter()
                .map(|i| &node.rules[i])
                .collect(),
            None => node.rules.iter().collect(),
        };

        let kind = node.rules[0].kind();
        match kind {
            RuleKind::Complete => {
                let mut outcome: Option<Value> = None;
                for rule in candidates {
                    if rule.is_default {
                        continue;
                    }
                    for value in self.eval_rule_chain(rule)? {
                        match &outcome {
                            Some(existing) if *existing != value => {
                                return Err(EvalError::Conflict(format!(
                                    "complete rule data.{} produced multiple values",
                                    path.join(".")
                                )));
                            }
                            _ => outcome = Some(value),
                        }
                    }
                }
                if outcome.is_none() {
                    outcome = self.default_value(&node.rules)?;
                }
                Ok(outcome)
            }
            RuleKind::PartialSet => {
                let mut set = BTreeSet::new();
                for rule in candidates {
                    self.eval_rule_solutions(rule, &mut |ev| {
                        let key = rule
                            .head
                            .key
                            .clone()
                            .ok_or_else(|| EvalError::Type("partial rule without key".into()))?;
                        ev.eval_term(&key, &mut |_, v| {
                            set.insert(v);
                            Ok(())
                        })
                    })?;
                }
                Ok(Some(Value::Set(set)))
            }
            RuleKind::PartialObject => {
                let mut map: BTreeMap<Value, Value> = BTreeMap::new();
                for rule in candidates {
                    let key_term = rule
                        .head
                        .key
                        .clone()
                        .ok_or_else(|| EvalError::Type("partial rule without key".into()))?;
                    let value_term = rule
                        .head
                        .value
                        .clone()
                        .ok_or_else(|| EvalError::Type("partial object without value".into()))?;
                    let path_name = path.join(".");
                    self.eval_rule_solutions(rule, &mut |ev| {
                        ev.eval_term(&key_term, &mut |ev, key| {
                            let key = key.clone();
                            ev.eval_term(&value_term, &mut |_, value| {
                                if let Some(existing) = map.get(&key) {
                                    if *existing != value {
                                        return Err(EvalError::Conflict(format!(
                                            "partial object data.{path_name} has conflicting values for key {key}"
                                        )));
                                    }
                                }
                                map.insert(key.clone(), value);
                                Ok(())
                            })
                        })
                    })?;
                }
                Ok(Some(Value::Object(map)))
            }
            RuleKind::Function => Ok(None),
        }
    }

    /// Values produced by one rule and its else chain: the else branch
    /// applies only when the rule's body yields no solution.
    fn eval_rule_chain(&mut self, rule: &Rule) -> EvalResult<Vec<Value>> {
        let mut values = Vec::new();
        let value_term = rule
            .head
            .value
            .clone()
            .ok_or_else(|| EvalError::Type("complete rule without value".into()))?;
        self.eval_rule_solutions(rule, &mut |ev| {
            ev.eval_term(&value_term, &mut |_, v| {
                values.push(v);
                Ok(())
            })
        })?;
        if values.is_empty() {
            if let Some(else_rule) = &rule.else_rule {
                return self.eval_rule_chain(else_rule);
            }
        }
        Ok(values)
    }

    /// Run a rule body in a fresh scope, invoking the callback once per
    /// solution with the scope active.
    fn eval_rule_solutions(&mut self, rule: &Rule, on_solution: Emit<'_>) -> EvalResult<()> {
        if rule.is_default {
            return Ok(());
        }
        let saved_scope = self.scope;
        self.scope = self.fresh_scope();
        let mark = self.bindings.mark();
        let body = rule.body.clone();
        let result = self.eval_body(&body, 0, on_solution);
        self.bindings.undo_to(mark);
        self.scope = saved_scope;
        result
    }

    /// The declared default value of a rule set, if any.
    fn default_value(&mut self, rules: &[Rule]) -> EvalResult<Option<Value>> {
        for rule in rules {
            if !rule.is_default {
                continue;
            }
            let value_term = rule
                .head
                .value
                .clone()
                .ok_or_else(|| EvalError::Type("default rule without value".into()))?;
            let mut out = None;
            let saved_scope = self.scope;
            self.scope = self.fresh_scope();
            self.eval_term(&value_term, &mut |_, v| {
                out = Some(v);
                Ok(())
            })?;
            self.scope = saved_scope;
            return Ok(out);
        }
        Ok(None)
    }

    /// Call a user-defined function at `path` with ground arguments.
    fn call_function(&mut self, path: &[String], args: &[Value], k: EmitValue<'_>) -> EvalResult<()> {
        self.check_cancel()?;
        let policy = Arc::clone(&self.policy);
        let node = policy
            .tree
            .node(path)
            .ok_or_else(|| EvalError::Type(format!("unknown function data.{}", path.join("."))))?;
        if node.rules.is_empty() || node.rules[0].kind() != RuleKind::Function {
            return Err(EvalError::Type(format!(
                "data.{} is not a function",
                path.join(".")
            )));
        }

        let mut outcome: Option<Value> = None;
        for rule in &node.rules {
            if rule.is_default {
                continue;
            }
            for value in self.eval_function_rule_chain(rule, args, path)? {
                match &outcome {
                    Some(existing) if *existing != value => {
                        return Err(EvalError::Conflict(format!(
                            "function data.{} produced multiple values",
                            path.join(".")
                        )));
                    }
                    _ => outcome = Some(value),
                }
            }
        }

        if outcome.is_none() {
            outcome = self.function_default(&node.rules, args)?;
        }
        match outcome {
            Some(value) => k(self, value),
            None => Ok(()),
        }
    }

    fn eval_function_rule_chain(
        &mut self,
        rule: &Rule,
        args: &[Value],
        path: &[String],
    ) -> EvalResult<Vec<Value>> {
        let params = rule
            .head
            .args
            .clone()
            .ok_or_else(|| EvalError::Type("function rule without arguments".into()))?;
        if params.len() != args.len() {
            return Err(EvalError::Type(format!(
                "function data.{} expects {} argument(s), got {}",
                path.join("."),
                params.len(),
                args.len()
            )));
        }
        let value_term = rule
            .head
            .value
            .clone()
            .ok_or_else(|| EvalError::Type("function rule without value".into()))?;

        let saved_scope = self.scope;
        self.scope = self.fresh_scope();
        let mark = self.bindings.mark();

        let mut values = Vec::new();
        let body = rule.body.clone();
        let args = args.to_vec();
        let result = self.unify_params(&params, &args, 0, &mut |ev| {
            ev.eval_body(&body, 0, &mut |ev| {
                ev.eval_term(&value_term, &mut |_, v| {
                    values.push(v);
                    Ok(())
                })
            })
        });

        self.bindings.undo_to(mark);
        self.scope = saved_scope;
        result?;

        if values.is_empty() {
            if let Some(else_rule) = &rule.else_rule {
                return self.eval_function_rule_chain(else_rule, &args, path);
            }
        }
        Ok(values)
    }

    fn unify_params(
        &mut self,
        params: &[Term],
        args: &[Value],
        idx: usize,
        k: Emit<'_>,
    ) -> EvalResult<()> {
        if idx == params.len() {
            return k(self);
        }
        let param = params[idx].clone();
        let arg = args[idx].clone();
        self.unify_term_value(&param, &arg, &mut |ev| {
            ev.unify_params(params, args, idx + 1, k)
        })
    }

    fn function_default(&mut self, rules: &[Rule], args: &[Value]) -> EvalResult<Option<Value>> {
        for rule in rules {
            if !rule.is_default {
                continue;
            }
            let params = rule.head.args.clone().unwrap_or_default();
            if params.len() != args.len() {
                continue;
            }
            return self.default_value(std::slice::from_ref(rule));
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Unification
    // ------------------------------------------------------------------

    fn unify_terms(&mut self, a: &Term, b: &Term, k: Emit<'_>) -> EvalResult<()> {
        // Structural cases where both sides may carry patterns.
        match (a, b) {
            (Term::Array(xs), Term::Array(ys)) => {
                if xs.len() != ys.len() {
                    return Ok(());
                }
                let xs = xs.clone();
                let ys = ys.clone();
                return self.unify_term_pairs(&xs, &ys, 0, k);
            }
            _ => {}
        }

        // Bind an unbound variable from the other side.
        if let Some(name) = a.as_var() {
            if !self.bindings.is_bound(self.scope, name) {
                let name = name.to_string();
                return self.eval_term(b, &mut |ev, value| {
                    let mark = ev.bindings.mark();
                    let scope = ev.scope;
                    ev.bindings.bind(scope, &name, value);
                    k(ev)?;
                    ev.bindings.undo_to(mark);
                    Ok(())
                });
            }
        }
        if let Some(name) = b.as_var() {
            if !self.bindings.is_bound(self.scope, name) {
                let name = name.to_string();
                return self.eval_term(a, &mut |ev, value| {
                    let mark = ev.bindings.mark();
                    let scope = ev.scope;
                    ev.bindings.bind(scope, &name, value);
                    k(ev)?;
                    ev.bindings.undo_to(mark);
                    Ok(())
                });
            }
        }

        // Pattern against value: pick the side without unbound vars to
        // evaluate first.
        if self.has_unbound(b) && !self.has_unbound(a) {
            let b = b.clone();
            return self.eval_term(a, &mut |ev, value| ev.unify_term_value(&b, &value, k));
        }
        let a = a.clone();
        self.eval_term(b, &mut |ev, value| {
            ev.unify_term_value(&a, &value, k)
        })
    }

    fn unify_term_pairs(
        &mut self,
        xs: &[Term],
        ys: &[Term],
        idx: usize,
        k: Emit<'_>,
    ) -> EvalResult<()> {
        if idx == xs.len() {
            return k(self);
        }
        let x = xs[idx].clone();
        let y = ys[idx].clone();
        self.unify_terms(&x, &y, &mut |ev| ev.unify_term_pairs(xs, ys, idx + 1, k))
    }

    /// Unify a term (possibly a pattern with unbound variables) against
    /// a ground value. The callback runs with the pattern's bindings in
    /// place; they roll back once the callback returns so the next
    /// alternative starts clean.
    fn unify_term_value(&mut self, term: &Term, value: &Value, k: Emit<'_>) -> EvalResult<()> {
        match term {
            Term::Value(Value::Var(name)) => {
                if let Some(bound) = self.bindings.get(self.scope, name).cloned() {
                    if bound == *value {
                        return k(self);
                    }
                    return Ok(());
                }
                let mark = self.bindings.mark();
                let scope = self.scope;
                self.bindings.bind(scope, name, value.clone());
                k(self)?;
                self.bindings.undo_to(mark);
                Ok(())
            }
            Term::Value(ground) => {
                if ground == value {
                    k(self)
                } else {
                    Ok(())
                }
            }
            Term::Array(items) => {
                let Value::Array(values) = value else {
                    return Ok(());
                };
                if items.len() != values.len() {
                    return Ok(());
                }
                let items = items.clone();
                let values = values.clone();
                self.unify_pattern_values(&items, &values, 0, k)
            }
            Term::Object(pairs) => {
                let Value::Object(map) = value else {
                    return Ok(());
                };
                if pairs.len() != map.len() {
                    return Ok(());
                }
                let pairs = pairs.clone();
                let map = map.clone();
                self.unify_object_pattern(&pairs, &map, 0, k)
            }
            Term::Set(_) | Term::Ref(_) | Term::Call(..) | Term::ArrayCompr { .. }
            | Term::SetCompr { .. } | Term::ObjectCompr { .. } => {
                let value = value.clone();
                self.eval_term(&term.clone(), &mut |ev, candidate| {
                    if candidate == value {
                        k(ev)
                    } else {
                        Ok(())
                    }
                })
            }
        }
    }

    fn unify_pattern_values(
        &mut self,
        items: &[Term],
        values: &[Value],
        idx: usize,
        k: Emit<'_>,
    ) -> EvalResult<()> {
        if idx == items.len() {
            return k(self);
        }
        let item = items[idx].clone();
        let value = values[idx].clone();
        self.unify_term_value(&item, &value, &mut |ev| {
            ev.unify_pattern_values(items, values, idx + 1, k)
        })
    }

    fn unify_object_pattern(
        &mut self,
        pairs: &[(Term, Term)],
        map: &BTreeMap<Value, Value>,
        idx: usize,
        k: Emit<'_>,
    ) -> EvalResult<()> {
        if idx == pairs.len() {
            return k(self);
        }
        let (key_term, value_term) = pairs[idx].clone();
        let map_clone = map.clone();
        self.eval_term(&key_term, &mut |ev, key| {
            match map_clone.get(&key) {
                Some(found) => {
                    let found = found.clone();
                    ev.unify_term_value(&value_term, &found, &mut |ev| {
                        ev.unify_object_pattern(pairs, &map_clone, idx + 1, k)
                    })
                }
                None => Ok(()),
            }
        })
    }

    fn has_unbound(&self, term: &Term) -> bool {
        let mut vars = BTreeSet::new();
        term.collect_vars(&mut vars);
        vars.iter().any(|v| !self.bindings.is_bound(self.scope, v))
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

enum WithTarget {
    Input(Vec<String>),
    Data(Vec<String>),
}

/// Static path of a `with` target ref.
fn target_path(term: &Term) -> Option<WithTarget> {
    let (head, rest): (&str, &[Term]) = match term {
        Term::Value(Value::Var(name)) => (name, &[]),
        Term::Ref(parts) => (parts.first()?.as_var()?, &parts[1..]),
        _ => return None,
    };
    let mut path = Vec::new();
    for part in rest {
        match part {
            Term::Value(Value::String(s)) => path.push(s.clone()),
            _ => return None,
        }
    }
    match head {
        "input" => Some(WithTarget::Input(path)),
        "data" => Some(WithTarget::Data(path)),
        _ => None,
    }
}

/// Set `value` at `path` inside `tree`, creating objects along the way.
fn set_path(tree: &mut Value, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *tree = value;
        return;
    };
    if !matches!(tree, Value::Object(_)) {
        *tree = Value::empty_object();
    }
    if let Value::Object(map) = tree {
        let entry = map
            .entry(Value::String(first.clone()))
            .or_insert_with(Value::empty_object);
        set_path(entry, rest, value);
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Neq => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Lte => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Gte => a >= b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::parser::parse_module;

    fn evaluator(modules: &[&str], data: &str, input: Option<&str>) -> Evaluator {
        let registry = Arc::new(Registry::standard());
        let parsed: Vec<_> = modules
            .iter()
            .map(|m| parse_module(m).expect("parse"))
            .collect();
        let policy = Compiler::new(&registry)
            .compile(parsed)
            .unwrap_or_else(|e| panic!("compile failed: {e:?}"));
        Evaluator::new(
            Arc::new(policy),
            registry,
            Arc::new(Value::from_json_str(data).expect("data json")),
            input.map(|i| Value::from_json_str(i).expect("input json")),
            QueryOptions::default(),
        )
    }

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(String::from).collect()
    }

    #[test]
    fn test_simple_allow() {
        let module = "package p\n\nallow = true { input.user == \"alice\" }\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"user":"alice"}"#));
        assert_eq!(ev.eval_path(&path("p.allow")).unwrap(), Some(Value::Bool(true)));

        let mut ev = evaluator(&[module], "{}", Some(r#"{"user":"bob"}"#));
        assert_eq!(ev.eval_path(&path("p.allow")).unwrap(), None);
    }

    #[test]
    fn test_partial_set_of_violations() {
        let module = "package p\n\nviolations[s] {\n    s := data.servers[_]\n    s.protocols[_] == \"http\"\n    data.public[s.id]\n}\n";
        let data = r#"{"servers":[{"id":"s1","protocols":["http"]},{"id":"s2","protocols":["https"]}],"public":{"s1":true,"s2":true}}"#;
        let mut ev = evaluator(&[module], data, None);
        let result = ev.eval_path(&path("p.violations")).unwrap().unwrap();
        let expected = Value::set_from(vec![
            Value::from_json_str(r#"{"id":"s1","protocols":["http"]}"#).unwrap()
        ]);
        assert_eq!(result, expected);
    }

    #[test]
    fn test_complete_rule_conflict() {
        let module = "package p\n\nq = 1 { input.x }\nq = 2 { input.x }\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"x":true}"#));
        let err = ev.eval_path(&path("p.q")).unwrap_err();
        assert_eq!(err.code(), "eval/conflict");
    }

    #[test]
    fn test_agreeing_complete_rules_ok() {
        let module = "package p\n\nq = 1 { input.x }\nq = 1 { input.y }\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"x":true,"y":true}"#));
        assert_eq!(ev.eval_path(&path("p.q")).unwrap(), Some(Value::number(1)));
    }

    #[test]
    fn test_negation_and_membership() {
        let module = "package p\n\ndeny if not (\"admin\" in input.roles)\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"roles":["user","admin"]}"#));
        assert_eq!(ev.eval_path(&path("p.deny")).unwrap(), None);

        let mut ev = evaluator(&[module], "{}", Some(r#"{"roles":["user"]}"#));
        assert_eq!(ev.eval_path(&path("p.deny")).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_function_with_default() {
        let module = "package p\n\ndefault score(_) = 0\nscore(u) = 10 { u.vip }\n\nvip_score = s { s := data.p.score({\"vip\": true}) }\nplain_score = s { s := data.p.score({}) }\n";
        let mut ev = evaluator(&[module], "{}", None);
        assert_eq!(
            ev.eval_path(&path("p.vip_score")).unwrap(),
            Some(Value::number(10))
        );
        assert_eq!(
            ev.eval_path(&path("p.plain_score")).unwrap(),
            Some(Value::number(0))
        );
    }

    #[test]
    fn test_default_rule_value() {
        let module = "package p\n\ndefault allow = false\nallow = true { input.admin }\n";
        let mut ev = evaluator(&[module], "{}", Some("{}"));
        assert_eq!(ev.eval_path(&path("p.allow")).unwrap(), Some(Value::Bool(false)));

        let mut ev = evaluator(&[module], "{}", Some(r#"{"admin":true}"#));
        assert_eq!(ev.eval_path(&path("p.allow")).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_else_chain_order() {
        let module =
            "package p\n\nq = 1 { input.a } else = 2 { input.b } else = 3 { true }\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"b":true}"#));
        assert_eq!(ev.eval_path(&path("p.q")).unwrap(), Some(Value::number(2)));

        let mut ev = evaluator(&[module], "{}", Some("{}"));
        assert_eq!(ev.eval_path(&path("p.q")).unwrap(), Some(Value::number(3)));
    }

    #[test]
    fn test_partial_object() {
        let module = "package p\n\nports[name] = n { name := \"http\"; n := 80 }\nports[name] = n { name := \"https\"; n := 443 }\n";
        let mut ev = evaluator(&[module], "{}", None);
        let result = ev.eval_path(&path("p.ports")).unwrap().unwrap();
        assert_eq!(
            result,
            Value::object_from(vec![
                (Value::string("http"), Value::number(80)),
                (Value::string("https"), Value::number(443)),
            ])
        );
    }

    #[test]
    fn test_partial_object_conflict() {
        let module = "package p\n\nports[name] = n { name := \"http\"; n := 80 }\nports[name] = n { name := \"http\"; n := 8080 }\n";
        let mut ev = evaluator(&[module], "{}", None);
        let err = ev.eval_path(&path("p.ports")).unwrap_err();
        assert_eq!(err.code(), "eval/conflict");
    }

    #[test]
    fn test_comprehensions() {
        let module = "package p\n\ndoubles = [y | x := data.xs[_]; y := x * 2]\nuniq = {x | x := data.xs[_]}\n";
        let mut ev = evaluator(&[module], r#"{"xs":[1,2,2,3]}"#, None);
        assert_eq!(
            ev.eval_path(&path("p.doubles")).unwrap(),
            Some(Value::Array(vec![
                Value::number(2),
                Value::number(4),
                Value::number(4),
                Value::number(6)
            ]))
        );
        assert_eq!(
            ev.eval_path(&path("p.uniq")).unwrap(),
            Some(Value::set_from(vec![
                Value::number(1),
                Value::number(2),
                Value::number(3)
            ]))
        );
    }

    #[test]
    fn test_every_quantifier() {
        let module = "package p\n\nall_positive if every x in input.xs { x > 0 }\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"xs":[1,2,3]}"#));
        assert_eq!(
            ev.eval_path(&path("p.all_positive")).unwrap(),
            Some(Value::Bool(true))
        );

        let mut ev = evaluator(&[module], "{}", Some(r#"{"xs":[1,-2,3]}"#));
        assert_eq!(ev.eval_path(&path("p.all_positive")).unwrap(), None);
    }

    #[test]
    fn test_with_modifier_overrides_input() {
        let module = "package p\n\nallow = true { input.user == \"alice\" }\n\nas_bob = a { a := data.p.allow with input as {\"user\": \"bob\"} }\nas_alice = a { a := data.p.allow with input as {\"user\": \"alice\"} }\n";
        let mut ev = evaluator(&[module], "{}", Some(r#"{"user":"carol"}"#));
        assert_eq!(ev.eval_path(&path("p.as_bob")).unwrap(), None);
        assert_eq!(
            ev.eval_path(&path("p.as_alice")).unwrap(),
            Some(Value::Bool(true))
        );
        // The outer input is untouched after the frames pop.
        assert_eq!(ev.eval_path(&path("p.allow")).unwrap(), None);
    }

    #[test]
    fn test_with_data_override() {
        let module = "package p\n\nthreshold = t { t := data.settings.limit }\nbig = true { data.p.threshold > 100 }\ncheck = b { b := data.p.big with data.settings.limit as 500 }\n";
        let mut ev = evaluator(&[module], r#"{"settings":{"limit":10}}"#, None);
        assert_eq!(ev.eval_path(&path("p.big")).unwrap(), None);
        assert_eq!(ev.eval_path(&path("p.check")).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_package_materialization() {
        let module = "package p\n\na = 1\nb[x] { x := 2 }\n";
        let mut ev = evaluator(&[module], "{}", None);
        let doc = ev.eval_path(&path("p")).unwrap().unwrap();
        assert_eq!(
            doc.get_key(&Value::string("a")),
            Some(&Value::number(1))
        );
        assert_eq!(
            doc.get_key(&Value::string("b")),
            Some(&Value::set_from(vec![Value::number(2)]))
        );
    }

    #[test]
    fn test_base_and_virtual_merge_at_root() {
        let module = "package p\n\nq = 1\n";
        let mut ev = evaluator(&[module], r#"{"servers":[1,2]}"#, None);
        let root = ev.eval_path(&[]).unwrap().unwrap();
        assert!(root.get_key(&Value::string("servers")).is_some());
        assert!(root.get_key(&Value::string("p")).is_some());
    }

    #[test]
    fn test_iteration_over_base_data() {
        let module = "package p\n\nids[id] { id := data.servers[_].id }\n";
        let data = r#"{"servers":[{"id":"s1"},{"id":"s2"}]}"#;
        let mut ev = evaluator(&[module], data, None);
        assert_eq!(
            ev.eval_path(&path("p.ids")).unwrap(),
            Some(Value::set_from(vec![
                Value::string("s1"),
                Value::string("s2")
            ]))
        );
    }

    #[test]
    fn test_builtin_error_lenient_vs_strict() {
        let module = "package p\n\nq = x { x := 1 / 0 }\n";
        let mut ev = evaluator(&[module], "{}", None);
        // Default mode: undefined.
        assert_eq!(ev.eval_path(&path("p.q")).unwrap(), None);

        let registry = Arc::new(Registry::standard());
        let parsed = vec![parse_module(module).expect("parse")];
        let policy = Compiler::new(&registry).compile(parsed).expect("compile");
        let mut strict = Evaluator::new(
            Arc::new(policy),
            registry,
            Arc::new(Value::empty_object()),
            None,
            QueryOptions {
                strict_builtin_errors: true,
                ..QueryOptions::default()
            },
        );
        let err = strict.eval_path(&path("p.q")).unwrap_err();
        assert_eq!(err.code(), "eval/builtin");
    }

    #[test]
    fn test_cancellation_aborts() {
        let module = "package p\n\nq = true { true }\n";
        let registry = Arc::new(Registry::standard());
        let parsed = vec![parse_module(module).expect("parse")];
        let policy = Compiler::new(&registry).compile(parsed).expect("compile");
        let cancel = Cancellation::unbounded();
        cancel.cancel();
        let mut ev = Evaluator::new(
            Arc::new(policy),
            registry,
            Arc::new(Value::empty_object()),
            None,
            QueryOptions {
                cancel,
                ..QueryOptions::default()
            },
        );
        let err = ev.eval_path(&path("p.q")).unwrap_err();
        assert_eq!(err.code(), "eval/cancelled");
    }

    #[test]
    fn test_time_now_pinned() {
        let module = "package p\n\nsame = true { time.now_ns() == time.now_ns() }\n";
        let mut ev = evaluator(&[module], "{}", None);
        assert_eq!(ev.eval_path(&path("p.same")).unwrap(), Some(Value::Bool(true)));
    }

    #[test]
    fn test_determinism_across_evaluations() {
        let module = "package p\n\nout[x] { x := data.xs[_] * 2 }\n";
        let data = r#"{"xs":[3,1,2]}"#;
        let mut first = evaluator(&[module], data, None);
        let mut second = evaluator(&[module], data, None);
        assert_eq!(
            first.eval_path(&path("p.out")).unwrap(),
            second.eval_path(&path("p.out")).unwrap()
        );
    }

    #[test]
    fn test_eval_query_bindings() {
        let module = "package p\n\nnums[x] { x := data.xs[_] }\n";
        let mut ev = evaluator(&[module], r#"{"xs":[1,2]}"#, None);
        let query = crate::parser::parse_query("data.p.nums[x]").expect("query");
        let solutions = ev.eval_query(&query).unwrap();
        assert_eq!(solutions.len(), 2);
        assert_eq!(solutions[0].get("x"), Some(&Value::number(1)));
    }

    #[test]
    fn test_cross_module_same_package() {
        let m1 = "package p\n\na = 1\n";
        let m2 = "package p\n\nb = x { x := data.p.a + 1 }\n";
        let mut ev = evaluator(&[m1, m2], "{}", None);
        assert_eq!(ev.eval_path(&path("p.b")).unwrap(), Some(Value::number(2)));
    }

    #[test]
    fn test_trace_records_rule_entries() {
        let module = "package p\n\nq = true { true }\n";
        let registry = Arc::new(Registry::standard());
        let parsed = vec![parse_module(module).expect("parse")];
        let policy = Compiler::new(&registry).compile(parsed).expect("compile");
        let mut ev = Evaluator::new(
            Arc::new(policy),
            registry,
            Arc::new(Value::empty_object()),
            None,
            QueryOptions {
                trace: true,
                ..QueryOptions::default()
            },
        );
        ev.eval_path(&path("p.q")).unwrap();
        assert!(ev
            .trace()
            .contains(&TraceEvent::EnterRule("data.p.q".to_string())));
    }
}
