//! # Built-in Functions
//!
//! A process-wide registry from name to (signature, implementation,
//! effectfulness flag, determinism flag). The compiler consults
//! signatures for type checking; the evaluator dispatches by name.
//!
//! Built-ins take ground [`Value`] arguments and return a `Value` or an
//! error. They are pure unless flagged effectful, re-entrant, and honor
//! the cancellation token in their context for anything that blocks.

mod collections;
mod crypto;
mod encoding;
mod graph;
mod http;
mod jwt;
mod net;
mod numbers;
mod regex_fns;
mod strings;
mod time;

use crate::eval::cancel::Cancellation;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised by built-in implementations.
#[derive(Error, Debug, Clone)]
pub enum BuiltinError {
    #[error("{0}")]
    Message(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Shorthand for a message error.
pub(crate) fn err(message: impl Into<String>) -> BuiltinError {
    BuiltinError::Message(message.into())
}

/// Argument and result types for signatures. `Any` is the top type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Any,
    Boolean,
    Number,
    String,
    Array,
    Object,
    Set,
    /// Array, object, or set.
    Collection,
}

impl Type {
    /// Whether a ground value inhabits this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Type::Any => true,
            Type::Boolean => matches!(value, Value::Bool(_)),
            Type::Number => matches!(value, Value::Number(_)),
            Type::String => matches!(value, Value::String(_)),
            Type::Array => matches!(value, Value::Array(_)),
            Type::Object => matches!(value, Value::Object(_)),
            Type::Set => matches!(value, Value::Set(_)),
            Type::Collection => {
                matches!(value, Value::Array(_) | Value::Object(_) | Value::Set(_))
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Any => "any",
            Type::Boolean => "boolean",
            Type::Number => "number",
            Type::String => "string",
            Type::Array => "array",
            Type::Object => "object",
            Type::Set => "set",
            Type::Collection => "collection",
        };
        write!(f, "{name}")
    }
}

/// Declared signature of a built-in.
#[derive(Debug, Clone)]
pub struct Signature {
    pub args: Vec<Type>,
    pub result: Type,
}

pub(crate) fn sig(args: &[Type], result: Type) -> Signature {
    Signature {
        args: args.to_vec(),
        result,
    }
}

/// Per-query context passed to built-ins: the cancellation token, the
/// evaluation's pinned timestamp, and the effectful-call cache.
pub struct BuiltinContext<'a> {
    pub cancel: &'a Cancellation,
    /// Nanoseconds since the epoch, fixed at evaluation start.
    pub now_ns: i64,
    /// Cache for effectful built-ins, keyed by (name, arguments).
    pub call_cache: &'a mut HashMap<(String, Vec<Value>), Value>,
}

pub type BuiltinFn = fn(&mut BuiltinContext<'_>, &[Value]) -> Result<Value, BuiltinError>;

/// One registered built-in.
pub struct Builtin {
    pub name: &'static str,
    pub signature: Signature,
    /// Performs I/O or other side effects.
    pub effectful: bool,
    /// May return different results across evaluations.
    pub nondeterministic: bool,
    pub func: BuiltinFn,
}

impl Builtin {
    pub(crate) fn pure(name: &'static str, signature: Signature, func: BuiltinFn) -> Builtin {
        Builtin {
            name,
            signature,
            effectful: false,
            nondeterministic: false,
            func,
        }
    }
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("effectful", &self.effectful)
            .finish()
    }
}

/// The registry. Built once (usually via [`Registry::standard`]) and
/// shared read-only between the compiler and all evaluators.
#[derive(Debug, Default)]
pub struct Registry {
    map: HashMap<&'static str, Builtin>,
}

impl Registry {
    pub fn empty() -> Registry {
        Registry::default()
    }

    /// The standard library: arithmetic, aggregates, collections,
    /// strings, regex, encoding, crypto, time, net, graph, HTTP, JWT.
    pub fn standard() -> Registry {
        let mut registry = Registry::empty();
        for builtin in numbers::builtins() {
            registry.insert(builtin);
        }
        for builtin in collections::builtins() {
            registry.insert(builtin);
        }
        for builtin in strings::builtins() {
            registry.insert(builtin);
        }
        for builtin in regex_fns::builtins() {
            registry.insert(builtin);
        }
        for builtin in encoding::builtins() {
            registry.insert(builtin);
        }
        for builtin in crypto::builtins() {
            registry.insert(builtin);
        }
        for builtin in time::builtins() {
            registry.insert(builtin);
        }
        for builtin in net::builtins() {
            registry.insert(builtin);
        }
        for builtin in graph::builtins() {
            registry.insert(builtin);
        }
        for builtin in http::builtins() {
            registry.insert(builtin);
        }
        for builtin in jwt::builtins() {
            registry.insert(builtin);
        }
        registry
    }

    /// Register a built-in; replaces any previous entry with the name.
    pub fn insert(&mut self, builtin: Builtin) {
        self.map.insert(builtin.name, builtin);
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.map.keys().copied()
    }

    /// Invoke a built-in with ground arguments. Effectful built-ins are
    /// cached per (name, args) for the life of the query.
    pub fn invoke(
        &self,
        name: &str,
        ctx: &mut BuiltinContext<'_>,
        args: &[Value],
    ) -> Result<Value, BuiltinError> {
        let builtin = self
            .get(name)
            .ok_or_else(|| err(format!("unknown built-in '{name}'")))?;

        if builtin.effectful || builtin.nondeterministic {
            let key = (name.to_string(), args.to_vec());
            if let Some(cached) = ctx.call_cache.get(&key) {
                return Ok(cached.clone());
            }
            let result = (builtin.func)(ctx, args)?;
            ctx.call_cache.insert(key, result.clone());
            return Ok(result);
        }
        (builtin.func)(ctx, args)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Run one built-in with a fresh detached context.
    pub fn call(name: &str, args: &[Value]) -> Result<Value, BuiltinError> {
        let registry = Registry::standard();
        let cancel = Cancellation::unbounded();
        let mut cache = HashMap::new();
        let mut ctx = BuiltinContext {
            cancel: &cancel,
            now_ns: 1_700_000_000_000_000_000,
            call_cache: &mut cache,
        };
        registry.invoke(name, &mut ctx, args)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::call;
    use super::*;

    #[test]
    fn test_registry_has_core_builtins() {
        let registry = Registry::standard();
        for name in [
            "plus", "count", "concat", "split", "regex.match", "json.marshal",
            "crypto.sha256", "time.now_ns", "net.cidr_contains", "graph.reachable",
            "http.send", "io.jwt.decode", "walk",
        ] {
            assert!(registry.contains(name), "missing built-in {name}");
        }
    }

    #[test]
    fn test_effectful_flagged() {
        let registry = Registry::standard();
        assert!(registry.get("http.send").unwrap().effectful);
        assert!(!registry.get("plus").unwrap().effectful);
        assert!(registry.get("time.now_ns").unwrap().nondeterministic);
    }

    #[test]
    fn test_unknown_builtin_invoke() {
        assert!(call("definitely.not.real", &[]).is_err());
    }

    #[test]
    fn test_nondeterministic_cached_within_context() {
        let registry = Registry::standard();
        let cancel = Cancellation::unbounded();
        let mut cache = HashMap::new();
        let mut ctx = BuiltinContext {
            cancel: &cancel,
            now_ns: 42,
            call_cache: &mut cache,
        };
        let a = registry.invoke("time.now_ns", &mut ctx, &[]).unwrap();
        let b = registry.invoke("time.now_ns", &mut ctx, &[]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Value::number(42));
    }
}
