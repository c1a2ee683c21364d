//! Binding environment for one query.
//!
//! Variables are keyed by (scope, name): every rule invocation gets a
//! fresh scope so two evaluations of the same rule never collide. All
//! bound values are ground. Backtracking uses a trail: callers take a
//! mark before a choice point and undo to it when the branch fails.

use crate::value::Value;
use std::collections::HashMap;

/// A scoped variable key.
pub type VarKey = (u32, String);

#[derive(Debug, Default)]
pub struct Bindings {
    map: HashMap<VarKey, Value>,
    trail: Vec<VarKey>,
}

impl Bindings {
    pub fn new() -> Self {
        Bindings::default()
    }

    /// Current trail position; pass to [`Bindings::undo_to`] to roll
    /// back everything bound after this point.
    pub fn mark(&self) -> usize {
        self.trail.len()
    }

    pub fn undo_to(&mut self, mark: usize) {
        while self.trail.len() > mark {
            if let Some(key) = self.trail.pop() {
                self.map.remove(&key);
            }
        }
    }

    /// Bind a variable to a ground value. The variable must be unbound.
    pub fn bind(&mut self, scope: u32, name: &str, value: Value) {
        let key = (scope, name.to_string());
        debug_assert!(!self.map.contains_key(&key), "rebinding {name}");
        self.trail.push(key.clone());
        self.map.insert(key, value);
    }

    pub fn get(&self, scope: u32, name: &str) -> Option<&Value> {
        self.map.get(&(scope, name.to_string()))
    }

    pub fn is_bound(&self, scope: u32, name: &str) -> bool {
        self.map.contains_key(&(scope, name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_get() {
        let mut b = Bindings::new();
        b.bind(0, "x", Value::number(1));
        assert_eq!(b.get(0, "x"), Some(&Value::number(1)));
        assert_eq!(b.get(1, "x"), None);
    }

    #[test]
    fn test_trail_undo() {
        let mut b = Bindings::new();
        b.bind(0, "x", Value::number(1));
        let mark = b.mark();
        b.bind(0, "y", Value::number(2));
        b.bind(0, "z", Value::number(3));
        b.undo_to(mark);
        assert!(b.get(0, "y").is_none());
        assert!(b.get(0, "z").is_none());
        assert_eq!(b.get(0, "x"), Some(&Value::number(1)));
    }

    #[test]
    fn test_scopes_isolate() {
        let mut b = Bindings::new();
        b.bind(0, "x", Value::number(1));
        b.bind(1, "x", Value::number(2));
        assert_eq!(b.get(0, "x"), Some(&Value::number(1)));
        assert_eq!(b.get(1, "x"), Some(&Value::number(2)));
    }
}
