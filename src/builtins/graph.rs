//! Graph and document-traversal built-ins.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::Value;
use std::collections::BTreeSet;

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure(
            "graph.reachable",
            sig(&[Type::Object, Type::Collection], Type::Set),
            reachable,
        ),
        Builtin::pure("walk", sig(&[Type::Any], Type::Array), walk),
    ]
}

/// `graph.reachable(edges, initial)`: `edges` maps node -> neighbors
/// (array or set), `initial` is the starting frontier. Returns the set
/// of reachable nodes, including the initial ones that appear in the
/// graph.
fn reachable(ctx: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let Some(Value::Object(edges)) = args.first() else {
        return Err(err("graph.reachable: first operand must be an object"));
    };
    let initial: Vec<Value> = match args.get(1) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Set(items)) => items.iter().cloned().collect(),
        _ => return Err(err("graph.reachable: second operand must be an array or set")),
    };

    let mut seen: BTreeSet<Value> = BTreeSet::new();
    let mut frontier = initial;
    while let Some(node) = frontier.pop() {
        if ctx.cancel.is_cancelled() {
            return Err(BuiltinError::Cancelled);
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        match edges.get(&node) {
            Some(Value::Array(neighbors)) => frontier.extend(neighbors.iter().cloned()),
            Some(Value::Set(neighbors)) => frontier.extend(neighbors.iter().cloned()),
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(err(format!(
                    "graph.reachable: neighbors must be an array or set, got {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok(Value::Set(seen))
}

/// `walk(x)`: every `[path, value]` pair in the document, depth-first.
/// The root appears with the empty path.
fn walk(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let root = args.first().ok_or_else(|| err("walk: missing operand"))?;
    let mut out = Vec::new();
    walk_into(root, &mut Vec::new(), &mut out);
    Ok(Value::Array(out))
}

fn walk_into(value: &Value, path: &mut Vec<Value>, out: &mut Vec<Value>) {
    out.push(Value::Array(vec![
        Value::Array(path.clone()),
        value.clone(),
    ]));
    match value {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(Value::number(i as i64));
                walk_into(item, path, out);
                path.pop();
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                path.push(k.clone());
                walk_into(v, path, out);
                path.pop();
            }
        }
        Value::Set(items) => {
            for item in items {
                path.push(item.clone());
                walk_into(item, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_reachable() {
        let edges = Value::from_json_str(r#"{"a":["b"],"b":["c"],"c":[],"d":["a"]}"#).unwrap();
        let out = call(
            "graph.reachable",
            &[edges, Value::Array(vec![Value::string("a")])],
        )
        .unwrap();
        assert_eq!(
            out,
            Value::set_from(vec![
                Value::string("a"),
                Value::string("b"),
                Value::string("c")
            ])
        );
    }

    #[test]
    fn test_reachable_cyclic_graph_terminates() {
        let edges = Value::from_json_str(r#"{"a":["b"],"b":["a"]}"#).unwrap();
        let out = call(
            "graph.reachable",
            &[edges, Value::Array(vec![Value::string("a")])],
        )
        .unwrap();
        assert_eq!(
            out,
            Value::set_from(vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn test_walk_paths() {
        let doc = Value::from_json_str(r#"{"a":{"b":1}}"#).unwrap();
        let out = call("walk", &[doc]).unwrap();
        let Value::Array(pairs) = out else {
            panic!("expected array");
        };
        // Root, a, and a.b.
        assert_eq!(pairs.len(), 3);
        let deepest = &pairs[2];
        assert_eq!(
            *deepest,
            Value::Array(vec![
                Value::Array(vec![Value::string("a"), Value::string("b")]),
                Value::number(1),
            ])
        );
    }
}
