//! Rule dependency graph and recursion check.
//!
//! Builds directed edges from each rule to every rule its body (or
//! head) references, then rejects cycles. A ref into `data` depends on
//! every rule path that the ref's static prefix could reach, so dynamic
//! segments are handled conservatively. A rule of a partial kind may
//! reference its own path (its own iteration); any other cycle is an
//! error.

use super::{CompileError, RuleTree};
use crate::ast::{Expr, ExprKind, Rule, RuleKind, Term};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

pub(super) fn check_recursion(tree: &RuleTree) -> Vec<CompileError> {
    let paths = tree.paths();
    let mut edges: BTreeMap<Vec<String>, BTreeSet<Vec<String>>> = BTreeMap::new();

    for path in &paths {
        let Some(node) = tree.node(path) else {
            continue;
        };
        let mut deps = BTreeSet::new();
        for rule in &node.rules {
            collect_rule_deps(rule, &paths, &mut deps);
        }
        // A partial rule may mention its own document (self iteration).
        let all_partial = node.rules.iter().all(|r| {
            matches!(r.kind(), RuleKind::PartialSet | RuleKind::PartialObject)
        });
        if all_partial {
            deps.remove(path);
        }
        edges.insert(path.clone(), deps);
    }

    // DFS cycle detection.
    let mut errors = Vec::new();
    let mut visited: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut reported: BTreeSet<Vec<String>> = BTreeSet::new();
    for path in &paths {
        let mut stack = Vec::new();
        dfs(
            path,
            &edges,
            &mut visited,
            &mut stack,
            &mut reported,
            &mut errors,
        );
    }
    errors
}

fn dfs(
    path: &[String],
    edges: &BTreeMap<Vec<String>, BTreeSet<Vec<String>>>,
    visited: &mut BTreeSet<Vec<String>>,
    stack: &mut Vec<Vec<String>>,
    reported: &mut BTreeSet<Vec<String>>,
    errors: &mut Vec<CompileError>,
) {
    if let Some(pos) = stack.iter().position(|p| p == path) {
        let cycle: Vec<String> = stack[pos..]
            .iter()
            .chain(std::iter::once(&path.to_vec()))
            .map(|p| format!("data.{}", p.join(".")))
            .collect();
        let key = path.to_vec();
        if reported.insert(key) {
            errors.push(CompileError::new(
                "compile/recursion",
                format!("rule dependency cycle: {}", cycle.join(" -> ")),
                Default::default(),
            ));
        }
        return;
    }
    if visited.contains(path) {
        return;
    }
    stack.push(path.to_vec());
    if let Some(deps) = edges.get(path) {
        for dep in deps {
            dfs(dep, edges, visited, stack, reported, errors);
        }
    }
    stack.pop();
    visited.insert(path.to_vec());
}

fn collect_rule_deps(rule: &Rule, paths: &[Vec<String>], deps: &mut BTreeSet<Vec<String>>) {
    if let Some(key) = &rule.head.key {
        collect_term_deps(key, paths, deps);
    }
    if let Some(value) = &rule.head.value {
        collect_term_deps(value, paths, deps);
    }
    for expr in &rule.body {
        collect_expr_deps(expr, paths, deps);
    }
    if let Some(else_rule) = &rule.else_rule {
        collect_rule_deps(else_rule, paths, deps);
    }
}

fn collect_expr_deps(expr: &Expr, paths: &[Vec<String>], deps: &mut BTreeSet<Vec<String>>) {
    match &expr.kind {
        ExprKind::Term(t) => collect_term_deps(t, paths, deps),
        ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
            collect_term_deps(a, paths, deps);
            collect_term_deps(b, paths, deps);
        }
        ExprKind::Call(name, args, _) => {
            collect_call_deps(name, paths, deps);
            for arg in args {
                collect_term_deps(arg, paths, deps);
            }
        }
        ExprKind::SomeDecl(_) => {}
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                collect_term_deps(k, paths, deps);
            }
            collect_term_deps(value, paths, deps);
            collect_term_deps(collection, paths, deps);
        }
        ExprKind::Every { domain, body, .. } => {
            collect_term_deps(domain, paths, deps);
            for e in body {
                collect_expr_deps(e, paths, deps);
            }
        }
        ExprKind::Block(body) => {
            for e in body {
                collect_expr_deps(e, paths, deps);
            }
        }
    }
    for w in &expr.with {
        collect_term_deps(&w.value, paths, deps);
    }
}

fn collect_term_deps(term: &Term, paths: &[Vec<String>], deps: &mut BTreeSet<Vec<String>>) {
    match term {
        Term::Value(_) => {}
        Term::Ref(parts) => {
            if parts.first().and_then(Term::as_var) == Some("data") {
                let prefix: Vec<String> = parts
                    .iter()
                    .skip(1)
                    .map_while(|p| match p {
                        Term::Value(Value::String(s)) => Some(s.clone()),
                        _ => None,
                    })
                    .collect();
                for path in paths {
                    let hits = path.starts_with(&prefix) || prefix.starts_with(path.as_slice());
                    if hits {
                        deps.insert(path.clone());
                    }
                }
            }
            for part in parts.iter().skip(1) {
                collect_term_deps(part, paths, deps);
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                collect_term_deps(item, paths, deps);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                collect_term_deps(k, paths, deps);
                collect_term_deps(v, paths, deps);
            }
        }
        Term::Call(name, args, _) => {
            collect_call_deps(name, paths, deps);
            for arg in args {
                collect_term_deps(arg, paths, deps);
            }
        }
        Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
            collect_term_deps(term, paths, deps);
            for e in body {
                collect_expr_deps(e, paths, deps);
            }
        }
        Term::ObjectCompr { key, value, body } => {
            collect_term_deps(key, paths, deps);
            collect_term_deps(value, paths, deps);
            for e in body {
                collect_expr_deps(e, paths, deps);
            }
        }
    }
}

fn collect_call_deps(name: &str, paths: &[Vec<String>], deps: &mut BTreeSet<Vec<String>>) {
    if let Some(rest) = name.strip_prefix("data.") {
        let target: Vec<String> = rest.split('.').map(String::from).collect();
        for path in paths {
            if *path == target {
                deps.insert(path.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Module;
    use crate::parser::parse_module;

    fn tree_of(sources: &[&str]) -> RuleTree {
        let mut tree = RuleTree::default();
        for source in sources {
            let module: Module = parse_module(source).expect("parse");
            let package = module.package_path();
            for rule in &module.rules {
                let mut path = package.clone();
                path.push(rule.head.name.clone());
                tree.node_mut(&path).rules.push(rule.clone());
            }
        }
        tree
    }

    #[test]
    fn test_no_recursion() {
        let tree = tree_of(&["package p\n\na = 1\nb = x { x := data.p.a }\n"]);
        assert!(check_recursion(&tree).is_empty());
    }

    #[test]
    fn test_direct_cycle() {
        let tree = tree_of(&["package p\n\na { data.p.b }\nb { data.p.a }\n"]);
        let errors = check_recursion(&tree);
        assert!(!errors.is_empty());
        assert!(errors[0].message.contains("cycle"));
    }

    #[test]
    fn test_self_reference_complete_rule_rejected() {
        let tree = tree_of(&["package p\n\na { data.p.a }\n"]);
        assert!(!check_recursion(&tree).is_empty());
    }

    #[test]
    fn test_self_reference_partial_rule_allowed() {
        let tree = tree_of(&["package p\n\ns[x] { x := data.p.s[_] }\n"]);
        assert!(check_recursion(&tree).is_empty());
    }

    #[test]
    fn test_cross_package_cycle() {
        let tree = tree_of(&[
            "package a\n\nx { data.b.y }\n",
            "package b\n\ny { data.a.x }\n",
        ]);
        assert!(!check_recursion(&tree).is_empty());
    }

    #[test]
    fn test_function_call_cycle() {
        let tree = tree_of(&["package p\n\nf(x) = y { y := data.p.g(x) }\ng(x) = y { y := data.p.f(x) }\n"]);
        assert!(!check_recursion(&tree).is_empty());
    }
}
