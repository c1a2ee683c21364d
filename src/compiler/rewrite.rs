//! Rewriting phase: desugars surface forms into the core the evaluator
//! executes.
//!
//! - `x := v` checks single assignment, then becomes unification.
//! - `every x in xs { B }` becomes `not (x in xs; not (B))` - the
//!   quantifier holds exactly when no element violates the body.
//!
//! Comprehension bodies are rewritten in place; the evaluator runs them
//! as nested queries.

use super::CompileError;
use crate::ast::{Expr, ExprKind, Rule, Term};
use std::collections::BTreeSet;

pub(super) fn rewrite_rule(rule: &mut Rule, errors: &mut Vec<CompileError>, max_errors: usize) {
    let mut assigned = BTreeSet::new();
    rewrite_body(&mut rule.body, &mut assigned, errors, max_errors);
    if let Some(key) = &mut rule.head.key {
        rewrite_term(key, errors, max_errors);
    }
    if let Some(value) = &mut rule.head.value {
        rewrite_term(value, errors, max_errors);
    }
    if let Some(else_rule) = &mut rule.else_rule {
        rewrite_rule(else_rule, errors, max_errors);
    }
}

fn rewrite_body(
    body: &mut Vec<Expr>,
    assigned: &mut BTreeSet<String>,
    errors: &mut Vec<CompileError>,
    max_errors: usize,
) {
    for expr in body.iter_mut() {
        rewrite_expr(expr, assigned, errors, max_errors);
    }
}

fn rewrite_expr(
    expr: &mut Expr,
    assigned: &mut BTreeSet<String>,
    errors: &mut Vec<CompileError>,
    max_errors: usize,
) {
    // Rewrite nested terms first so inner comprehensions are done
    // before the expression itself changes shape.
    match &mut expr.kind {
        ExprKind::Term(t) => rewrite_term(t, errors, max_errors),
        ExprKind::Eq(a, b) | ExprKind::Comparison(_, a, b) => {
            rewrite_term(a, errors, max_errors);
            rewrite_term(b, errors, max_errors);
        }
        ExprKind::Assign(a, b) => {
            rewrite_term(a, errors, max_errors);
            rewrite_term(b, errors, max_errors);
        }
        ExprKind::Call(_, args, _) => {
            for arg in args {
                rewrite_term(arg, errors, max_errors);
            }
        }
        ExprKind::SomeDecl(_) => {}
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                rewrite_term(k, errors, max_errors);
            }
            rewrite_term(value, errors, max_errors);
            rewrite_term(collection, errors, max_errors);
        }
        ExprKind::Every { domain, body, .. } => {
            rewrite_term(domain, errors, max_errors);
            let mut inner_assigned = assigned.clone();
            rewrite_body(body, &mut inner_assigned, errors, max_errors);
        }
        ExprKind::Block(body) => {
            let mut inner_assigned = assigned.clone();
            rewrite_body(body, &mut inner_assigned, errors, max_errors);
        }
    }

    // `:=` - single assignment, then plain unification.
    if let ExprKind::Assign(lhs, rhs) = &expr.kind {
        let mut lhs_vars = BTreeSet::new();
        lhs.collect_vars(&mut lhs_vars);
        for var in &lhs_vars {
            if var.starts_with("$w") {
                continue;
            }
            if !assigned.insert(var.clone()) && errors.len() < max_errors {
                errors.push(CompileError::new(
                    "compile/safety",
                    format!("variable '{var}' assigned more than once"),
                    expr.loc,
                ));
            }
        }
        expr.kind = ExprKind::Eq(lhs.clone(), rhs.clone());
    }

    // `every k, v in dom { B }` holds iff no member of dom fails B:
    // not (k, v in dom; not (B)).
    if let ExprKind::Every {
        key,
        value,
        domain,
        body,
    } = &expr.kind
    {
        let membership = Expr {
            kind: ExprKind::In {
                key: key.as_ref().map(|k| Term::var(k.clone())),
                value: Term::var(value.clone()),
                collection: domain.clone(),
            },
            negated: false,
            with: Vec::new(),
            loc: expr.loc,
        };
        let violation = Expr {
            kind: ExprKind::Block(body.clone()),
            negated: true,
            with: Vec::new(),
            loc: expr.loc,
        };
        expr.kind = ExprKind::Block(vec![membership, violation]);
        expr.negated = !expr.negated;
    }
}

fn rewrite_term(term: &mut Term, errors: &mut Vec<CompileError>, max_errors: usize) {
    match term {
        Term::Value(_) => {}
        Term::Ref(parts) => {
            for part in parts {
                rewrite_term(part, errors, max_errors);
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                rewrite_term(item, errors, max_errors);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                rewrite_term(k, errors, max_errors);
                rewrite_term(v, errors, max_errors);
            }
        }
        Term::Call(_, args, _) => {
            for arg in args {
                rewrite_term(arg, errors, max_errors);
            }
        }
        Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
            rewrite_term(term, errors, max_errors);
            let mut assigned = BTreeSet::new();
            rewrite_body(body, &mut assigned, errors, max_errors);
        }
        Term::ObjectCompr { key, value, body } => {
            rewrite_term(key, errors, max_errors);
            rewrite_term(value, errors, max_errors);
            let mut assigned = BTreeSet::new();
            rewrite_body(body, &mut assigned, errors, max_errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;
    use crate::parser::parse_module;

    fn rewritten(source: &str) -> Rule {
        let module = parse_module(source).expect("parse");
        let mut rule = module.rules[0].clone();
        let mut errors = Vec::new();
        rewrite_rule(&mut rule, &mut errors, 10);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        rule
    }

    #[test]
    fn test_assign_becomes_unification() {
        let rule = rewritten("package p\n\nq = x { x := 1 }\n");
        assert!(matches!(rule.body[0].kind, ExprKind::Eq(_, _)));
    }

    #[test]
    fn test_double_assignment_rejected() {
        let module = parse_module("package p\n\nq { x := 1; x := 2 }\n").expect("parse");
        let mut rule = module.rules[0].clone();
        let mut errors = Vec::new();
        rewrite_rule(&mut rule, &mut errors, 10);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "compile/safety");
    }

    #[test]
    fn test_every_becomes_negated_block() {
        let rule = rewritten("package p\n\nq if every x in input.xs { x > 0 }\n");
        let expr = &rule.body[0];
        assert!(expr.negated);
        match &expr.kind {
            ExprKind::Block(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0].kind, ExprKind::In { .. }));
                assert!(parts[1].negated);
                assert!(matches!(parts[1].kind, ExprKind::Block(_)));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_assignment_inside_comprehension_is_scoped() {
        // The same var may be assigned in two sibling comprehensions.
        let module = parse_module(
            "package p\n\nq = [a, b] { a := [x | x := 1]; b := [x | x := 2] }\n",
        )
        .expect("parse");
        let mut rule = module.rules[0].clone();
        let mut errors = Vec::new();
        rewrite_rule(&mut rule, &mut errors, 10);
        assert!(errors.is_empty(), "{errors:?}");
        let _ = Location::default();
    }
}
