//! Type checking: validates built-in calls against their declared
//! signatures. Arity must match the signature exactly or carry one
//! extra output-capture argument; literal arguments must be compatible
//! with the declared parameter types. Values flowing from `input` or
//! `data` have the top type and pass every check.

use super::CompileError;
use crate::ast::{Expr, ExprKind, Rule, Term};
use crate::builtins::Registry;

pub(super) fn check_rule(rule: &Rule, registry: &Registry) -> Vec<CompileError> {
    let mut errors = Vec::new();
    if let Some(key) = &rule.head.key {
        check_term(key, registry, &mut errors);
    }
    if let Some(value) = &rule.head.value {
        check_term(value, registry, &mut errors);
    }
    for expr in &rule.body {
        check_expr(expr, registry, &mut errors);
    }
    if let Some(else_rule) = &rule.else_rule {
        errors.extend(check_rule(else_rule, registry));
    }
    errors
}

fn check_expr(expr: &Expr, registry: &Registry, errors: &mut Vec<CompileError>) {
    match &expr.kind {
        ExprKind::Term(t) => check_term(t, registry, errors),
        ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
            check_term(a, registry, errors);
            check_term(b, registry, errors);
        }
        ExprKind::Call(name, args, loc) => {
            check_call(name, args, *loc, true, registry, errors);
            for arg in args {
                check_term(arg, registry, errors);
            }
        }
        ExprKind::SomeDecl(_) => {}
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                check_term(k, registry, errors);
            }
            check_term(value, registry, errors);
            check_term(collection, registry, errors);
        }
        ExprKind::Every { domain, body, .. } => {
            check_term(domain, registry, errors);
            for e in body {
                check_expr(e, registry, errors);
            }
        }
        ExprKind::Block(body) => {
            for e in body {
                check_expr(e, registry, errors);
            }
        }
    }
    for w in &expr.with {
        check_term(&w.value, registry, errors);
    }
}

fn check_term(term: &Term, registry: &Registry, errors: &mut Vec<CompileError>) {
    match term {
        Term::Value(_) => {}
        Term::Ref(parts) => {
            for part in parts {
                check_term(part, registry, errors);
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                check_term(item, registry, errors);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                check_term(k, registry, errors);
                check_term(v, registry, errors);
            }
        }
        Term::Call(name, args, loc) => {
            check_call(name, args, *loc, false, registry, errors);
            for arg in args {
                check_term(arg, registry, errors);
            }
        }
        Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
            check_term(term, registry, errors);
            for e in body {
                check_expr(e, registry, errors);
            }
        }
        Term::ObjectCompr { key, value, body } => {
            check_term(key, registry, errors);
            check_term(value, registry, errors);
            for e in body {
                check_expr(e, registry, errors);
            }
        }
    }
}

fn check_call(
    name: &str,
    args: &[Term],
    loc: crate::ast::Location,
    statement_position: bool,
    registry: &Registry,
    errors: &mut Vec<CompileError>,
) {
    // User functions (data.*) are checked at evaluation time; their
    // definitions may live in another module of the composite policy.
    let Some(builtin) = registry.get(name) else {
        return;
    };
    let declared = builtin.signature.args.len();

    // Statement position admits one trailing output-capture argument.
    let arity_ok = args.len() == declared || (statement_position && args.len() == declared + 1);
    if !arity_ok {
        errors.push(CompileError::new(
            "compile/type",
            format!(
                "built-in '{name}' expects {declared} argument(s), got {}",
                args.len()
            ),
            loc,
        ));
        return;
    }

    for (i, arg) in args.iter().take(declared).enumerate() {
        if let Some(value) = arg.as_ground() {
            let expected = &builtin.signature.args[i];
            if !expected.matches(value) {
                errors.push(CompileError::new(
                    "compile/type",
                    format!(
                        "built-in '{name}' argument {} must be {}, got {}",
                        i + 1,
                        expected,
                        value.type_name()
                    ),
                    loc,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::Registry;
    use crate::parser::parse_module;

    fn check(source: &str) -> Vec<CompileError> {
        let registry = Registry::standard();
        let module = parse_module(source).expect("parse");
        check_rule(&module.rules[0], &registry)
    }

    #[test]
    fn test_valid_call() {
        assert!(check("package p\n\nq = c { c := count(input.xs) }\n").is_empty());
    }

    #[test]
    fn test_arity_mismatch() {
        let errors = check("package p\n\nq = c { c := count(input.xs, 3) }\n");
        assert!(!errors.is_empty());
        assert!(errors[0].message.contains("expects"));
    }

    #[test]
    fn test_literal_type_mismatch() {
        let errors = check("package p\n\nq = c { c := abs(\"nope\") }\n");
        assert!(!errors.is_empty());
        assert!(errors[0].message.contains("must be"));
    }

    #[test]
    fn test_unknown_values_pass() {
        // input.x has the top type; no error even though abs wants a number.
        assert!(check("package p\n\nq = c { c := abs(input.x) }\n").is_empty());
    }

    #[test]
    fn test_output_capture_arity() {
        assert!(check("package p\n\nq { split(input.s, \",\", out); count(out) > 0 }\n")
            .is_empty());
    }
}
