//! Safety analysis: every variable in a rule body must be bound by a
//! positive expression before any use where it would otherwise be free
//! (negation, comparison, built-in input, rule head).
//!
//! The analysis runs a fixpoint over each body: an expression's outputs
//! become safe once its inputs are, so ordering within the body does
//! not matter. Ref operands and membership bindings are always outputs
//! (iteration grounds them); unification propagates safety between its
//! two sides.

use super::CompileError;
use crate::ast::{Expr, ExprKind, Rule, Term};
use std::collections::BTreeSet;

type VarSet = BTreeSet<String>;

pub(super) fn check_rule(rule: &Rule) -> Vec<CompileError> {
    let mut errors = Vec::new();

    // Function arguments are bound by the caller.
    let mut initial = VarSet::new();
    if let Some(args) = &rule.head.args {
        for arg in args {
            arg.collect_vars(&mut initial);
        }
    }

    let safe = check_body(&rule.body, &initial, &mut errors);

    // Head key and value vars must come out of the body bound.
    let mut head_vars = VarSet::new();
    if let Some(key) = &rule.head.key {
        collect_shallow_term_vars(key, &mut head_vars);
        check_term_comprehensions(key, &safe, &mut errors);
    }
    if let Some(value) = &rule.head.value {
        collect_shallow_term_vars(value, &mut head_vars);
        check_term_comprehensions(value, &safe, &mut errors);
    }
    for var in head_vars {
        if !safe.contains(&var) && !initial.contains(&var) && !is_wildcard(&var) {
            errors.push(CompileError::new(
                "compile/safety",
                format!("variable '{var}' is unsafe (not bound in rule body)"),
                rule.loc,
            ));
        }
    }

    if let Some(else_rule) = &rule.else_rule {
        errors.extend(check_rule(else_rule));
    }
    errors
}

/// Check one body with the given initially safe variables. Returns the
/// final safe set (initial plus everything bound by the body).
fn check_body(body: &[Expr], initial: &VarSet, errors: &mut Vec<CompileError>) -> VarSet {
    let mut safe = initial.clone();

    // Fixpoint: outputs become safe once inputs are.
    loop {
        let before = safe.len();
        for expr in body {
            if !expr.negated {
                expr_outputs(expr, &mut safe);
            }
        }
        if safe.len() == before {
            break;
        }
    }

    // Requirements and nested scopes.
    for expr in body {
        if expr.negated {
            match &expr.kind {
                // Vars bound inside a negated block are local to it.
                ExprKind::Block(inner) => {
                    check_body(inner, &safe, errors);
                }
                _ => {
                    let mut used = VarSet::new();
                    collect_shallow_expr_vars(expr, &mut used);
                    report_unsafe(&used, &safe, expr, errors);
                }
            }
        } else {
            match &expr.kind {
                ExprKind::Comparison(_, a, b) => {
                    let mut used = VarSet::new();
                    collect_shallow_term_vars(a, &mut used);
                    collect_shallow_term_vars(b, &mut used);
                    report_unsafe(&used, &safe, expr, errors);
                }
                ExprKind::Block(inner) => {
                    check_body(inner, &safe, errors);
                }
                _ => {}
            }
        }

        // `with` values are inputs.
        for w in &expr.with {
            let mut used = VarSet::new();
            collect_shallow_term_vars(&w.value, &mut used);
            report_unsafe(&used, &safe, expr, errors);
        }

        expr_comprehensions(expr, &safe, errors);
    }

    // Anything still free in this body is unsafe.
    let mut all = VarSet::new();
    for expr in body {
        if !matches!(expr.kind, ExprKind::Block(_)) {
            collect_shallow_expr_vars(expr, &mut all);
        }
    }
    for var in all {
        if !safe.contains(&var) && !is_wildcard(&var) {
            let loc = body.first().map_or_else(Default::default, |e| e.loc);
            let already = errors
                .iter()
                .any(|e| e.code == "compile/safety" && e.message.contains(&format!("'{var}'")));
            if !already {
                errors.push(CompileError::new(
                    "compile/safety",
                    format!("variable '{var}' is unsafe"),
                    loc,
                ));
            }
        }
    }

    safe
}

fn report_unsafe(used: &VarSet, safe: &VarSet, expr: &Expr, errors: &mut Vec<CompileError>) {
    for var in used {
        if !safe.contains(var) && !is_wildcard(var) {
            errors.push(CompileError::new(
                "compile/safety",
                format!("variable '{var}' is unsafe"),
                expr.loc,
            ));
        }
    }
}

fn is_wildcard(name: &str) -> bool {
    name.starts_with("$w")
}

// ----------------------------------------------------------------------
// Outputs
// ----------------------------------------------------------------------

fn expr_outputs(expr: &Expr, safe: &mut VarSet) {
    match &expr.kind {
        ExprKind::Term(t) => {
            collect_ref_operand_vars(t, safe);
        }
        ExprKind::Eq(a, b) => {
            collect_ref_operand_vars(a, safe);
            collect_ref_operand_vars(b, safe);
            let mut va = VarSet::new();
            collect_shallow_term_vars(a, &mut va);
            let mut vb = VarSet::new();
            collect_shallow_term_vars(b, &mut vb);
            if vb.iter().all(|v| safe.contains(v)) {
                safe.extend(va.clone());
            }
            if va.iter().all(|v| safe.contains(v)) {
                safe.extend(vb);
            }
        }
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            collect_ref_operand_vars(collection, safe);
            let mut cv = VarSet::new();
            collect_shallow_term_vars(collection, &mut cv);
            if cv.iter().all(|v| safe.contains(v)) {
                if let Some(k) = key {
                    k.collect_vars(safe);
                }
                value.collect_vars(safe);
            }
        }
        ExprKind::Call(_, args, _) => {
            for arg in args {
                collect_ref_operand_vars(arg, safe);
            }
            // Statement-level call with an output capture in the last
            // argument: the capture binds once the inputs are safe.
            if let Some((last, inputs)) = args.split_last() {
                let mut input_vars = VarSet::new();
                for arg in inputs {
                    collect_shallow_term_vars(arg, &mut input_vars);
                }
                if input_vars.iter().all(|v| safe.contains(v)) {
                    last.collect_vars(safe);
                }
            }
        }
        ExprKind::Comparison(_, a, b) => {
            // Refs inside comparisons still iterate, grounding their
            // operand vars; the comparison itself binds nothing.
            collect_ref_operand_vars(a, safe);
            collect_ref_operand_vars(b, safe);
        }
        ExprKind::Assign(..)
        | ExprKind::SomeDecl(_)
        | ExprKind::Every { .. }
        | ExprKind::Block(_) => {}
    }
}

// ----------------------------------------------------------------------
// Var collection
// ----------------------------------------------------------------------

/// Vars of an expression, not descending into blocks or comprehensions
/// (those scopes are checked recursively).
fn collect_shallow_expr_vars(expr: &Expr, out: &mut VarSet) {
    match &expr.kind {
        ExprKind::Term(t) => collect_shallow_term_vars(t, out),
        ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
            collect_shallow_term_vars(a, out);
            collect_shallow_term_vars(b, out);
        }
        ExprKind::Call(_, args, _) => {
            for arg in args {
                collect_shallow_term_vars(arg, out);
            }
        }
        ExprKind::SomeDecl(names) => out.extend(names.iter().cloned()),
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                collect_shallow_term_vars(k, out);
            }
            collect_shallow_term_vars(value, out);
            collect_shallow_term_vars(collection, out);
        }
        ExprKind::Every { .. } | ExprKind::Block(_) => {}
    }
}

/// Vars of a term, treating comprehensions as opaque literals. Ref
/// operand vars are included (they are uses as well as outputs).
fn collect_shallow_term_vars(term: &Term, out: &mut VarSet) {
    match term {
        Term::Value(v) => {
            let mut tmp = VarSet::new();
            Term::Value(v.clone()).collect_vars(&mut tmp);
            // The document roots are globals, not body variables.
            out.extend(tmp.into_iter().filter(|n| n != "data" && n != "input"));
        }
        Term::Ref(parts) => {
            for (i, part) in parts.iter().enumerate() {
                if i == 0 {
                    // A local var used as a ref head (`parts[0]`) is a
                    // use; the `data`/`input` roots are not.
                    if let Some(name) = part.as_var() {
                        if name != "data" && name != "input" {
                            out.insert(name.to_string());
                        }
                    }
                } else {
                    collect_shallow_term_vars(part, out);
                }
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                collect_shallow_term_vars(item, out);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                collect_shallow_term_vars(k, out);
                collect_shallow_term_vars(v, out);
            }
        }
        Term::Call(_, args, _) => {
            for arg in args {
                collect_shallow_term_vars(arg, out);
            }
        }
        Term::ArrayCompr { .. } | Term::SetCompr { .. } | Term::ObjectCompr { .. } => {}
    }
}

/// Ref operand vars are bound by iteration over the enclosing document.
fn collect_ref_operand_vars(term: &Term, out: &mut VarSet) {
    match term {
        Term::Value(_) => {}
        Term::Ref(parts) => {
            for (i, part) in parts.iter().enumerate() {
                if i == 0 {
                    continue;
                }
                if let Some(name) = part.as_var() {
                    out.insert(name.to_string());
                } else {
                    collect_ref_operand_vars(part, out);
                }
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                collect_ref_operand_vars(item, out);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                collect_ref_operand_vars(k, out);
                collect_ref_operand_vars(v, out);
            }
        }
        Term::Call(_, args, _) => {
            for arg in args {
                collect_ref_operand_vars(arg, out);
            }
        }
        Term::ArrayCompr { .. } | Term::SetCompr { .. } | Term::ObjectCompr { .. } => {}
    }
}

// ----------------------------------------------------------------------
// Comprehension scopes
// ----------------------------------------------------------------------

fn expr_comprehensions(expr: &Expr, safe: &VarSet, errors: &mut Vec<CompileError>) {
    let mut visit = |t: &Term| check_term_comprehensions(t, safe, errors);
    match &expr.kind {
        ExprKind::Term(t) => visit(t),
        ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
            visit(a);
            visit(b);
        }
        ExprKind::Call(_, args, _) => {
            for arg in args {
                visit(arg);
            }
        }
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                visit(k);
            }
            visit(value);
            visit(collection);
        }
        ExprKind::SomeDecl(_) | ExprKind::Every { .. } | ExprKind::Block(_) => {}
    }
}

/// Comprehension bodies are nested scopes: check each with the outer
/// safe set as the starting point.
fn check_term_comprehensions(term: &Term, safe: &VarSet, errors: &mut Vec<CompileError>) {
    match term {
        Term::Value(_) => {}
        Term::Ref(parts) => {
            for part in parts {
                check_term_comprehensions(part, safe, errors);
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                check_term_comprehensions(item, safe, errors);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                check_term_comprehensions(k, safe, errors);
                check_term_comprehensions(v, safe, errors);
            }
        }
        Term::Call(_, args, _) => {
            for arg in args {
                check_term_comprehensions(arg, safe, errors);
            }
        }
        Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
            let inner_safe = check_body(body, safe, errors);
            let mut head = VarSet::new();
            collect_shallow_term_vars(term, &mut head);
            for var in head {
                if !inner_safe.contains(&var) && !is_wildcard(&var) {
                    errors.push(CompileError::new(
                        "compile/safety",
                        format!("variable '{var}' is unsafe in comprehension head"),
                        Default::default(),
                    ));
                }
            }
        }
        Term::ObjectCompr { key, value, body } => {
            let inner_safe = check_body(body, safe, errors);
            let mut head = VarSet::new();
            collect_shallow_term_vars(key, &mut head);
            collect_shallow_term_vars(value, &mut head);
            for var in head {
                if !inner_safe.contains(&var) && !is_wildcard(&var) {
                    errors.push(CompileError::new(
                        "compile/safety",
                        format!("variable '{var}' is unsafe in comprehension head"),
                        Default::default(),
                    ));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Body reordering
// ----------------------------------------------------------------------

/// Reorder body expressions so that every expression runs after the
/// expressions that bind its inputs. Safety is order-independent; the
/// evaluator executes in sequence, so the compiler schedules each body
/// greedily: repeatedly take the first (source-order) expression whose
/// inputs are already safe. Safe bodies always schedule fully; anything
/// left over keeps its source order and fails at evaluation.
pub(super) fn reorder_rule(rule: &mut Rule) {
    let mut initial = VarSet::new();
    if let Some(args) = &rule.head.args {
        for arg in args {
            arg.collect_vars(&mut initial);
        }
    }
    reorder_body(&mut rule.body, &initial);
    if let Some(else_rule) = &mut rule.else_rule {
        reorder_rule(else_rule);
    }
}

fn reorder_body(body: &mut Vec<Expr>, initial: &VarSet) {
    // Recurse into nested scopes first.
    let mut safe_for_nested = initial.clone();
    loop {
        let before = safe_for_nested.len();
        for expr in body.iter() {
            if !expr.negated {
                expr_outputs(expr, &mut safe_for_nested);
            }
        }
        if safe_for_nested.len() == before {
            break;
        }
    }
    for expr in body.iter_mut() {
        reorder_nested(expr, &safe_for_nested);
    }

    let mut safe = initial.clone();
    let mut scheduled: Vec<Expr> = Vec::with_capacity(body.len());
    let mut remaining: Vec<Expr> = std::mem::take(body);

    loop {
        let mut picked = None;
        for (i, expr) in remaining.iter().enumerate() {
            if schedulable(expr, &safe) {
                picked = Some(i);
                break;
            }
        }
        match picked {
            Some(i) => {
                let expr = remaining.remove(i);
                if !expr.negated {
                    expr_outputs(&expr, &mut safe);
                }
                scheduled.push(expr);
            }
            None => break,
        }
    }
    // Unschedulable remainder (unsafe bodies) keeps source order.
    scheduled.extend(remaining);
    *body = scheduled;
}

fn reorder_nested(expr: &mut Expr, safe: &VarSet) {
    match &mut expr.kind {
        ExprKind::Block(inner) => reorder_body(inner, safe),
        ExprKind::Term(t) => reorder_term(t, safe),
        ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
            reorder_term(a, safe);
            reorder_term(b, safe);
        }
        ExprKind::Call(_, args, _) => {
            for arg in args {
                reorder_term(arg, safe);
            }
        }
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                reorder_term(k, safe);
            }
            reorder_term(value, safe);
            reorder_term(collection, safe);
        }
        ExprKind::SomeDecl(_) | ExprKind::Every { .. } => {}
    }
}

fn reorder_term(term: &mut Term, safe: &VarSet) {
    match term {
        Term::Value(_) => {}
        Term::Ref(parts) => {
            for part in parts {
                reorder_term(part, safe);
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                reorder_term(item, safe);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                reorder_term(k, safe);
                reorder_term(v, safe);
            }
        }
        Term::Call(_, args, _) => {
            for arg in args {
                reorder_term(arg, safe);
            }
        }
        Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
            reorder_term(term, safe);
            reorder_body(body, safe);
        }
        Term::ObjectCompr { key, value, body } => {
            reorder_term(key, safe);
            reorder_term(value, safe);
            reorder_body(body, safe);
        }
    }
}

/// Whether an expression's inputs are all safe so it can run next.
fn schedulable(expr: &Expr, safe: &VarSet) -> bool {
    // Iteration grounds ref operands, so they never block scheduling.
    let mut provided = safe.clone();
    if !expr.negated {
        expr_outputs(expr, &mut provided);
        // Run outputs twice so Eq propagation sees its own operands.
        expr_outputs(expr, &mut provided);
    }

    match &expr.kind {
        ExprKind::SomeDecl(_) => true,
        ExprKind::Block(inner) => {
            // A block needs its free variables (used but not bound
            // inside) to be safe already.
            let mut inner_safe = safe.clone();
            loop {
                let before = inner_safe.len();
                for e in inner {
                    if !e.negated {
                        expr_outputs(e, &mut inner_safe);
                    }
                }
                if inner_safe.len() == before {
                    break;
                }
            }
            let mut used = VarSet::new();
            for e in inner {
                if !matches!(e.kind, ExprKind::Block(_)) {
                    collect_shallow_expr_vars(e, &mut used);
                }
            }
            used.iter()
                .all(|v| inner_safe.contains(v) || is_wildcard(v))
        }
        _ => {
            let mut used = VarSet::new();
            collect_shallow_expr_vars(expr, &mut used);
            for w in &expr.with {
                collect_shallow_term_vars(&w.value, &mut used);
            }
            used.iter().all(|v| provided.contains(v) || is_wildcard(v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn check(source: &str) -> Vec<CompileError> {
        let module = parse_module(source).expect("parse");
        let mut rule = module.rules[0].clone();
        let mut errors = Vec::new();
        super::super::rewrite::rewrite_rule(&mut rule, &mut errors, 100);
        assert!(errors.is_empty());
        check_rule(&rule)
    }

    #[test]
    fn test_safe_rule() {
        assert!(check("package p\n\nq = x { x := input.a }\n").is_empty());
    }

    #[test]
    fn test_head_var_unbound() {
        let errors = check("package p\n\nq = x { input.a }\n");
        assert!(!errors.is_empty());
        assert!(errors[0].message.contains("'x'"));
    }

    #[test]
    fn test_iteration_binds_ref_operands() {
        assert!(check("package p\n\nq[s] { s := data.servers[_] }\n").is_empty());
    }

    #[test]
    fn test_negation_requires_bound_vars() {
        let errors = check("package p\n\nq { not input.users[x] }\n");
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_negation_ok_when_bound() {
        assert!(check("package p\n\nq { x := 1; not input.users[x] }\n").is_empty());
    }

    #[test]
    fn test_comparison_requires_bound_vars() {
        let errors = check("package p\n\nq { x > 1 }\n");
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_order_independence() {
        // x used before bound in source order; fixpoint accepts it.
        assert!(check("package p\n\nq { y := x + 1; x := 2; y > 0 }\n").is_empty());
    }

    #[test]
    fn test_membership_binds_vars() {
        assert!(check("package p\n\nq { some x in input.xs; x > 1 }\n").is_empty());
    }

    #[test]
    fn test_every_body_scoped() {
        assert!(check("package p\n\nq if every x in input.xs { x > 0 }\n").is_empty());
    }

    #[test]
    fn test_comprehension_free_var_unsafe() {
        let errors = check("package p\n\nq = [y | y := z + 1]\n");
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_builtin_output_capture() {
        assert!(check("package p\n\nq { split(input.s, \".\", parts); parts[0] == \"a\" }\n")
            .is_empty());
    }
}
