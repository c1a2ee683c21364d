//! # Compiler
//!
//! Turns parsed modules into an executable policy. Phases run in a fixed
//! order; any error makes the whole compilation fail so a policy is
//! either fully compiled or not active at all:
//!
//! 1. Package/import resolution (aliases expand to full refs)
//! 2. Head normalization (`p { body }` becomes `p = true { body }`)
//! 3. Rewriting (`:=` expansion, `every` to double negation)
//! 4. Safety analysis (every variable bound by a positive expression),
//!    then body scheduling so inputs evaluate before their uses
//! 5. Type checking (built-in signatures, literal operand types)
//! 6. Recursion check (no cycles in the rule dependency graph)
//! 7. Conflict pre-check (duplicate defaults, kind mismatches,
//!    base/virtual path overlap)
//! 8. Rule indexing (discrimination tree on literal input patterns)
//!
//! Error collection stops at a configurable cap (default 10).

mod graph;
mod index;
mod rewrite;
mod safety;
mod types;

pub use index::RuleIndex;

use crate::ast::{Expr, ExprKind, Location, Module, Rule, RuleKind, Term};
use crate::builtins::Registry;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Default cap on collected compile errors.
pub const DEFAULT_MAX_ERRORS: usize = 10;

/// A compile-phase error: category code, message, and source location.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// One of `compile/safety`, `compile/type`, `compile/recursion`,
    /// `compile/conflict`.
    pub code: &'static str,
    pub message: String,
    pub loc: Location,
}

impl CompileError {
    fn new(code: &'static str, message: impl Into<String>, loc: Location) -> Self {
        CompileError {
            code,
            message: message.into(),
            loc,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.code, self.message, self.loc)
    }
}

impl std::error::Error for CompileError {}

/// The virtual-document tree: rules grouped by their path under `data`.
#[derive(Debug, Clone, Default)]
pub struct RuleTree {
    pub children: BTreeMap<String, RuleTree>,
    /// Rules defined exactly at this path, in source order.
    pub rules: Vec<Rule>,
    /// Candidate-selection index over `rules`.
    pub index: Option<RuleIndex>,
}

impl RuleTree {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.rules.is_empty()
    }

    pub fn node(&self, path: &[String]) -> Option<&RuleTree> {
        let mut node = self;
        for segment in path {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &[String]) -> &mut RuleTree {
        let mut node = self;
        for segment in path {
            node = node.children.entry(segment.clone()).or_default();
        }
        node
    }

    /// All rule paths defined in the tree (depth-first).
    pub fn paths(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        self.collect_paths(&mut Vec::new(), &mut out);
        out
    }

    fn collect_paths(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        if !self.rules.is_empty() {
            out.push(prefix.clone());
        }
        for (name, child) in &self.children {
            prefix.push(name.clone());
            child.collect_paths(prefix, out);
            prefix.pop();
        }
    }
}

/// A fully compiled policy: rewritten modules plus the rule tree with
/// per-path indices. Immutable once built; activation swaps the whole
/// artifact.
#[derive(Debug, Clone, Default)]
pub struct CompiledPolicy {
    pub modules: Vec<Module>,
    pub tree: RuleTree,
}

impl CompiledPolicy {
    pub fn empty() -> Self {
        CompiledPolicy::default()
    }

    /// Rules defined exactly at `path` (under the `data` root).
    pub fn rules_at(&self, path: &[String]) -> &[Rule] {
        self.tree
            .node(path)
            .map_or(&[], |node| node.rules.as_slice())
    }
}

/// The compiler. Holds the built-in registry for name and signature
/// checks, the error cap, and the base-document paths used for the
/// overlap pre-check.
pub struct Compiler<'a> {
    registry: &'a Registry,
    max_errors: usize,
    base_paths: Vec<Vec<String>>,
    errors: Vec<CompileError>,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Compiler {
            registry,
            max_errors: DEFAULT_MAX_ERRORS,
            base_paths: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Override the error-collection cap.
    pub fn with_max_errors(mut self, max: usize) -> Self {
        self.max_errors = max.max(1);
        self
    }

    /// Declare base-document paths for the base/virtual overlap check.
    pub fn with_base_paths(mut self, paths: Vec<Vec<String>>) -> Self {
        self.base_paths = paths;
        self
    }

    fn push_error(&mut self, err: CompileError) {
        if self.errors.len() < self.max_errors {
            self.errors.push(err);
        }
    }

    fn at_cap(&self) -> bool {
        self.errors.len() >= self.max_errors
    }

    /// Compile a set of modules into an executable policy. All-or-
    /// nothing: either a complete artifact is returned or the full
    /// error set.
    pub fn compile(mut self, modules: Vec<Module>) -> Result<CompiledPolicy, Vec<CompileError>> {
        // Phase 1: resolve imports and intra-package references.
        let mut modules: Vec<Module> = modules
            .into_iter()
            .map(|m| self.resolve_module(m))
            .collect();

        // Phase 2: head normalization.
        for module in &mut modules {
            for rule in &mut module.rules {
                normalize_rule(rule);
            }
        }

        // Phase 3: rewriting.
        for module in &mut modules {
            for rule in &mut module.rules {
                rewrite::rewrite_rule(rule, &mut self.errors, self.max_errors);
            }
        }

        // Phase 4: safety analysis.
        for module in &mut modules {
            for rule in &module.rules {
                if self.at_cap() {
                    break;
                }
                for err in safety::check_rule(rule) {
                    self.push_error(err);
                }
            }
        }

        // Safe bodies are order-independent; the evaluator is not.
        // Schedule each body so inputs are bound before use.
        for module in &mut modules {
            for rule in &mut module.rules {
                safety::reorder_rule(rule);
            }
        }

        // Phase 5: type checking.
        for module in &modules {
            for rule in &module.rules {
                if self.at_cap() {
                    break;
                }
                for err in types::check_rule(rule, self.registry) {
                    self.push_error(err);
                }
            }
        }

        // Build the rule tree; later phases consult it.
        let mut tree = RuleTree::default();
        for module in &modules {
            let package = module.package_path();
            for rule in &module.rules {
                let mut path = package.clone();
                path.push(rule.head.name.clone());
                tree.node_mut(&path).rules.push(rule.clone());
            }
        }

        // Phase 6: recursion check.
        for err in graph::check_recursion(&tree) {
            self.push_error(err);
        }

        // Phase 7: conflict pre-checks.
        self.check_conflicts(&tree);

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        // Phase 8: rule indexing.
        build_indices(&mut tree);

        Ok(CompiledPolicy { modules, tree })
    }

    // ------------------------------------------------------------------
    // Phase 1: resolution
    // ------------------------------------------------------------------

    /// Expand import aliases and bare same-package rule references into
    /// full `data` refs, and canonicalize user function call names.
    fn resolve_module(&mut self, mut module: Module) -> Module {
        let package = module.package_path();

        // Alias map: name -> full ref value.
        let mut aliases: BTreeMap<String, Value> = BTreeMap::new();
        for import in &module.imports {
            match import.path.clone() {
                Value::Ref(parts) => {
                    let head_ok = matches!(
                        parts.first(),
                        Some(Value::Var(root)) if root == "data" || root == "input"
                    );
                    if !head_ok {
                        self.push_error(CompileError::new(
                            "compile/type",
                            format!("import path must start with data or input: {}", import.path),
                            import.loc,
                        ));
                        continue;
                    }
                    if let Some(name) = import.name() {
                        aliases.insert(name, Value::Ref(parts));
                    }
                }
                other => {
                    self.push_error(CompileError::new(
                        "compile/type",
                        format!("invalid import path: {other}"),
                        import.loc,
                    ));
                }
            }
        }

        // Names of rules in this package, for bare-reference resolution.
        let rule_names: std::collections::BTreeSet<String> =
            module.rules.iter().map(|r| r.head.name.clone()).collect();

        let ctx = ResolveCtx {
            package: &package,
            aliases: &aliases,
            rule_names: &rule_names,
            registry: self.registry,
        };
        let mut errors = Vec::new();
        for rule in &mut module.rules {
            resolve_rule(rule, &ctx, &mut errors);
        }
        for err in errors {
            self.push_error(err);
        }
        module
    }

    // ------------------------------------------------------------------
    // Phase 7: conflicts
    // ------------------------------------------------------------------

    fn check_conflicts(&mut self, tree: &RuleTree) {
        for path in tree.paths() {
            let Some(node) = tree.node(&path) else {
                continue;
            };
            let rules = &node.rules;

            // All rules at one path must share a kind.
            let first_kind = rules[0].kind();
            for rule in rules.iter().skip(1) {
                if rule.kind() != first_kind {
                    self.push_error(CompileError::new(
                        "compile/conflict",
                        format!(
                            "rule {} defined with conflicting kinds ({:?} and {:?})",
                            path.join("."),
                            first_kind,
                            rule.kind()
                        ),
                        rule.loc,
                    ));
                }
            }

            // At most one default, and defaults must agree.
            let defaults: Vec<&Rule> = rules.iter().filter(|r| r.is_default).collect();
            if defaults.len() > 1 {
                let agree = defaults
                    .windows(2)
                    .all(|w| w[0].head.value == w[1].head.value);
                if !agree {
                    self.push_error(CompileError::new(
                        "compile/conflict",
                        format!(
                            "multiple default definitions for {} with different values",
                            path.join(".")
                        ),
                        defaults[1].loc,
                    ));
                }
            }

            // A rule path may not sit under (or over) a base-document path.
            for base in self.base_paths.clone() {
                let overlap = base.len() <= path.len() && path.starts_with(&base)
                    || path.len() <= base.len() && base.starts_with(&path);
                if overlap {
                    self.push_error(CompileError::new(
                        "compile/conflict",
                        format!(
                            "rule path data.{} conflicts with base document data.{}",
                            path.join("."),
                            base.join(".")
                        ),
                        rules[0].loc,
                    ));
                }
            }
        }

        // A rule path may not be a strict prefix of another rule path
        // (a document cannot be both a value and a namespace).
        let paths = tree.paths();
        for a in &paths {
            for b in &paths {
                if a.len() < b.len() && b.starts_with(a) {
                    self.push_error(CompileError::new(
                        "compile/conflict",
                        format!(
                            "rule data.{} shadows rules under data.{}",
                            a.join("."),
                            b.join(".")
                        ),
                        Location::default(),
                    ));
                }
            }
        }
    }
}

/// Prepare a parsed query for evaluation: apply the same rewrites,
/// safety analysis, and body scheduling as rule bodies get. Queries
/// skip package/import resolution, so refs must be written in full
/// (`data.pkg.rule`, not bare names).
pub fn prepare_query(
    query: crate::ast::Query,
    registry: &Registry,
) -> Result<crate::ast::Query, Vec<CompileError>> {
    let mut rule = Rule {
        head: crate::ast::Head {
            name: "$query".to_string(),
            key: None,
            value: Some(Term::boolean(true)),
            args: None,
            loc: Location::default(),
        },
        body: query.body,
        else_rule: None,
        is_default: false,
        loc: Location::default(),
    };

    let mut errors = Vec::new();
    rewrite::rewrite_rule(&mut rule, &mut errors, DEFAULT_MAX_ERRORS);
    errors.extend(safety::check_rule(&rule));
    errors.extend(types::check_rule(&rule, registry));
    if !errors.is_empty() {
        return Err(errors);
    }
    safety::reorder_rule(&mut rule);
    Ok(crate::ast::Query { body: rule.body })
}

/// Phase 2: canonicalize heads. `p { body }` becomes `p = true`;
/// function heads without a value produce `true`.
fn normalize_rule(rule: &mut Rule) {
    match rule.head.kind() {
        RuleKind::Complete | RuleKind::Function => {
            if rule.head.value.is_none() {
                rule.head.value = Some(Term::boolean(true));
            }
        }
        RuleKind::PartialSet | RuleKind::PartialObject => {}
    }
    if let Some(else_rule) = &mut rule.else_rule {
        normalize_rule(else_rule);
    }
}

/// Phase 8: attach a discrimination-tree index to every rule node.
fn build_indices(tree: &mut RuleTree) {
    if !tree.rules.is_empty() {
        tree.index = Some(RuleIndex::build(&tree.rules));
    }
    for child in tree.children.values_mut() {
        build_indices(child);
    }
}

// ----------------------------------------------------------------------
// Reference resolution helpers
// ----------------------------------------------------------------------

struct ResolveCtx<'a> {
    package: &'a [String],
    aliases: &'a BTreeMap<String, Value>,
    rule_names: &'a std::collections::BTreeSet<String>,
    registry: &'a Registry,
}

impl ResolveCtx<'_> {
    /// Full dotted path for a rule in this package.
    fn qualified(&self, name: &str) -> String {
        let mut parts = vec!["data".to_string()];
        parts.extend(self.package.iter().cloned());
        parts.push(name.to_string());
        parts.join(".")
    }

    fn alias_ref_terms(&self, name: &str) -> Option<Vec<Term>> {
        let Value::Ref(parts) = self.aliases.get(name)? else {
            return None;
        };
        Some(
            parts
                .iter()
                .map(|v| Term::Value(v.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

fn resolve_rule(rule: &mut Rule, ctx: &ResolveCtx<'_>, errors: &mut Vec<CompileError>) {
    // Vars bound locally in this rule shadow imports and rule names.
    let mut locals = rule.head_vars();
    for expr in &rule.body {
        collect_locally_bound(expr, &mut locals);
    }

    if let Some(key) = &mut rule.head.key {
        resolve_term(key, ctx, &locals, errors);
    }
    if let Some(value) = &mut rule.head.value {
        resolve_term(value, ctx, &locals, errors);
    }
    for expr in &mut rule.body {
        resolve_expr(expr, ctx, &locals, errors);
    }
    if let Some(else_rule) = &mut rule.else_rule {
        resolve_rule(else_rule, ctx, errors);
    }
}

/// Vars introduced by `:=`, `some`, membership, and ref-operand
/// iteration. These are rule-local and must not be rewritten into data
/// refs.
fn collect_locally_bound(expr: &Expr, out: &mut std::collections::BTreeSet<String>) {
    match &expr.kind {
        ExprKind::Term(t) => collect_operand_vars(t, out),
        ExprKind::Eq(a, b) | ExprKind::Comparison(_, a, b) => {
            collect_operand_vars(a, out);
            collect_operand_vars(b, out);
        }
        ExprKind::Call(_, args, _) => {
            for arg in args {
                collect_operand_vars(arg, out);
            }
        }
        ExprKind::Assign(lhs, rhs) => {
            lhs.collect_vars(out);
            collect_operand_vars(rhs, out);
        }
        ExprKind::SomeDecl(names) => out.extend(names.iter().cloned()),
        ExprKind::In { key, value, .. } => {
            if let Some(k) = key {
                k.collect_vars(out);
            }
            value.collect_vars(out);
        }
        ExprKind::Every { key, value, body, .. } => {
            if let Some(k) = key {
                out.insert(k.clone());
            }
            out.insert(value.clone());
            for e in body {
                collect_locally_bound(e, out);
            }
        }
        ExprKind::Block(body) => {
            for e in body {
                collect_locally_bound(e, out);
            }
        }
        _ => {}
    }
}

/// Vars appearing as ref operands (`data.servers[i]` binds `i`).
fn collect_operand_vars(term: &Term, out: &mut std::collections::BTreeSet<String>) {
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
                    collect_operand_vars(part, out);
                }
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                collect_operand_vars(item, out);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                collect_operand_vars(k, out);
                collect_operand_vars(v, out);
            }
        }
        Term::Call(_, args, _) => {
            for arg in args {
                collect_operand_vars(arg, out);
            }
        }
        Term::ArrayCompr { .. } | Term::SetCompr { .. } | Term::ObjectCompr { .. } => {}
    }
}

fn resolve_expr(
    expr: &mut Expr,
    ctx: &ResolveCtx<'_>,
    locals: &std::collections::BTreeSet<String>,
    errors: &mut Vec<CompileError>,
) {
    match &mut expr.kind {
        ExprKind::Term(t) => resolve_term(t, ctx, locals, errors),
        ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
            resolve_term(a, ctx, locals, errors);
            resolve_term(b, ctx, locals, errors);
        }
        ExprKind::Call(name, args, loc) => {
            resolve_call_name(name, ctx, *loc, errors);
            for arg in args {
                resolve_term(arg, ctx, locals, errors);
            }
        }
        ExprKind::SomeDecl(_) => {}
        ExprKind::In {
            key,
            value,
            collection,
        } => {
            if let Some(k) = key {
                resolve_term(k, ctx, locals, errors);
            }
            resolve_term(value, ctx, locals, errors);
            resolve_term(collection, ctx, locals, errors);
        }
        ExprKind::Every { domain, body, .. } => {
            resolve_term(domain, ctx, locals, errors);
            for e in body {
                resolve_expr(e, ctx, locals, errors);
            }
        }
        ExprKind::Block(body) => {
            for e in body {
                resolve_expr(e, ctx, locals, errors);
            }
        }
    }
    for w in &mut expr.with {
        resolve_term(&mut w.target, ctx, locals, errors);
        resolve_term(&mut w.value, ctx, locals, errors);
    }
}

/// Canonicalize a call name: built-ins stay; bare same-package function
/// names become full dotted paths; unknown names are reported.
fn resolve_call_name(
    name: &mut String,
    ctx: &ResolveCtx<'_>,
    loc: Location,
    errors: &mut Vec<CompileError>,
) {
    if ctx.registry.contains(name) || name.starts_with("data.") {
        return;
    }
    if ctx.rule_names.contains(name.as_str()) {
        *name = ctx.qualified(name);
        return;
    }
    errors.push(CompileError::new(
        "compile/type",
        format!("unknown function or built-in '{name}'"),
        loc,
    ));
}

fn resolve_term(
    term: &mut Term,
    ctx: &ResolveCtx<'_>,
    locals: &std::collections::BTreeSet<String>,
    errors: &mut Vec<CompileError>,
) {
    match term {
        Term::Value(Value::Var(name)) => {
            if name == "data" || name == "input" || locals.contains(name.as_str()) {
                return;
            }
            if let Some(parts) = ctx.alias_ref_terms(name) {
                *term = Term::Ref(parts);
            } else if ctx.rule_names.contains(name.as_str()) {
                let mut parts = vec![Term::var("data")];
                parts.extend(ctx.package.iter().map(|s| Term::string(s.clone())));
                parts.push(Term::string(name.clone()));
                *term = Term::Ref(parts);
            }
        }
        Term::Value(_) => {}
        Term::Ref(parts) => {
            // Rewrite the head if it is an alias or a bare rule name.
            let head_rewrite = match parts.first().and_then(Term::as_var) {
                Some(head) if head != "data" && head != "input" && !locals.contains(head) => {
                    if let Some(alias_parts) = ctx.alias_ref_terms(head) {
                        Some(alias_parts)
                    } else if ctx.rule_names.contains(head) {
                        let mut p = vec![Term::var("data")];
                        p.extend(ctx.package.iter().map(|s| Term::string(s.clone())));
                        p.push(Term::string(head.to_string()));
                        Some(p)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            if let Some(mut new_parts) = head_rewrite {
                new_parts.extend(parts.iter().skip(1).cloned());
                *parts = new_parts;
            }
            for (i, part) in parts.iter_mut().enumerate() {
                if i > 0 {
                    resolve_term(part, ctx, locals, errors);
                }
            }
        }
        Term::Array(items) | Term::Set(items) => {
            for item in items {
                resolve_term(item, ctx, locals, errors);
            }
        }
        Term::Object(pairs) => {
            for (k, v) in pairs {
                resolve_term(k, ctx, locals, errors);
                resolve_term(v, ctx, locals, errors);
            }
        }
        Term::Call(name, args, loc) => {
            resolve_call_name(name, ctx, *loc, errors);
            for arg in args {
                resolve_term(arg, ctx, locals, errors);
            }
        }
        Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
            let mut inner_locals = locals.clone();
            for e in body.iter() {
                collect_locally_bound(e, &mut inner_locals);
            }
            resolve_term(term, ctx, &inner_locals, errors);
            for e in body {
                resolve_expr(e, ctx, &inner_locals, errors);
            }
        }
        Term::ObjectCompr { key, value, body } => {
            let mut inner_locals = locals.clone();
            for e in body.iter() {
                collect_locally_bound(e, &mut inner_locals);
            }
            resolve_term(key, ctx, &inner_locals, errors);
            resolve_term(value, ctx, &inner_locals, errors);
            for e in body {
                resolve_expr(e, ctx, &inner_locals, errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::Registry;
    use crate::parser::parse_module;

    fn compile(sources: &[&str]) -> Result<CompiledPolicy, Vec<CompileError>> {
        let registry = Registry::standard();
        let modules: Vec<Module> = sources
            .iter()
            .map(|s| parse_module(s).expect("parse"))
            .collect();
        Compiler::new(&registry).compile(modules)
    }

    #[test]
    fn test_compile_simple_module() {
        let policy = compile(&["package p\n\nallow = true { input.user == \"alice\" }\n"])
            .expect("compile");
        assert_eq!(policy.rules_at(&["p".into(), "allow".into()]).len(), 1);
    }

    #[test]
    fn test_head_normalization() {
        let policy = compile(&["package p\n\nallow { input.admin }\n"]).expect("compile");
        let rule = &policy.rules_at(&["p".into(), "allow".into()])[0];
        assert_eq!(rule.head.value, Some(Term::boolean(true)));
    }

    #[test]
    fn test_unsafe_variable_rejected() {
        let errors = compile(&["package p\n\nq = x { input.a }\n"]).unwrap_err();
        assert!(errors.iter().any(|e| e.code == "compile/safety"));
    }

    #[test]
    fn test_recursion_rejected() {
        let errors = compile(&[
            "package p\n\na { data.p.b }\nb { data.p.a }\n",
        ])
        .unwrap_err();
        assert!(errors.iter().any(|e| e.code == "compile/recursion"));
    }

    #[test]
    fn test_unknown_builtin_rejected() {
        let errors = compile(&["package p\n\nq { no_such_fn(1) }\n"]).unwrap_err();
        assert!(errors.iter().any(|e| e.code == "compile/type"));
    }

    #[test]
    fn test_base_virtual_overlap_rejected() {
        let registry = Registry::standard();
        let modules = vec![parse_module("package x\n\ny = 1\n").expect("parse")];
        let errors = Compiler::new(&registry)
            .with_base_paths(vec![vec!["x".to_string()]])
            .compile(modules)
            .unwrap_err();
        assert!(errors.iter().any(|e| e.code == "compile/conflict"));
    }

    #[test]
    fn test_conflicting_kinds_rejected() {
        let errors = compile(&["package p\n\nq = 1\nq[x] { x := 2 }\n"]).unwrap_err();
        assert!(errors.iter().any(|e| e.code == "compile/conflict"));
    }

    #[test]
    fn test_error_cap() {
        let registry = Registry::standard();
        // Ten unsafe rules, cap at 3.
        let source: String = std::iter::once("package p\n".to_string())
            .chain((0..10).map(|i| format!("r{i} = x{i} {{ input.a }}\n")))
            .collect();
        let modules = vec![parse_module(&source).expect("parse")];
        let errors = Compiler::new(&registry)
            .with_max_errors(3)
            .compile(modules)
            .unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_import_alias_resolution() {
        let policy = compile(&[
            "package p\n\nimport data.servers as s\n\nq { s[_].id == \"s1\" }\n",
        ])
        .expect("compile");
        // The body ref now starts at data.servers.
        let rule = &policy.rules_at(&["p".into(), "q".into()])[0];
        let body = rule.body[0].to_string();
        assert!(body.contains("data.servers"), "resolved body: {body}");
    }

    #[test]
    fn test_bare_rule_reference_resolution() {
        let policy = compile(&[
            "package p\n\nbase = 1\nq = y { y := base + 1 }\n",
        ])
        .expect("compile");
        let rule = &policy.rules_at(&["p".into(), "q".into()])[0];
        assert!(rule.body[0].to_string().contains("data.p.base"));
    }

    #[test]
    fn test_multiple_modules_same_package() {
        let policy = compile(&[
            "package p\n\na = 1\n",
            "package p\n\nb = 2\n",
        ])
        .expect("compile");
        assert_eq!(policy.rules_at(&["p".into(), "a".into()]).len(), 1);
        assert_eq!(policy.rules_at(&["p".into(), "b".into()]).len(), 1);
    }
}
