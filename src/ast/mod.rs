//! # Policy AST - Abstract Syntax Tree Types
//!
//! Abstract syntax for policy modules: packages, imports, rules, rule
//! heads, bodies, and terms. Produced by the parser and consumed by the
//! compiler and evaluator.
//!
//! Locations are carried on nodes for error reporting but do not
//! participate in equality or hashing, so structurally identical trees
//! compare equal regardless of where they were parsed from.
//!
//! ## Builders
//!
//! For programmatic construction of AST nodes, see the [`builders`]
//! module which provides helpers like `rule` and `eq_expr`.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod builders;

// ============================================================================
// Source locations
// ============================================================================

/// A position in source text (1-based line and column).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl Location {
    pub fn new(line: usize, col: usize) -> Self {
        Location { line, col }
    }
}

// Excluded from equality so that structural comparison of trees ignores
// where they came from.
impl PartialEq for Location {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Eq for Location {}

impl std::hash::Hash for Location {
    fn hash<H: std::hash::Hasher>(&self, _state: &mut H) {}
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

// ============================================================================
// Modules and imports
// ============================================================================

/// A unit of policy source: one package, its imports, and its rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Package path as a ref rooted at `data`, e.g. `data.http.authz`.
    pub package: Value,
    pub imports: Vec<Import>,
    pub rules: Vec<Rule>,
}

impl Module {
    /// Package path segments below the `data` root.
    pub fn package_path(&self) -> Vec<String> {
        ref_string_operands(&self.package)
    }
}

/// `import data.servers as servers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    /// Imported path (a ref rooted at `data` or `input`).
    pub path: Value,
    pub alias: Option<String>,
    pub loc: Location,
}

impl Import {
    /// The name this import binds in rule bodies: the alias if given,
    /// otherwise the last path segment.
    pub fn name(&self) -> Option<String> {
        if let Some(alias) = &self.alias {
            return Some(alias.clone());
        }
        match &self.path {
            Value::Ref(parts) => match parts.last() {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

/// The shape of a rule head determines what the rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    /// `name = value` - at most one value.
    Complete,
    /// `name contains x` / `name[x]` - a set of key bindings.
    PartialSet,
    /// `name[k] = v` - an object of key/value pairs.
    PartialObject,
    /// `name(a, b) = value` - callable with arguments.
    Function,
}

/// A named declarative clause producing a virtual-document fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub head: Head,
    pub body: Vec<Expr>,
    /// Ordered fallbacks sharing the head name.
    pub else_rule: Option<Box<Rule>>,
    /// `default name = value` rules have an empty body.
    pub is_default: bool,
    pub loc: Location,
}

impl Rule {
    pub fn kind(&self) -> RuleKind {
        self.head.kind()
    }

    /// All variables appearing in the head terms.
    pub fn head_vars(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        if let Some(key) = &self.head.key {
            key.collect_vars(&mut vars);
        }
        if let Some(value) = &self.head.value {
            value.collect_vars(&mut vars);
        }
        if let Some(args) = &self.head.args {
            for arg in args {
                arg.collect_vars(&mut vars);
            }
        }
        vars
    }
}

/// A rule head: name plus optional key, value, and argument terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub name: String,
    /// Key term for partial rules (`name[key]`).
    pub key: Option<Term>,
    /// Value term (`= value`); `None` before head normalization.
    pub value: Option<Term>,
    /// Argument list for functions.
    pub args: Option<Vec<Term>>,
    pub loc: Location,
}

impl Head {
    pub fn kind(&self) -> RuleKind {
        if self.args.is_some() {
            RuleKind::Function
        } else if self.key.is_some() && self.value.is_some() {
            RuleKind::PartialObject
        } else if self.key.is_some() {
            RuleKind::PartialSet
        } else {
            RuleKind::Complete
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Comparison operators. `=` is unification, not comparison, and has its
/// own expression kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Neq => "!=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
        }
    }
}

/// `with target as value` - transient override of a document subtree for
/// the duration of the expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithModifier {
    /// Override target, a ref into `input` or `data`.
    pub target: Term,
    pub value: Term,
    pub loc: Location,
}

/// One step of a rule body or query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub negated: bool,
    pub with: Vec<WithModifier>,
    pub loc: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Bare term; succeeds when defined and not `false`.
    Term(Term),
    /// Unification `a = b`.
    Eq(Term, Term),
    /// Assignment `x := v`; the compiler checks single-binding and
    /// rewrites it into unification.
    Assign(Term, Term),
    Comparison(CompareOp, Term, Term),
    /// Built-in or user function call in expression position.
    Call(String, Vec<Term>, Location),
    /// `some x, y` - declares body-local variables.
    SomeDecl(Vec<String>),
    /// Membership: `x in xs`, `k, v in xs`, `some x in xs`.
    In {
        key: Option<Term>,
        value: Term,
        collection: Term,
    },
    /// `every [k,] v in dom { body }`; rewritten by the compiler into a
    /// doubly negated block before evaluation.
    Every {
        key: Option<String>,
        value: String,
        domain: Term,
        body: Vec<Expr>,
    },
    /// A nested query: succeeds if the body has at least one solution.
    /// Produced by the `every` rewrite; variables inside are local.
    Block(Vec<Expr>),
}

impl Expr {
    pub fn term(t: Term, loc: Location) -> Expr {
        Expr {
            kind: ExprKind::Term(t),
            negated: false,
            with: Vec::new(),
            loc,
        }
    }

    /// Variables appearing anywhere in this expression, including
    /// nested blocks.
    pub fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match &self.kind {
            ExprKind::Term(t) => t.collect_vars(out),
            ExprKind::Eq(a, b) | ExprKind::Assign(a, b) | ExprKind::Comparison(_, a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
            ExprKind::Call(_, args, _) => {
                for arg in args {
                    arg.collect_vars(out);
                }
            }
            ExprKind::SomeDecl(names) => {
                out.extend(names.iter().cloned());
            }
            ExprKind::In {
                key,
                value,
                collection,
            } => {
                if let Some(k) = key {
                    k.collect_vars(out);
                }
                value.collect_vars(out);
                collection.collect_vars(out);
            }
            ExprKind::Every {
                key,
                value,
                domain,
                body,
            } => {
                if let Some(k) = key {
                    out.insert(k.clone());
                }
                out.insert(value.clone());
                domain.collect_vars(out);
                for e in body {
                    e.collect_vars(out);
                }
            }
            ExprKind::Block(body) => {
                for e in body {
                    e.collect_vars(out);
                }
            }
        }
    }
}

// ============================================================================
// Terms
// ============================================================================

/// A term expression. Scalars, variables, and refs are carried as
/// [`Value`]s; composites and comprehensions nest terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// A scalar, `Var`, or ground composite.
    Value(Value),
    /// Reference with possibly non-ground operands: `data.servers[i].id`.
    Ref(Vec<Term>),
    Array(Vec<Term>),
    Object(Vec<(Term, Term)>),
    Set(Vec<Term>),
    /// Function or built-in call in term position: `count(xs)`.
    Call(String, Vec<Term>, Location),
    ArrayCompr {
        term: Box<Term>,
        body: Vec<Expr>,
    },
    SetCompr {
        term: Box<Term>,
        body: Vec<Expr>,
    },
    ObjectCompr {
        key: Box<Term>,
        value: Box<Term>,
        body: Vec<Expr>,
    },
}

impl Term {
    pub fn var(name: impl Into<String>) -> Term {
        Term::Value(Value::var(name))
    }

    pub fn string(s: impl Into<String>) -> Term {
        Term::Value(Value::string(s))
    }

    pub fn number(n: i64) -> Term {
        Term::Value(Value::number(n))
    }

    pub fn boolean(b: bool) -> Term {
        Term::Value(Value::Bool(b))
    }

    /// True when the term is a plain variable.
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Term::Value(Value::Var(name)) => Some(name),
            _ => None,
        }
    }

    /// The ground value of a term that contains no variables, refs, or
    /// comprehensions.
    pub fn as_ground(&self) -> Option<&Value> {
        match self {
            Term::Value(v) if v.is_ground() => Some(v),
            _ => None,
        }
    }

    /// Head variable name if this term is a ref (`data`, `input`, or a
    /// local alias).
    pub fn ref_head(&self) -> Option<&str> {
        match self {
            Term::Ref(parts) => parts.first().and_then(Term::as_var),
            Term::Value(Value::Var(name)) => Some(name),
            _ => None,
        }
    }

    pub fn collect_vars(&self, out: &mut BTreeSet<String>) {
        match self {
            Term::Value(v) => collect_value_vars(v, out),
            Term::Ref(parts) => {
                // The head var of a ref is a document root, not a body
                // variable; only operand vars iterate.
                for (i, part) in parts.iter().enumerate() {
                    if i == 0 {
                        continue;
                    }
                    part.collect_vars(out);
                }
            }
            Term::Array(items) | Term::Set(items) => {
                for item in items {
                    item.collect_vars(out);
                }
            }
            Term::Object(pairs) => {
                for (k, v) in pairs {
                    k.collect_vars(out);
                    v.collect_vars(out);
                }
            }
            Term::Call(_, args, _) => {
                for arg in args {
                    arg.collect_vars(out);
                }
            }
            Term::ArrayCompr { term, body } | Term::SetCompr { term, body } => {
                term.collect_vars(out);
                for e in body {
                    e.collect_vars(out);
                }
            }
            Term::ObjectCompr { key, value, body } => {
                key.collect_vars(out);
                value.collect_vars(out);
                for e in body {
                    e.collect_vars(out);
                }
            }
        }
    }
}

fn collect_value_vars(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Var(name) => {
            out.insert(name.clone());
        }
        Value::Array(items) => {
            for item in items {
                collect_value_vars(item, out);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                collect_value_vars(k, out);
                collect_value_vars(v, out);
            }
        }
        Value::Set(items) => {
            for item in items {
                collect_value_vars(item, out);
            }
        }
        Value::Ref(parts) => {
            for (i, part) in parts.iter().enumerate() {
                if i == 0 {
                    continue;
                }
                collect_value_vars(part, out);
            }
        }
        _ => {}
    }
}

/// String operands of a ref value (skipping the head var).
pub fn ref_string_operands(r: &Value) -> Vec<String> {
    match r {
        Value::Ref(parts) => parts
            .iter()
            .skip(1)
            .filter_map(|p| p.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Queries
// ============================================================================

/// A parsed query: an ordered conjunction of expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub body: Vec<Expr>,
}

// ============================================================================
// Pretty-printing (canonical form)
// ============================================================================

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "package {}", package_display(&self.package))?;
        if !self.imports.is_empty() {
            writeln!(f)?;
            for import in &self.imports {
                writeln!(f, "{import}")?;
            }
        }
        for rule in &self.rules {
            writeln!(f)?;
            write!(f, "{rule}")?;
        }
        Ok(())
    }
}

/// Package refs print without the synthetic `data` root.
fn package_display(package: &Value) -> String {
    ref_string_operands(package).join(".")
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import {}", self.path)?;
        if let Some(alias) = &self.alias {
            write!(f, " as {alias}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default {
            write!(f, "default ")?;
        }
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            writeln!(f, " {{")?;
            for expr in &self.body {
                writeln!(f, "    {expr}")?;
            }
            write!(f, "}}")?;
        }
        if let Some(else_rule) = &self.else_rule {
            write!(f, " else ")?;
            if let Some(value) = &else_rule.head.value {
                write!(f, "= {value} ")?;
            }
            if !else_rule.body.is_empty() {
                writeln!(f, "{{")?;
                for expr in &else_rule.body {
                    writeln!(f, "    {expr}")?;
                }
                write!(f, "}}")?;
            }
        }
        writeln!(f)
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(args) = &self.args {
            write!(f, "(")?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ")")?;
        }
        if let Some(key) = &self.key {
            write!(f, "[{key}]")?;
        }
        if let Some(value) = &self.value {
            write!(f, " = {value}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not ")?;
        }
        match &self.kind {
            ExprKind::Term(t) => write!(f, "{t}")?,
            ExprKind::Eq(a, b) => write!(f, "{a} = {b}")?,
            ExprKind::Assign(a, b) => write!(f, "{a} := {b}")?,
            ExprKind::Comparison(op, a, b) => write!(f, "{a} {} {b}", op.symbol())?,
            ExprKind::Call(name, args, _) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")?;
            }
            ExprKind::SomeDecl(names) => write!(f, "some {}", names.join(", "))?,
            ExprKind::In {
                key,
                value,
                collection,
            } => {
                if let Some(k) = key {
                    write!(f, "{k}, ")?;
                }
                write!(f, "{value} in {collection}")?;
            }
            ExprKind::Every {
                key,
                value,
                domain,
                body,
            } => {
                write!(f, "every ")?;
                if let Some(k) = key {
                    write!(f, "{k}, ")?;
                }
                write!(f, "{value} in {domain} {{ ")?;
                for (i, e) in body.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, " }}")?;
            }
            ExprKind::Block(body) => {
                write!(f, "(")?;
                for (i, e) in body.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")?;
            }
        }
        for w in &self.with {
            write!(f, " with {} as {}", w.target, w.value)?;
        }
        Ok(())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Value(v) => write!(f, "{v}"),
            Term::Ref(parts) => {
                let mut first = true;
                for part in parts {
                    match part {
                        Term::Value(Value::Var(name)) if first => write!(f, "{name}")?,
                        Term::Value(Value::String(s)) if !first && is_ident_str(s) => {
                            write!(f, ".{s}")?;
                        }
                        other => {
                            if first {
                                write!(f, "{other}")?;
                            } else {
                                write!(f, "[{other}]")?;
                            }
                        }
                    }
                    first = false;
                }
                Ok(())
            }
            Term::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Term::Object(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Term::Set(items) => {
                if items.is_empty() {
                    return write!(f, "set()");
                }
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Term::Call(name, args, _) => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Term::ArrayCompr { term, body } => {
                write!(f, "[{term} | ")?;
                write_body(f, body)?;
                write!(f, "]")
            }
            Term::SetCompr { term, body } => {
                write!(f, "{{{term} | ")?;
                write_body(f, body)?;
                write!(f, "}}")
            }
            Term::ObjectCompr { key, value, body } => {
                write!(f, "{{{key}: {value} | ")?;
                write_body(f, body)?;
                write!(f, "}}")
            }
        }
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &[Expr]) -> fmt::Result {
    for (i, e) in body.iter().enumerate() {
        if i > 0 {
            write!(f, "; ")?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}

fn is_ident_str(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_ignored_in_equality() {
        let a = Term::Value(Value::var("x"));
        let b = Term::Value(Value::var("x"));
        assert_eq!(a, b);

        let e1 = Expr::term(a, Location::new(1, 1));
        let e2 = Expr::term(b, Location::new(9, 9));
        assert_eq!(e1, e2);
    }

    #[test]
    fn test_head_kind() {
        let complete = Head {
            name: "allow".into(),
            key: None,
            value: Some(Term::boolean(true)),
            args: None,
            loc: Location::default(),
        };
        assert_eq!(complete.kind(), RuleKind::Complete);

        let partial_set = Head {
            name: "violations".into(),
            key: Some(Term::var("x")),
            value: None,
            args: None,
            loc: Location::default(),
        };
        assert_eq!(partial_set.kind(), RuleKind::PartialSet);

        let partial_object = Head {
            name: "ports".into(),
            key: Some(Term::var("k")),
            value: Some(Term::var("v")),
            args: None,
            loc: Location::default(),
        };
        assert_eq!(partial_object.kind(), RuleKind::PartialObject);

        let function = Head {
            name: "score".into(),
            key: None,
            value: Some(Term::number(0)),
            args: Some(vec![Term::var("u")]),
            loc: Location::default(),
        };
        assert_eq!(function.kind(), RuleKind::Function);
    }

    #[test]
    fn test_ref_head_var_not_a_body_var() {
        let term = Term::Ref(vec![
            Term::var("input"),
            Term::string("users"),
            Term::var("i"),
        ]);
        let mut vars = BTreeSet::new();
        term.collect_vars(&mut vars);
        assert!(vars.contains("i"));
        assert!(!vars.contains("input"));
    }

    #[test]
    fn test_display_head() {
        let head = Head {
            name: "score".into(),
            key: None,
            value: Some(Term::number(10)),
            args: Some(vec![Term::var("u")]),
            loc: Location::default(),
        };
        assert_eq!(head.to_string(), "score(u) = 10");
    }
}
