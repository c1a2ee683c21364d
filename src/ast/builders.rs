//! Builder Patterns for AST Construction
//!
//! Provides helpers for constructing AST nodes programmatically,
//! particularly useful for tests.
//!
//! ## Example
//!
//! ```rust
//! use verdict::ast::builders::{complete_rule, eq_expr, ref_term};
//! use verdict::ast::Term;
//!
//! // allow = true { input.user = "alice" }
//! let rule = complete_rule(
//!     "allow",
//!     Term::boolean(true),
//!     vec![eq_expr(
//!         ref_term("input", &["user"]),
//!         Term::string("alice"),
//!     )],
//! );
//! assert_eq!(rule.head.name, "allow");
//! ```

use super::{Expr, ExprKind, Head, Location, Rule, Term};

/// A ref term `head.seg1.seg2...` with string operands.
pub fn ref_term(head: &str, segments: &[&str]) -> Term {
    let mut parts = vec![Term::var(head)];
    parts.extend(segments.iter().map(|s| Term::string(*s)));
    Term::Ref(parts)
}

/// A complete rule `name = value { body }`.
pub fn complete_rule(name: &str, value: Term, body: Vec<Expr>) -> Rule {
    Rule {
        head: Head {
            name: name.to_string(),
            key: None,
            value: Some(value),
            args: None,
            loc: Location::default(),
        },
        body,
        else_rule: None,
        is_default: false,
        loc: Location::default(),
    }
}

/// A partial-set rule `name[key] { body }`.
pub fn partial_set_rule(name: &str, key: Term, body: Vec<Expr>) -> Rule {
    Rule {
        head: Head {
            name: name.to_string(),
            key: Some(key),
            value: None,
            args: None,
            loc: Location::default(),
        },
        body,
        else_rule: None,
        is_default: false,
        loc: Location::default(),
    }
}

/// A function rule `name(args...) = value { body }`.
pub fn function_rule(name: &str, args: Vec<Term>, value: Term, body: Vec<Expr>) -> Rule {
    Rule {
        head: Head {
            name: name.to_string(),
            key: None,
            value: Some(value),
            args: Some(args),
            loc: Location::default(),
        },
        body,
        else_rule: None,
        is_default: false,
        loc: Location::default(),
    }
}

/// A unification expression `a = b`.
pub fn eq_expr(a: Term, b: Term) -> Expr {
    Expr {
        kind: ExprKind::Eq(a, b),
        negated: false,
        with: Vec::new(),
        loc: Location::default(),
    }
}

/// A bare term expression.
pub fn term_expr(t: Term) -> Expr {
    Expr::term(t, Location::default())
}

/// A negated expression.
pub fn not_expr(mut e: Expr) -> Expr {
    e.negated = true;
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::RuleKind;

    #[test]
    fn test_complete_rule_builder() {
        let rule = complete_rule("allow", Term::boolean(true), Vec::new());
        assert_eq!(rule.kind(), RuleKind::Complete);
        assert!(rule.body.is_empty());
    }

    #[test]
    fn test_partial_set_rule_builder() {
        let rule = partial_set_rule("violations", Term::var("x"), Vec::new());
        assert_eq!(rule.kind(), RuleKind::PartialSet);
    }

    #[test]
    fn test_ref_term_shape() {
        let t = ref_term("data", &["servers"]);
        assert_eq!(t.ref_head(), Some("data"));
    }
}
