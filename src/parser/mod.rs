//! # Policy Parser
//!
//! Parses policy source text into AST modules. Handles packages,
//! imports, all rule head forms (complete, partial-set, partial-object,
//! function), `default` rules, `else` chains, rule bodies, terms
//! (refs, literals, comprehensions), infix operators with fixed
//! precedence, `some`/`every`/`in`, negation, and `with` modifiers.
//!
//! The parser never terminates early on an error: it records the error,
//! skips to the next top-level form, and keeps going, so a single pass
//! reports every problem in a file.

use crate::ast::{
    CompareOp, Expr, ExprKind, Head, Import, Location, Module, Query, Rule, Term, WithModifier,
};
use crate::lexer::{tokenize, Keyword, Token, TokenKind};
use crate::value::Value;
use std::fmt;

/// A parse error with its source location.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub loc: Location,
}

impl ParseError {
    fn new(message: impl Into<String>, loc: Location) -> Self {
        ParseError {
            message: message.into(),
            loc,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parse a module. All errors found in the source are returned together.
pub fn parse_module(source: &str) -> Result<Module, Vec<ParseError>> {
    let (tokens, lex_errors) = tokenize(source);
    let mut errors: Vec<ParseError> = lex_errors
        .into_iter()
        .map(|e| ParseError::new(e.message, e.loc))
        .collect();

    let mut parser = Parser::new(tokens);
    let module = parser.parse_module();
    errors.extend(parser.errors);

    match module {
        Some(module) if errors.is_empty() => Ok(module),
        _ => {
            if errors.is_empty() {
                errors.push(ParseError::new("empty module", Location::default()));
            }
            Err(errors)
        }
    }
}

/// Parse a query: one or more expressions separated by `;` or newlines.
pub fn parse_query(source: &str) -> Result<Query, Vec<ParseError>> {
    let (tokens, lex_errors) = tokenize(source);
    let mut errors: Vec<ParseError> = lex_errors
        .into_iter()
        .map(|e| ParseError::new(e.message, e.loc))
        .collect();

    let mut parser = Parser::new(tokens);
    let body = parser.parse_body(&[TokenKind::Eof]);
    parser.skip_separators();
    if !parser.at(&TokenKind::Eof) {
        let loc = parser.loc();
        let found = parser.peek_kind().clone();
        parser
            .errors
            .push(ParseError::new(format!("unexpected {found}"), loc));
    }
    errors.extend(parser.errors);

    if errors.is_empty() {
        Ok(Query { body })
    } else {
        Err(errors)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
    wildcards: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            errors: Vec::new(),
            wildcards: 0,
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn loc(&self) -> Location {
        self.tokens[self.pos.min(self.tokens.len() - 1)].loc
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek_kind(), TokenKind::Keyword(k) if *k == kw)
    }

    fn bump(&mut self) -> TokenKind {
        let kind = self.peek_kind().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> bool {
        if self.eat(kind) {
            true
        } else {
            let loc = self.loc();
            let found = self.peek_kind().clone();
            self.errors
                .push(ParseError::new(format!("expected {kind}, found {found}"), loc));
            false
        }
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let loc = self.loc();
        self.errors.push(ParseError::new(message, loc));
    }

    fn skip_newlines(&mut self) {
        while self.at(&TokenKind::Newline) {
            self.bump();
        }
    }

    fn skip_separators(&mut self) {
        while self.at(&TokenKind::Newline) || self.at(&TokenKind::Semicolon) {
            self.bump();
        }
    }

    /// Recover from a rule-level error: skip to the next newline at
    /// brace depth zero so the next top-level form parses cleanly.
    fn recover_to_top_level(&mut self) {
        let mut depth: i32 = 0;
        loop {
            match self.peek_kind() {
                TokenKind::Eof => return,
                TokenKind::LBrace | TokenKind::LBracket | TokenKind::LParen => {
                    depth += 1;
                    self.bump();
                }
                TokenKind::RBrace | TokenKind::RBracket | TokenKind::RParen => {
                    depth -= 1;
                    self.bump();
                }
                TokenKind::Newline if depth <= 0 => {
                    self.bump();
                    return;
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    fn fresh_wildcard_name(&mut self) -> String {
        let name = format!("$w{}", self.wildcards);
        self.wildcards += 1;
        name
    }

    fn fresh_wildcard(&mut self) -> Term {
        Term::var(self.fresh_wildcard_name())
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    fn parse_module(&mut self) -> Option<Module> {
        self.skip_newlines();
        if !self.eat_keyword(Keyword::Package) {
            self.error_here("expected 'package' declaration");
            return None;
        }
        let package = self.parse_package_path()?;
        self.skip_separators();

        let mut imports = Vec::new();
        while self.at_keyword(Keyword::Import) {
            if let Some(import) = self.parse_import() {
                imports.push(import);
            } else {
                self.recover_to_top_level();
            }
            self.skip_separators();
        }

        let mut rules = Vec::new();
        while !self.at(&TokenKind::Eof) {
            let before = self.errors.len();
            match self.parse_rule() {
                Some(rule) => rules.push(rule),
                None => {
                    if self.errors.len() == before {
                        self.error_here("expected rule");
                    }
                    self.recover_to_top_level();
                }
            }
            self.skip_separators();
        }

        Some(Module {
            package,
            imports,
            rules,
        })
    }

    /// `package a.b.c` - stored as the ref `data.a.b.c`.
    fn parse_package_path(&mut self) -> Option<Value> {
        let mut parts = vec![Value::var("data")];
        loop {
            match self.bump() {
                TokenKind::Ident(name) => parts.push(Value::String(name)),
                other => {
                    self.error_here(format!("expected package segment, found {other}"));
                    return None;
                }
            }
            if !self.eat(&TokenKind::Dot) {
                break;
            }
        }
        Some(Value::Ref(parts))
    }

    fn parse_import(&mut self) -> Option<Import> {
        let loc = self.loc();
        self.bump(); // 'import'
        let mut parts = Vec::new();
        match self.bump() {
            TokenKind::Ident(name) => parts.push(Value::var(name)),
            other => {
                self.error_here(format!("expected import path, found {other}"));
                return None;
            }
        }
        while self.eat(&TokenKind::Dot) {
            match self.bump() {
                TokenKind::Ident(name) => parts.push(Value::String(name)),
                other => {
                    self.error_here(format!("expected import segment, found {other}"));
                    return None;
                }
            }
        }
        let alias = if self.eat_keyword(Keyword::As) {
            match self.bump() {
                TokenKind::Ident(name) => Some(name),
                other => {
                    self.error_here(format!("expected import alias, found {other}"));
                    return None;
                }
            }
        } else {
            None
        };
        Some(Import {
            path: Value::Ref(parts),
            alias,
            loc,
        })
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    fn parse_rule(&mut self) -> Option<Rule> {
        let loc = self.loc();
        let is_default = self.eat_keyword(Keyword::Default);

        let name = match self.bump() {
            TokenKind::Ident(name) => name,
            other => {
                self.error_here(format!("expected rule name, found {other}"));
                return None;
            }
        };

        let mut head = Head {
            name,
            key: None,
            value: None,
            args: None,
            loc,
        };

        // Head suffixes: (args), [key], `contains key`.
        if self.eat(&TokenKind::LParen) {
            self.skip_newlines();
            let mut args = Vec::new();
            if !self.at(&TokenKind::RParen) {
                loop {
                    args.push(self.parse_term()?);
                    self.skip_newlines();
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                    self.skip_newlines();
                }
            }
            self.expect(&TokenKind::RParen);
            head.args = Some(args);
        } else if self.eat(&TokenKind::LBracket) {
            self.skip_newlines();
            let key = self.parse_term()?;
            self.skip_newlines();
            self.expect(&TokenKind::RBracket);
            head.key = Some(key);
        } else if self.eat_keyword(Keyword::Contains) {
            head.key = Some(self.parse_term()?);
        }

        // Optional value: `= term` or `:= term`.
        if self.eat(&TokenKind::Unify) || self.eat(&TokenKind::Assign) {
            head.value = Some(self.parse_term()?);
        }

        if is_default {
            if head.value.is_none() {
                self.error_here("default rule requires a value");
                return None;
            }
            return Some(Rule {
                head,
                body: Vec::new(),
                else_rule: None,
                is_default: true,
                loc,
            });
        }

        let body = self.parse_rule_body()?;
        let else_rule = self.parse_else_chain(&head)?;

        Some(Rule {
            head,
            body,
            else_rule,
            is_default: false,
            loc,
        })
    }

    /// Body forms: `{ ... }`, `if { ... }`, `if expr; expr`, or nothing
    /// (constant rule).
    fn parse_rule_body(&mut self) -> Option<Vec<Expr>> {
        let has_if = self.eat_keyword(Keyword::If);
        if self.eat(&TokenKind::LBrace) {
            let body = self.parse_body(&[TokenKind::RBrace]);
            self.skip_separators();
            self.expect(&TokenKind::RBrace);
            return Some(body);
        }
        if has_if {
            // Single-line body: expressions separated by ';' to the
            // end of the line.
            let mut body = Vec::new();
            loop {
                body.push(self.parse_expr()?);
                if !self.eat(&TokenKind::Semicolon) {
                    break;
                }
            }
            return Some(body);
        }
        Some(Vec::new())
    }

    fn parse_else_chain(&mut self, head: &Head) -> Option<Option<Box<Rule>>> {
        // `else` may appear after a newline.
        let save = self.pos;
        self.skip_newlines();
        if !self.eat_keyword(Keyword::Else) {
            self.pos = save;
            return Some(None);
        }
        let loc = self.loc();
        let mut else_head = Head {
            name: head.name.clone(),
            key: None,
            value: None,
            args: head.args.clone(),
            loc,
        };
        if self.eat(&TokenKind::Unify) || self.eat(&TokenKind::Assign) {
            else_head.value = Some(self.parse_term()?);
        }
        let body = self.parse_rule_body()?;
        let else_rule = self.parse_else_chain(head)?;
        Some(Some(Box::new(Rule {
            head: else_head,
            body,
            else_rule,
            is_default: false,
            loc,
        })))
    }

    // ------------------------------------------------------------------
    // Bodies and expressions
    // ------------------------------------------------------------------

    /// Parse expressions separated by newlines or semicolons until one
    /// of `stop` (not consumed).
    fn parse_body(&mut self, stop: &[TokenKind]) -> Vec<Expr> {
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            if stop.iter().any(|k| self.at(k)) || self.at(&TokenKind::Eof) {
                break;
            }
            let before = self.errors.len();
            match self.parse_expr() {
                Some(expr) => body.push(expr),
                None => {
                    if self.errors.len() == before {
                        self.error_here("expected expression");
                    }
                    // Skip to the next separator inside the body.
                    while !self.at(&TokenKind::Newline)
                        && !self.at(&TokenKind::Semicolon)
                        && !self.at(&TokenKind::Eof)
                        && !stop.iter().any(|k| self.at(k))
                    {
                        self.bump();
                    }
                }
            }
        }
        body
    }

    fn parse_expr(&mut self) -> Option<Expr> {
        let loc = self.loc();

        if self.eat_keyword(Keyword::Not) {
            let mut inner = self.parse_expr()?;
            inner.negated = !inner.negated;
            inner.loc = loc;
            return Some(inner);
        }

        if self.at_keyword(Keyword::Some) {
            return self.parse_some(loc);
        }

        if self.at_keyword(Keyword::Every) {
            return self.parse_every(loc);
        }

        // Parenthesized expression: `("admin" in input.roles)`. Try it;
        // fall back to term parsing when the parens wrap a plain term.
        if self.at(&TokenKind::LParen) {
            let save = self.pos;
            let err_save = self.errors.len();
            self.bump();
            self.skip_newlines();
            if let Some(inner) = self.parse_expr() {
                self.skip_newlines();
                if self.eat(&TokenKind::RParen)
                    && !matches!(inner.kind, ExprKind::Term(_))
                    && !self.at_operator()
                {
                    let with = self.parse_with_modifiers()?;
                    let mut expr = inner;
                    expr.with = with;
                    return Some(expr);
                }
            }
            self.pos = save;
            self.errors.truncate(err_save);
        }

        let lhs = self.parse_term()?;

        let kind = match self.peek_kind().clone() {
            TokenKind::Unify => {
                self.bump();
                ExprKind::Eq(lhs, self.parse_term()?)
            }
            TokenKind::Assign => {
                self.bump();
                ExprKind::Assign(lhs, self.parse_term()?)
            }
            TokenKind::EqEq => {
                self.bump();
                ExprKind::Comparison(CompareOp::Eq, lhs, self.parse_term()?)
            }
            TokenKind::Neq => {
                self.bump();
                ExprKind::Comparison(CompareOp::Neq, lhs, self.parse_term()?)
            }
            TokenKind::Lt => {
                self.bump();
                ExprKind::Comparison(CompareOp::Lt, lhs, self.parse_term()?)
            }
            TokenKind::Lte => {
                self.bump();
                ExprKind::Comparison(CompareOp::Lte, lhs, self.parse_term()?)
            }
            TokenKind::Gt => {
                self.bump();
                ExprKind::Comparison(CompareOp::Gt, lhs, self.parse_term()?)
            }
            TokenKind::Gte => {
                self.bump();
                ExprKind::Comparison(CompareOp::Gte, lhs, self.parse_term()?)
            }
            TokenKind::Keyword(Keyword::In) => {
                self.bump();
                ExprKind::In {
                    key: None,
                    value: lhs,
                    collection: self.parse_term()?,
                }
            }
            TokenKind::Comma => {
                // `k, v in coll` membership with key.
                self.bump();
                let value = self.parse_term()?;
                if !self.eat_keyword(Keyword::In) {
                    self.error_here("expected 'in' after key-value pair");
                    return None;
                }
                ExprKind::In {
                    key: Some(lhs),
                    value,
                    collection: self.parse_term()?,
                }
            }
            _ => ExprKind::Term(lhs),
        };

        let with = self.parse_with_modifiers()?;
        Some(Expr {
            kind,
            negated: false,
            with,
            loc,
        })
    }

    fn at_operator(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Unify
                | TokenKind::Assign
                | TokenKind::EqEq
                | TokenKind::Neq
                | TokenKind::Lt
                | TokenKind::Lte
                | TokenKind::Gt
                | TokenKind::Gte
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::Percent
        )
    }

    fn parse_some(&mut self, loc: Location) -> Option<Expr> {
        self.bump(); // 'some'
        let mut names = Vec::new();
        loop {
            match self.bump() {
                TokenKind::Ident(name) if name == "_" => {
                    let fresh = self.fresh_wildcard_name();
                    names.push(fresh);
                }
                TokenKind::Ident(name) => names.push(name),
                other => {
                    self.error_here(format!("expected variable after 'some', found {other}"));
                    return None;
                }
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        if self.eat_keyword(Keyword::In) {
            let collection = self.parse_term()?;
            let (key, value) = match names.len() {
                1 => (None, Term::var(names.remove(0))),
                2 => {
                    let k = names.remove(0);
                    let v = names.remove(0);
                    (Some(Term::var(k)), Term::var(v))
                }
                _ => {
                    self.error_here("'some ... in' takes one or two variables");
                    return None;
                }
            };
            let with = self.parse_with_modifiers()?;
            return Some(Expr {
                kind: ExprKind::In {
                    key,
                    value,
                    collection,
                },
                negated: false,
                with,
                loc,
            });
        }
        Some(Expr {
            kind: ExprKind::SomeDecl(names),
            negated: false,
            with: Vec::new(),
            loc,
        })
    }

    fn parse_every(&mut self, loc: Location) -> Option<Expr> {
        self.bump(); // 'every'
        let first = match self.bump() {
            TokenKind::Ident(name) if name == "_" => self.fresh_wildcard_name(),
            TokenKind::Ident(name) => name,
            other => {
                self.error_here(format!("expected variable after 'every', found {other}"));
                return None;
            }
        };
        let (key, value) = if self.eat(&TokenKind::Comma) {
            match self.bump() {
                TokenKind::Ident(second) => (Some(first), second),
                other => {
                    self.error_here(format!("expected variable, found {other}"));
                    return None;
                }
            }
        } else {
            (None, first)
        };
        if !self.eat_keyword(Keyword::In) {
            self.error_here("expected 'in' in 'every' expression");
            return None;
        }
        let domain = self.parse_term()?;
        self.skip_newlines();
        if !self.expect(&TokenKind::LBrace) {
            return None;
        }
        let body = self.parse_body(&[TokenKind::RBrace]);
        self.skip_separators();
        self.expect(&TokenKind::RBrace);
        Some(Expr {
            kind: ExprKind::Every {
                key,
                value,
                domain,
                body,
            },
            negated: false,
            with: Vec::new(),
            loc,
        })
    }

    fn parse_with_modifiers(&mut self) -> Option<Vec<WithModifier>> {
        let mut mods = Vec::new();
        while self.at_keyword(Keyword::With) {
            let loc = self.loc();
            self.bump();
            let target = self.parse_term()?;
            if !self.eat_keyword(Keyword::As) {
                self.error_here("expected 'as' in with modifier");
                return None;
            }
            let value = self.parse_term()?;
            mods.push(WithModifier { target, value, loc });
        }
        Some(mods)
    }

    // ------------------------------------------------------------------
    // Terms, precedence climbing
    // ------------------------------------------------------------------

    fn parse_term(&mut self) -> Option<Term> {
        self.parse_additive()
    }

    fn parse_additive(&mut self) -> Option<Term> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let name = match self.peek_kind() {
                TokenKind::Plus => "plus",
                TokenKind::Minus => "minus",
                _ => break,
            };
            let loc = self.loc();
            self.bump();
            self.skip_newlines();
            let rhs = self.parse_multiplicative()?;
            lhs = Term::Call(name.to_string(), vec![lhs, rhs], loc);
        }
        Some(lhs)
    }

    fn parse_multiplicative(&mut self) -> Option<Term> {
        let mut lhs = self.parse_unary()?;
        loop {
            let name = match self.peek_kind() {
                TokenKind::Star => "mul",
                TokenKind::Slash => "div",
                TokenKind::Percent => "rem",
                _ => break,
            };
            let loc = self.loc();
            self.bump();
            self.skip_newlines();
            let rhs = self.parse_unary()?;
            lhs = Term::Call(name.to_string(), vec![lhs, rhs], loc);
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Term> {
        if self.at(&TokenKind::Minus) {
            let loc = self.loc();
            self.bump();
            let operand = self.parse_unary()?;
            // Fold negative number literals; otherwise 0 - x.
            if let Term::Value(Value::Number(n)) = &operand {
                return Some(Term::Value(Value::Number(n.neg())));
            }
            return Some(Term::Call(
                "minus".to_string(),
                vec![Term::number(0), operand],
                loc,
            ));
        }
        self.parse_postfix()
    }

    /// Postfix operators: `.field`, `[index]`, and call parentheses.
    fn parse_postfix(&mut self) -> Option<Term> {
        let mut base = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.bump();
                    let segment = match self.bump() {
                        TokenKind::Ident(name) => Term::string(name),
                        // Keywords may follow a dot in refs (`x.not` is
                        // unusual but legal data access).
                        TokenKind::Keyword(kw) => Term::string(kw.text()),
                        other => {
                            self.error_here(format!("expected field name, found {other}"));
                            return None;
                        }
                    };
                    base = extend_ref(base, segment);
                }
                TokenKind::LBracket => {
                    self.bump();
                    self.skip_newlines();
                    let is_wildcard =
                        matches!(self.peek_kind(), TokenKind::Ident(name) if name == "_");
                    let index = if is_wildcard {
                        self.bump();
                        self.fresh_wildcard()
                    } else {
                        self.parse_term()?
                    };
                    self.skip_newlines();
                    self.expect(&TokenKind::RBracket);
                    base = extend_ref(base, index);
                }
                TokenKind::LParen => {
                    // A call: the base must name a function or built-in.
                    let loc = self.loc();
                    let name = match callable_name(&base) {
                        Some(name) => name,
                        None => {
                            self.error_here("expression is not callable");
                            return None;
                        }
                    };
                    self.bump();
                    self.skip_newlines();
                    let mut args = Vec::new();
                    if !self.at(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_term()?);
                            self.skip_newlines();
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                            self.skip_newlines();
                        }
                    }
                    self.expect(&TokenKind::RParen);
                    // `set()` is the empty-set constructor.
                    if name == "set" && args.is_empty() {
                        base = Term::Value(Value::empty_set());
                    } else {
                        base = Term::Call(name, args, loc);
                    }
                }
                _ => break,
            }
        }
        Some(base)
    }

    fn parse_primary(&mut self) -> Option<Term> {
        let loc = self.loc();
        match self.bump() {
            TokenKind::Number(n) => Some(Term::Value(Value::Number(n))),
            TokenKind::String(s) => Some(Term::Value(Value::String(s))),
            TokenKind::Keyword(Keyword::True) => Some(Term::boolean(true)),
            TokenKind::Keyword(Keyword::False) => Some(Term::boolean(false)),
            TokenKind::Keyword(Keyword::Null) => Some(Term::Value(Value::Null)),
            TokenKind::Ident(name) => {
                if name == "_" {
                    Some(self.fresh_wildcard())
                } else {
                    Some(Term::var(name))
                }
            }
            TokenKind::LParen => {
                self.skip_newlines();
                let inner = self.parse_term()?;
                self.skip_newlines();
                self.expect(&TokenKind::RParen);
                Some(inner)
            }
            TokenKind::LBracket => self.parse_array_or_compr(),
            TokenKind::LBrace => self.parse_brace_term(),
            other => {
                self.errors
                    .push(ParseError::new(format!("unexpected {other}"), loc));
                None
            }
        }
    }

    /// After `[`: an array literal or an array comprehension.
    fn parse_array_or_compr(&mut self) -> Option<Term> {
        self.skip_newlines();
        if self.eat(&TokenKind::RBracket) {
            return Some(Term::Array(Vec::new()));
        }
        let first = self.parse_term()?;
        self.skip_newlines();
        if self.eat(&TokenKind::Pipe) {
            let body = self.parse_body(&[TokenKind::RBracket]);
            self.skip_separators();
            self.expect(&TokenKind::RBracket);
            return Some(Term::ArrayCompr {
                term: Box::new(first),
                body,
            });
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            self.skip_newlines();
            if self.at(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_term()?);
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBracket);
        Some(Term::Array(items))
    }

    /// After `{`: an object literal, set literal, or comprehension.
    fn parse_brace_term(&mut self) -> Option<Term> {
        self.skip_newlines();
        if self.eat(&TokenKind::RBrace) {
            return Some(Term::Object(Vec::new()));
        }
        let first = self.parse_term()?;
        self.skip_newlines();

        if self.eat(&TokenKind::Colon) {
            self.skip_newlines();
            let value = self.parse_term()?;
            self.skip_newlines();
            if self.eat(&TokenKind::Pipe) {
                let body = self.parse_body(&[TokenKind::RBrace]);
                self.skip_separators();
                self.expect(&TokenKind::RBrace);
                return Some(Term::ObjectCompr {
                    key: Box::new(first),
                    value: Box::new(value),
                    body,
                });
            }
            let mut pairs = vec![(first, value)];
            while self.eat(&TokenKind::Comma) {
                self.skip_newlines();
                if self.at(&TokenKind::RBrace) {
                    break;
                }
                let k = self.parse_term()?;
                self.skip_newlines();
                self.expect(&TokenKind::Colon);
                self.skip_newlines();
                let v = self.parse_term()?;
                pairs.push((k, v));
                self.skip_newlines();
            }
            self.expect(&TokenKind::RBrace);
            return Some(Term::Object(pairs));
        }

        if self.eat(&TokenKind::Pipe) {
            let body = self.parse_body(&[TokenKind::RBrace]);
            self.skip_separators();
            self.expect(&TokenKind::RBrace);
            return Some(Term::SetCompr {
                term: Box::new(first),
                body,
            });
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            self.skip_newlines();
            if self.at(&TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_term()?);
            self.skip_newlines();
        }
        self.expect(&TokenKind::RBrace);
        Some(Term::Set(items))
    }
}

/// Append a segment to a term, producing or extending a ref.
fn extend_ref(base: Term, segment: Term) -> Term {
    match base {
        Term::Ref(mut parts) => {
            parts.push(segment);
            Term::Ref(parts)
        }
        other => Term::Ref(vec![other, segment]),
    }
}

/// Dotted name for a call target: a plain var (`count`) or a ref with
/// static string segments (`time.now_ns`, `io.jwt.decode`).
fn callable_name(term: &Term) -> Option<String> {
    match term {
        Term::Value(Value::Var(name)) => Some(name.clone()),
        Term::Ref(parts) => {
            let mut segments = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                match part {
                    Term::Value(Value::Var(name)) if i == 0 => segments.push(name.clone()),
                    Term::Value(Value::String(s)) if i > 0 => segments.push(s.clone()),
                    _ => return None,
                }
            }
            Some(segments.join("."))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::RuleKind;

    fn module(source: &str) -> Module {
        parse_module(source).unwrap_or_else(|e| panic!("parse failed: {e:?}"))
    }

    #[test]
    fn test_simple_allow_rule() {
        let m = module("package p\n\nallow = true { input.user == \"alice\" }\n");
        assert_eq!(m.package_path(), vec!["p"]);
        assert_eq!(m.rules.len(), 1);
        assert_eq!(m.rules[0].kind(), RuleKind::Complete);
        assert_eq!(m.rules[0].body.len(), 1);
    }

    #[test]
    fn test_if_syntax() {
        let m = module("package p\n\nallow if input.admin\n");
        assert_eq!(m.rules[0].kind(), RuleKind::Complete);
        assert_eq!(m.rules[0].body.len(), 1);
    }

    #[test]
    fn test_partial_set_rule() {
        let m = module(
            "package p\n\nviolations[s] {\n    s := data.servers[_]\n    s.protocols[_] == \"http\"\n}\n",
        );
        assert_eq!(m.rules[0].kind(), RuleKind::PartialSet);
        assert_eq!(m.rules[0].body.len(), 2);
    }

    #[test]
    fn test_contains_syntax() {
        let m = module("package p\n\ndeny contains msg if msg := \"bad\"\n");
        assert_eq!(m.rules[0].kind(), RuleKind::PartialSet);
    }

    #[test]
    fn test_partial_object_rule() {
        let m = module("package p\n\nports[name] = n { name := \"http\"; n := 80 }\n");
        assert_eq!(m.rules[0].kind(), RuleKind::PartialObject);
    }

    #[test]
    fn test_function_rule_with_default() {
        let m = module("package p\n\ndefault score(_) = 0\nscore(u) = 10 { u.vip }\n");
        assert_eq!(m.rules.len(), 2);
        assert!(m.rules[0].is_default);
        assert_eq!(m.rules[0].kind(), RuleKind::Function);
        assert_eq!(m.rules[1].kind(), RuleKind::Function);
    }

    #[test]
    fn test_else_chain() {
        let m = module(
            "package p\n\nq = 1 { input.a } else = 2 { input.b } else = 3 { true }\n",
        );
        let rule = &m.rules[0];
        let e1 = rule.else_rule.as_ref().expect("first else");
        let e2 = e1.else_rule.as_ref().expect("second else");
        assert!(e2.else_rule.is_none());
    }

    #[test]
    fn test_negation_and_membership() {
        let m = module("package p\n\ndeny if not (\"admin\" in input.roles)\n");
        let expr = &m.rules[0].body[0];
        assert!(expr.negated);
        assert!(matches!(expr.kind, ExprKind::In { .. }));
    }

    #[test]
    fn test_some_in() {
        let m = module("package p\n\nq { some x in input.xs; x > 1 }\n");
        assert!(matches!(m.rules[0].body[0].kind, ExprKind::In { .. }));
    }

    #[test]
    fn test_every() {
        let m = module("package p\n\nq if every x in input.xs { x > 0 }\n");
        assert!(matches!(m.rules[0].body[0].kind, ExprKind::Every { .. }));
    }

    #[test]
    fn test_with_modifier() {
        let m = module("package p\n\nq { data.p.allow with input as {\"user\": \"bob\"} }\n");
        assert_eq!(m.rules[0].body[0].with.len(), 1);
    }

    #[test]
    fn test_comprehensions() {
        let m = module(
            "package p\n\nxs = [x | x := input.items[_]]\nys = {x | input.items[x]}\nzs = {k: v | k := \"a\"; v := 1}\n",
        );
        assert!(matches!(
            m.rules[0].head.value,
            Some(Term::ArrayCompr { .. })
        ));
        assert!(matches!(m.rules[1].head.value, Some(Term::SetCompr { .. })));
        assert!(matches!(
            m.rules[2].head.value,
            Some(Term::ObjectCompr { .. })
        ));
    }

    #[test]
    fn test_arithmetic_precedence() {
        let m = module("package p\n\nq = x { x := 1 + 2 * 3 }\n");
        // 1 + (2 * 3)
        match &m.rules[0].body[0].kind {
            ExprKind::Assign(_, Term::Call(name, args, _)) => {
                assert_eq!(name, "plus");
                assert!(matches!(&args[1], Term::Call(n, _, _) if n == "mul"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dotted_builtin_call() {
        let m = module("package p\n\nq = t { t := time.now_ns() }\n");
        match &m.rules[0].body[0].kind {
            ExprKind::Assign(_, Term::Call(name, _, _)) => assert_eq!(name, "time.now_ns"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_imports() {
        let m = module("package p\n\nimport data.servers as s\nimport input.user\n\nq { s }\n");
        assert_eq!(m.imports.len(), 2);
        assert_eq!(m.imports[0].name(), Some("s".to_string()));
        assert_eq!(m.imports[1].name(), Some("user".to_string()));
    }

    #[test]
    fn test_error_recovery_reports_all_errors() {
        let result = parse_module("package p\n\nq = { broken\nr = 1 { true }\nw = = 2\n");
        let errors = result.expect_err("should fail");
        assert!(errors.len() >= 2, "expected multiple errors: {errors:?}");
    }

    #[test]
    fn test_parse_query() {
        let q = parse_query("data.p.allow == true").unwrap();
        assert_eq!(q.body.len(), 1);
    }

    #[test]
    fn test_wildcards_are_unique() {
        let m = module("package p\n\nq { input.a[_] == input.b[_] }\n");
        let mut vars = std::collections::BTreeSet::new();
        m.rules[0].body[0].collect_vars(&mut vars);
        let wildcards: Vec<_> = vars.iter().filter(|v| v.starts_with("$w")).collect();
        assert_eq!(wildcards.len(), 2);
    }

    #[test]
    fn test_round_trip_canonical_form() {
        let src = "package p\n\nallow = true { input.user == \"alice\" }\n";
        let m1 = module(src);
        let printed = m1.to_string();
        let m2 = module(&printed);
        assert_eq!(m1, m2);
    }
}
