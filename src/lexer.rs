//! # Lexer
//!
//! Turns policy source text into a token stream with source locations.
//! Handles identifiers, keywords, numbers (integer/decimal/scientific),
//! escaped strings, raw backtick strings, punctuation, and `#` comments.
//!
//! Newlines are significant (they separate expressions in rule bodies)
//! and are emitted as tokens; runs of blank lines collapse to one.

use crate::ast::Location;
use crate::value::Number;
use std::fmt;
use std::str::FromStr;

/// Reserved words of the rule language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Package,
    Import,
    As,
    Not,
    With,
    Default,
    Else,
    Some,
    In,
    If,
    Contains,
    Every,
    True,
    False,
    Null,
}

impl Keyword {
    fn from_ident(s: &str) -> Option<Keyword> {
        match s {
            "package" => Some(Keyword::Package),
            "import" => Some(Keyword::Import),
            "as" => Some(Keyword::As),
            "not" => Some(Keyword::Not),
            "with" => Some(Keyword::With),
            "default" => Some(Keyword::Default),
            "else" => Some(Keyword::Else),
            "some" => Some(Keyword::Some),
            "in" => Some(Keyword::In),
            "if" => Some(Keyword::If),
            "contains" => Some(Keyword::Contains),
            "every" => Some(Keyword::Every),
            "true" => Some(Keyword::True),
            "false" => Some(Keyword::False),
            "null" => Some(Keyword::Null),
            _ => None,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Keyword::Package => "package",
            Keyword::Import => "import",
            Keyword::As => "as",
            Keyword::Not => "not",
            Keyword::With => "with",
            Keyword::Default => "default",
            Keyword::Else => "else",
            Keyword::Some => "some",
            Keyword::In => "in",
            Keyword::If => "if",
            Keyword::Contains => "contains",
            Keyword::Every => "every",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::Null => "null",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Keyword(Keyword),
    Number(Number),
    String(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    /// `:=`
    Assign,
    /// `=`
    Unify,
    EqEq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pipe,
    Newline,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "identifier '{s}'"),
            TokenKind::Keyword(k) => write!(f, "'{}'", k.text()),
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::String(s) => write!(f, "string {s:?}"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::LBracket => write!(f, "'['"),
            TokenKind::RBracket => write!(f, "']'"),
            TokenKind::LBrace => write!(f, "'{{'"),
            TokenKind::RBrace => write!(f, "'}}'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Colon => write!(f, "':'"),
            TokenKind::Semicolon => write!(f, "';'"),
            TokenKind::Dot => write!(f, "'.'"),
            TokenKind::Assign => write!(f, "':='"),
            TokenKind::Unify => write!(f, "'='"),
            TokenKind::EqEq => write!(f, "'=='"),
            TokenKind::Neq => write!(f, "'!='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::Lte => write!(f, "'<='"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::Gte => write!(f, "'>='"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::Percent => write!(f, "'%'"),
            TokenKind::Pipe => write!(f, "'|'"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

/// A lexical error with its location.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub loc: Location,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.message)
    }
}

/// Tokenize `source`. Errors do not stop the lexer; the offending
/// character is skipped and lexing continues so the parser can recover
/// at the next top-level form.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
    errors: Vec<LexError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            col: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn loc(&self) -> Location {
        Location::new(self.line, self.col)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn push(&mut self, kind: TokenKind, loc: Location) {
        self.tokens.push(Token { kind, loc });
    }

    fn error(&mut self, message: impl Into<String>, loc: Location) {
        self.errors.push(LexError {
            message: message.into(),
            loc,
        });
    }

    fn run(mut self) -> (Vec<Token>, Vec<LexError>) {
        while let Some(c) = self.peek() {
            let loc = self.loc();
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    // Collapse runs of newlines into one separator.
                    if !matches!(
                        self.tokens.last().map(|t| &t.kind),
                        Some(TokenKind::Newline) | None
                    ) {
                        self.push(TokenKind::Newline, loc);
                    }
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '"' => self.lex_string(loc),
                '`' => self.lex_raw_string(loc),
                c if c.is_ascii_digit() => self.lex_number(loc),
                c if c.is_ascii_alphabetic() || c == '_' => self.lex_ident(loc),
                _ => self.lex_punct(loc),
            }
        }
        let loc = self.loc();
        self.push(TokenKind::Eof, loc);
        (self.tokens, self.errors)
    }

    fn lex_ident(&mut self, loc: Location) {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match Keyword::from_ident(&ident) {
            Some(kw) => self.push(TokenKind::Keyword(kw), loc),
            None => self.push(TokenKind::Ident(ident), loc),
        }
    }

    fn lex_number(&mut self, loc: Location) {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') {
            // A dot only continues the number if a digit follows;
            // otherwise it is a ref separator (`x[1].y`).
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if lookahead.peek().is_some_and(|c| c.is_ascii_digit()) {
                text.push('.');
                self.bump();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            text.push('e');
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                text.push(self.bump().unwrap_or('+'));
            }
            let mut saw_digit = false;
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                    saw_digit = true;
                } else {
                    break;
                }
            }
            if !saw_digit {
                self.error("malformed exponent in number literal", loc);
                return;
            }
        }
        match Number::from_str(&text) {
            Ok(n) => self.push(TokenKind::Number(n), loc),
            Err(_) => self.error(format!("invalid number literal '{text}'"), loc),
        }
    }

    fn lex_string(&mut self, loc: Location) {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    self.error("unterminated string literal", loc);
                    return;
                }
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some('/') => text.push('/'),
                    Some('u') => {
                        let mut code = String::new();
                        for _ in 0..4 {
                            match self.bump() {
                                Some(c) if c.is_ascii_hexdigit() => code.push(c),
                                _ => {
                                    self.error("malformed \\u escape", loc);
                                    return;
                                }
                            }
                        }
                        match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                            Some(c) => text.push(c),
                            None => {
                                self.error("invalid \\u escape", loc);
                                return;
                            }
                        }
                    }
                    Some(other) => {
                        self.error(format!("unknown escape '\\{other}'"), loc);
                        return;
                    }
                    None => {
                        self.error("unterminated string literal", loc);
                        return;
                    }
                },
                Some(c) => text.push(c),
            }
        }
        self.push(TokenKind::String(text), loc);
    }

    /// Raw strings: backtick-delimited, no escapes, may span lines.
    fn lex_raw_string(&mut self, loc: Location) {
        self.bump(); // opening backtick
        let mut text = String::new();
        loop {
            match self.bump() {
                None => {
                    self.error("unterminated raw string literal", loc);
                    return;
                }
                Some('`') => break,
                Some(c) => text.push(c),
            }
        }
        self.push(TokenKind::String(text), loc);
    }

    fn lex_punct(&mut self, loc: Location) {
        let c = match self.bump() {
            Some(c) => c,
            None => return,
        };
        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '|' => TokenKind::Pipe,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            ':' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Assign
                } else {
                    TokenKind::Colon
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::EqEq
                } else {
                    TokenKind::Unify
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Neq
                } else {
                    self.error("unexpected character '!'", loc);
                    return;
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Lte
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Gte
                } else {
                    TokenKind::Gt
                }
            }
            other => {
                self.error(format!("unexpected character '{other}'"), loc);
                return;
            }
        };
        self.push(kind, loc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = tokenize(source);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        let toks = kinds("package p");
        assert_eq!(
            toks,
            vec![
                TokenKind::Keyword(Keyword::Package),
                TokenKind::Ident("p".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let toks = kinds("1 2.5 3e10 4.2e-1");
        assert!(matches!(toks[0], TokenKind::Number(_)));
        assert!(matches!(toks[3], TokenKind::Number(_)));
        assert_eq!(toks.len(), 5);
    }

    #[test]
    fn test_number_followed_by_dot_segment() {
        // `servers[0].id` - the dot belongs to the ref, not the number
        let toks = kinds("x[0].id");
        assert!(toks.contains(&TokenKind::Dot));
    }

    #[test]
    fn test_string_escapes() {
        let toks = kinds(r#""a\nbA""#);
        assert_eq!(toks[0], TokenKind::String("a\nbA".into()));
    }

    #[test]
    fn test_raw_string() {
        let toks = kinds("`no \\escapes`");
        assert_eq!(toks[0], TokenKind::String("no \\escapes".into()));
    }

    #[test]
    fn test_operators() {
        let toks = kinds(":= = == != <= >=");
        assert_eq!(
            toks,
            vec![
                TokenKind::Assign,
                TokenKind::Unify,
                TokenKind::EqEq,
                TokenKind::Neq,
                TokenKind::Lte,
                TokenKind::Gte,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_stripped() {
        let toks = kinds("a # comment here\nb");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Newline,
                TokenKind::Ident("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_collapse() {
        let toks = kinds("a\n\n\nb");
        let newlines = toks
            .iter()
            .filter(|t| matches!(t, TokenKind::Newline))
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_unterminated_string_reports_error() {
        let (_, errors) = tokenize("\"oops");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unterminated"));
    }

    #[test]
    fn test_locations() {
        let (tokens, _) = tokenize("a\n  b");
        assert_eq!(tokens[0].loc.line, 1);
        let b = &tokens[2];
        assert_eq!(b.loc.line, 2);
        assert_eq!(b.loc.col, 3);
    }
}
