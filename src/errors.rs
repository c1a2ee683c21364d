//! Crate-level error taxonomy.
//!
//! Every failure carries a stable category code (`parse`,
//! `compile/...`, `eval/...`, `storage/...`, `plugin/transport`), a
//! human message, and source locations where they exist. Decision
//! requests surface these codes to callers; the process keeps serving.

use crate::compiler::CompileError;
use crate::eval::EvalError;
use crate::parser::ParseError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed source text; all errors from one parse are kept.
    #[error("parse error: {}", format_parse_errors(.0))]
    Parse(Vec<ParseError>),

    /// Compilation failed; the previous policy stays active.
    #[error("compile error: {}", format_compile_errors(.0))]
    Compile(Vec<CompileError>),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bundle(#[from] crate::bundle::BundleError),

    /// Network, auth, or upstream failure during plugin work.
    #[error("plugin/transport: {0}")]
    Transport(String),

    /// Invalid configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The error-taxonomy code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse",
            Error::Compile(errors) => errors.first().map_or("compile/type", |e| e.code),
            Error::Eval(e) => e.code(),
            Error::Storage(e) => e.code(),
            Error::Bundle(_) => "plugin/transport",
            Error::Transport(_) => "plugin/transport",
            Error::Config(_) => "config",
        }
    }
}

impl From<Vec<ParseError>> for Error {
    fn from(errors: Vec<ParseError>) -> Self {
        Error::Parse(errors)
    }
}

impl From<Vec<CompileError>> for Error {
    fn from(errors: Vec<CompileError>) -> Self {
        Error::Compile(errors)
    }
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;

    #[test]
    fn test_codes() {
        let parse = Error::Parse(vec![ParseError {
            message: "oops".to_string(),
            loc: Location::new(1, 2),
        }]);
        assert_eq!(parse.code(), "parse");

        let eval = Error::Eval(EvalError::Conflict("two values".to_string()));
        assert_eq!(eval.code(), "eval/conflict");

        let storage = Error::Storage(StorageError::NotFound("x".to_string()));
        assert_eq!(storage.code(), "storage/not-found");
    }

    #[test]
    fn test_display_collects_parse_errors() {
        let err = Error::Parse(vec![
            ParseError {
                message: "first".to_string(),
                loc: Location::new(1, 1),
            },
            ParseError {
                message: "second".to_string(),
                loc: Location::new(2, 1),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }
}
