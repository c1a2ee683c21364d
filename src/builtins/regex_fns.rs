//! Regular-expression built-ins, backed by the `regex` crate.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::{Number, Value};
use regex::Regex;

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure(
            "regex.match",
            sig(&[Type::String, Type::String], Type::Boolean),
            regex_match,
        ),
        Builtin::pure(
            "regex.is_valid",
            sig(&[Type::String], Type::Boolean),
            regex_is_valid,
        ),
        Builtin::pure(
            "regex.split",
            sig(&[Type::String, Type::String], Type::Array),
            regex_split,
        ),
        Builtin::pure(
            "regex.find_n",
            sig(&[Type::String, Type::String, Type::Number], Type::Array),
            regex_find_n,
        ),
    ]
}

fn compile(pattern: &Value) -> Result<Regex, BuiltinError> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| err("regex: pattern must be a string"))?;
    Regex::new(pattern).map_err(|e| err(format!("regex: invalid pattern: {e}")))
}

fn regex_match(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let re = compile(args.first().unwrap_or(&Value::Null))?;
    let s = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| err("regex.match: value must be a string"))?;
    Ok(Value::Bool(re.is_match(s)))
}

fn regex_is_valid(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let pattern = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| err("regex.is_valid: pattern must be a string"))?;
    Ok(Value::Bool(Regex::new(pattern).is_ok()))
}

fn regex_split(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let re = compile(args.first().unwrap_or(&Value::Null))?;
    let s = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| err("regex.split: value must be a string"))?;
    Ok(Value::Array(re.split(s).map(Value::string).collect()))
}

/// First `n` matches (all matches when `n` is negative).
fn regex_find_n(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let re = compile(args.first().unwrap_or(&Value::Null))?;
    let s = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| err("regex.find_n: value must be a string"))?;
    let n = args
        .get(2)
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("regex.find_n: count must be an integer"))?;
    let limit = if n < 0 { usize::MAX } else { n as usize };
    Ok(Value::Array(
        re.find_iter(s)
            .take(limit)
            .map(|m| Value::string(m.as_str()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_match() {
        assert_eq!(
            call("regex.match", &[Value::string("^a+$"), Value::string("aaa")]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call("regex.match", &[Value::string("^a+$"), Value::string("b")]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_invalid_pattern_errors() {
        assert!(call("regex.match", &[Value::string("("), Value::string("x")]).is_err());
        assert_eq!(
            call("regex.is_valid", &[Value::string("(")]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_find_n() {
        let out = call(
            "regex.find_n",
            &[Value::string("[0-9]+"), Value::string("a1b22c333"), Value::number(2)],
        )
        .unwrap();
        assert_eq!(
            out,
            Value::Array(vec![Value::string("1"), Value::string("22")])
        );
    }

    #[test]
    fn test_split() {
        let out = call(
            "regex.split",
            &[Value::string("[,;]"), Value::string("a,b;c")],
        )
        .unwrap();
        assert_eq!(
            out,
            Value::Array(vec![
                Value::string("a"),
                Value::string("b"),
                Value::string("c")
            ])
        );
    }
}
