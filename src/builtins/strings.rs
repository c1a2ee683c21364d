//! String built-ins.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::{Number, Value};

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure(
            "concat",
            sig(&[Type::String, Type::Collection], Type::String),
            concat,
        ),
        Builtin::pure(
            "contains",
            sig(&[Type::String, Type::String], Type::Boolean),
            contains,
        ),
        Builtin::pure(
            "startswith",
            sig(&[Type::String, Type::String], Type::Boolean),
            startswith,
        ),
        Builtin::pure(
            "endswith",
            sig(&[Type::String, Type::String], Type::Boolean),
            endswith,
        ),
        Builtin::pure("lower", sig(&[Type::String], Type::String), lower),
        Builtin::pure("upper", sig(&[Type::String], Type::String), upper),
        Builtin::pure(
            "replace",
            sig(&[Type::String, Type::String, Type::String], Type::String),
            replace,
        ),
        Builtin::pure(
            "split",
            sig(&[Type::String, Type::String], Type::Array),
            split,
        ),
        Builtin::pure(
            "indexof",
            sig(&[Type::String, Type::String], Type::Number),
            indexof,
        ),
        Builtin::pure(
            "substring",
            sig(&[Type::String, Type::Number, Type::Number], Type::String),
            substring,
        ),
        Builtin::pure(
            "trim",
            sig(&[Type::String, Type::String], Type::String),
            trim,
        ),
        Builtin::pure("trim_space", sig(&[Type::String], Type::String), trim_space),
        Builtin::pure(
            "format_int",
            sig(&[Type::Number, Type::Number], Type::String),
            format_int,
        ),
        Builtin::pure(
            "sprintf",
            sig(&[Type::String, Type::Array], Type::String),
            sprintf,
        ),
    ]
}

fn string_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a str, BuiltinError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| err(format!("{name}: operand {} must be a string", i + 1)))
}

/// `concat(delimiter, collection)` joins string members.
fn concat(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let delim = string_arg("concat", args, 0)?;
    let items: Vec<&str> = match args.get(1) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().ok_or_else(|| err("concat: non-string member")))
            .collect::<Result<_, _>>()?,
        Some(Value::Set(items)) => items
            .iter()
            .map(|v| v.as_str().ok_or_else(|| err("concat: non-string member")))
            .collect::<Result<_, _>>()?,
        _ => return Err(err("concat: second operand must be an array or set")),
    };
    Ok(Value::string(items.join(delim)))
}

fn contains(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (s, sub) = (string_arg("contains", args, 0)?, string_arg("contains", args, 1)?);
    Ok(Value::Bool(s.contains(sub)))
}

fn startswith(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (s, p) = (string_arg("startswith", args, 0)?, string_arg("startswith", args, 1)?);
    Ok(Value::Bool(s.starts_with(p)))
}

fn endswith(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (s, p) = (string_arg("endswith", args, 0)?, string_arg("endswith", args, 1)?);
    Ok(Value::Bool(s.ends_with(p)))
}

fn lower(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::string(string_arg("lower", args, 0)?.to_lowercase()))
}

fn upper(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::string(string_arg("upper", args, 0)?.to_uppercase()))
}

fn replace(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("replace", args, 0)?;
    let old = string_arg("replace", args, 1)?;
    let new = string_arg("replace", args, 2)?;
    Ok(Value::string(s.replace(old, new)))
}

fn split(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("split", args, 0)?;
    let delim = string_arg("split", args, 1)?;
    if delim.is_empty() {
        return Ok(Value::Array(
            s.chars().map(|c| Value::string(c.to_string())).collect(),
        ));
    }
    Ok(Value::Array(s.split(delim).map(Value::string).collect()))
}

fn indexof(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("indexof", args, 0)?;
    let sub = string_arg("indexof", args, 1)?;
    let idx = s
        .find(sub)
        .map_or(-1, |byte| s[..byte].chars().count() as i64);
    Ok(Value::number(idx))
}

/// `substring(s, start, length)`; negative length takes the rest.
fn substring(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("substring", args, 0)?;
    let start = args
        .get(1)
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("substring: start must be an integer"))?;
    let length = args
        .get(2)
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("substring: length must be an integer"))?;
    if start < 0 {
        return Err(err("substring: start must not be negative"));
    }
    let chars: Vec<char> = s.chars().collect();
    let start = (start as usize).min(chars.len());
    let end = if length < 0 {
        chars.len()
    } else {
        (start + length as usize).min(chars.len())
    };
    Ok(Value::string(chars[start..end].iter().collect::<String>()))
}

fn trim(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("trim", args, 0)?;
    let cutset = string_arg("trim", args, 1)?;
    Ok(Value::string(
        s.trim_matches(|c| cutset.contains(c)).to_string(),
    ))
}

fn trim_space(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::string(string_arg("trim_space", args, 0)?.trim()))
}

fn format_int(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let n = args
        .first()
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("format_int: operand must be an integer"))?;
    let base = args
        .get(1)
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("format_int: base must be an integer"))?;
    let (sign, magnitude) = if n < 0 {
        ("-", n.unsigned_abs())
    } else {
        ("", n.unsigned_abs())
    };
    let digits = match base {
        2 => format!("{magnitude:b}"),
        8 => format!("{magnitude:o}"),
        10 => format!("{magnitude}"),
        16 => format!("{magnitude:x}"),
        other => return Err(err(format!("format_int: unsupported base {other}"))),
    };
    Ok(Value::string(format!("{sign}{digits}")))
}

/// `sprintf(format, args)` with `%v` (any value), `%s`, `%d`, `%%`.
fn sprintf(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let format = string_arg("sprintf", args, 0)?;
    let Some(Value::Array(values)) = args.get(1) else {
        return Err(err("sprintf: second operand must be an array"));
    };
    let mut out = String::with_capacity(format.len());
    let mut values = values.iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some(spec @ ('v' | 's' | 'd')) => {
                let value = values
                    .next()
                    .ok_or_else(|| err("sprintf: not enough arguments"))?;
                match (spec, value) {
                    ('s', Value::String(s)) => out.push_str(s),
                    ('d', Value::Number(n)) if n.is_integer() => out.push_str(&n.to_string()),
                    ('d', _) => return Err(err("sprintf: %d needs an integer")),
                    (_, other) => out.push_str(&other.to_string()),
                }
            }
            other => {
                return Err(err(format!(
                    "sprintf: unsupported verb %{}",
                    other.map_or("<eof>".to_string(), |c| c.to_string())
                )))
            }
        }
    }
    Ok(Value::string(out))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_concat() {
        let parts = Value::Array(vec![Value::string("a"), Value::string("b")]);
        assert_eq!(
            call("concat", &[Value::string("."), parts]).unwrap(),
            Value::string("a.b")
        );
    }

    #[test]
    fn test_split() {
        assert_eq!(
            call("split", &[Value::string("a.b.c"), Value::string(".")]).unwrap(),
            Value::Array(vec![
                Value::string("a"),
                Value::string("b"),
                Value::string("c")
            ])
        );
    }

    #[test]
    fn test_predicates() {
        assert_eq!(
            call("startswith", &[Value::string("hello"), Value::string("he")]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call("contains", &[Value::string("hello"), Value::string("xyz")]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_substring() {
        assert_eq!(
            call(
                "substring",
                &[Value::string("abcdef"), Value::number(2), Value::number(3)]
            )
            .unwrap(),
            Value::string("cde")
        );
        assert_eq!(
            call(
                "substring",
                &[Value::string("abcdef"), Value::number(2), Value::number(-1)]
            )
            .unwrap(),
            Value::string("cdef")
        );
    }

    #[test]
    fn test_indexof_missing() {
        assert_eq!(
            call("indexof", &[Value::string("abc"), Value::string("z")]).unwrap(),
            Value::number(-1)
        );
    }

    #[test]
    fn test_format_int() {
        assert_eq!(
            call("format_int", &[Value::number(255), Value::number(16)]).unwrap(),
            Value::string("ff")
        );
        assert_eq!(
            call("format_int", &[Value::number(-8), Value::number(2)]).unwrap(),
            Value::string("-1000")
        );
    }

    #[test]
    fn test_sprintf() {
        let args = Value::Array(vec![Value::string("x"), Value::number(3)]);
        assert_eq!(
            call("sprintf", &[Value::string("%s=%d"), args]).unwrap(),
            Value::string("x=3")
        );
    }

    #[test]
    fn test_trim() {
        assert_eq!(
            call("trim", &[Value::string("--abc--"), Value::string("-")]).unwrap(),
            Value::string("abc")
        );
    }
}
