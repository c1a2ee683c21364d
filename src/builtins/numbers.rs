//! Arithmetic built-ins. All operate on arbitrary-precision numbers;
//! division by zero and non-integer remainders are errors.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::{Number, Value};

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure("plus", sig(&[Type::Number, Type::Number], Type::Number), plus),
        Builtin::pure("minus", sig(&[Type::Any, Type::Any], Type::Any), minus),
        Builtin::pure("mul", sig(&[Type::Number, Type::Number], Type::Number), mul),
        Builtin::pure("div", sig(&[Type::Number, Type::Number], Type::Number), div),
        Builtin::pure("rem", sig(&[Type::Number, Type::Number], Type::Number), rem),
        Builtin::pure("abs", sig(&[Type::Number], Type::Number), abs),
        Builtin::pure("round", sig(&[Type::Number], Type::Number), round),
        Builtin::pure("ceil", sig(&[Type::Number], Type::Number), ceil),
        Builtin::pure("floor", sig(&[Type::Number], Type::Number), floor),
        Builtin::pure("to_number", sig(&[Type::Any], Type::Number), to_number),
    ]
}

fn number_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a Number, BuiltinError> {
    args.get(i)
        .and_then(Value::as_number)
        .ok_or_else(|| err(format!("{name}: operand {} must be a number", i + 1)))
}

fn plus(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = (number_arg("plus", args, 0)?, number_arg("plus", args, 1)?);
    Ok(Value::Number(a.checked_add(b)))
}

/// `minus` doubles as set difference, matching the `-` operator.
fn minus(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    match (args.first(), args.get(1)) {
        (Some(Value::Set(a)), Some(Value::Set(b))) => {
            Ok(Value::Set(a.difference(b).cloned().collect()))
        }
        _ => {
            let (a, b) = (number_arg("minus", args, 0)?, number_arg("minus", args, 1)?);
            Ok(Value::Number(a.checked_sub(b)))
        }
    }
}

fn mul(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = (number_arg("mul", args, 0)?, number_arg("mul", args, 1)?);
    Ok(Value::Number(a.checked_mul(b)))
}

fn div(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = (number_arg("div", args, 0)?, number_arg("div", args, 1)?);
    a.checked_div(b)
        .map(Value::Number)
        .ok_or_else(|| err("div: divide by zero"))
}

fn rem(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = (number_arg("rem", args, 0)?, number_arg("rem", args, 1)?);
    a.checked_rem(b)
        .map(Value::Number)
        .ok_or_else(|| err("rem: operands must be integers with a non-zero divisor"))
}

fn abs(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::Number(number_arg("abs", args, 0)?.abs()))
}

fn round(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::Number(number_arg("round", args, 0)?.round()))
}

fn ceil(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::Number(number_arg("ceil", args, 0)?.ceil()))
}

fn floor(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::Number(number_arg("floor", args, 0)?.floor()))
}

fn to_number(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    match args.first() {
        Some(Value::Number(n)) => Ok(Value::Number(n.clone())),
        Some(Value::Null) => Ok(Value::number(0)),
        Some(Value::Bool(b)) => Ok(Value::number(i64::from(*b))),
        Some(Value::String(s)) => s
            .parse::<Number>()
            .map(Value::Number)
            .map_err(|_| err(format!("to_number: cannot parse {s:?}"))),
        other => Err(err(format!(
            "to_number: cannot convert {}",
            other.map_or("nothing", |v| v.type_name())
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_plus() {
        assert_eq!(
            call("plus", &[Value::number(2), Value::number(3)]).unwrap(),
            Value::number(5)
        );
    }

    #[test]
    fn test_div_by_zero() {
        assert!(call("div", &[Value::number(1), Value::number(0)]).is_err());
    }

    #[test]
    fn test_minus_on_sets() {
        let a = Value::set_from(vec![Value::number(1), Value::number(2)]);
        let b = Value::set_from(vec![Value::number(2)]);
        assert_eq!(
            call("minus", &[a, b]).unwrap(),
            Value::set_from(vec![Value::number(1)])
        );
    }

    #[test]
    fn test_to_number_string() {
        assert_eq!(
            call("to_number", &[Value::string("4.5")]).unwrap(),
            Value::Number("4.5".parse().unwrap())
        );
        assert!(call("to_number", &[Value::string("abc")]).is_err());
    }

    #[test]
    fn test_rounding_family() {
        let n = Value::Number("2.5".parse().unwrap());
        assert_eq!(call("floor", &[n.clone()]).unwrap(), Value::number(2));
        assert_eq!(call("ceil", &[n]).unwrap(), Value::number(3));
    }

    #[test]
    fn test_type_mismatch() {
        assert!(call("plus", &[Value::string("a"), Value::number(1)]).is_err());
    }
}
