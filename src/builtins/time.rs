//! Time built-ins. `time.now_ns` is pinned to the evaluation's start
//! timestamp so it is a single value for an entire query.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::{Number, Value};
use chrono::{DateTime, Datelike, Timelike, Utc};

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "time.now_ns",
            signature: sig(&[], Type::Number),
            effectful: false,
            nondeterministic: true,
            func: now_ns,
        },
        Builtin::pure(
            "time.parse_rfc3339_ns",
            sig(&[Type::String], Type::Number),
            parse_rfc3339_ns,
        ),
        Builtin::pure("time.date", sig(&[Type::Number], Type::Array), date),
        Builtin::pure("time.clock", sig(&[Type::Number], Type::Array), clock),
        Builtin::pure("time.weekday", sig(&[Type::Number], Type::String), weekday),
    ]
}

fn now_ns(ctx: &mut BuiltinContext<'_>, _: &[Value]) -> Result<Value, BuiltinError> {
    Ok(Value::Number(Number::from_i64(ctx.now_ns)))
}

fn parse_rfc3339_ns(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| err("time.parse_rfc3339_ns: operand must be a string"))?;
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|e| err(format!("time.parse_rfc3339_ns: {e}")))?;
    let ns = dt
        .timestamp_nanos_opt()
        .ok_or_else(|| err("time.parse_rfc3339_ns: timestamp out of range"))?;
    Ok(Value::Number(Number::from_i64(ns)))
}

fn datetime_arg(name: &str, args: &[Value]) -> Result<DateTime<Utc>, BuiltinError> {
    let ns = args
        .first()
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err(format!("{name}: operand must be integer nanoseconds")))?;
    Ok(DateTime::from_timestamp_nanos(ns))
}

fn date(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let dt = datetime_arg("time.date", args)?;
    Ok(Value::Array(vec![
        Value::number(i64::from(dt.year())),
        Value::number(i64::from(dt.month())),
        Value::number(i64::from(dt.day())),
    ]))
}

fn clock(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let dt = datetime_arg("time.clock", args)?;
    Ok(Value::Array(vec![
        Value::number(i64::from(dt.hour())),
        Value::number(i64::from(dt.minute())),
        Value::number(i64::from(dt.second())),
    ]))
}

fn weekday(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let dt = datetime_arg("time.weekday", args)?;
    let name = match dt.weekday() {
        chrono::Weekday::Mon => "Monday",
        chrono::Weekday::Tue => "Tuesday",
        chrono::Weekday::Wed => "Wednesday",
        chrono::Weekday::Thu => "Thursday",
        chrono::Weekday::Fri => "Friday",
        chrono::Weekday::Sat => "Saturday",
        chrono::Weekday::Sun => "Sunday",
    };
    Ok(Value::string(name))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_parse_rfc3339() {
        let ns = call(
            "time.parse_rfc3339_ns",
            &[Value::string("2026-01-02T03:04:05Z")],
        )
        .unwrap();
        let date = call("time.date", &[ns.clone()]).unwrap();
        assert_eq!(
            date,
            Value::Array(vec![
                Value::number(2026),
                Value::number(1),
                Value::number(2)
            ])
        );
        let clock = call("time.clock", &[ns]).unwrap();
        assert_eq!(
            clock,
            Value::Array(vec![Value::number(3), Value::number(4), Value::number(5)])
        );
    }

    #[test]
    fn test_weekday() {
        // 2026-01-02 is a Friday.
        let ns = call(
            "time.parse_rfc3339_ns",
            &[Value::string("2026-01-02T00:00:00Z")],
        )
        .unwrap();
        assert_eq!(call("time.weekday", &[ns]).unwrap(), Value::string("Friday"));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(call("time.parse_rfc3339_ns", &[Value::string("not a date")]).is_err());
    }
}
