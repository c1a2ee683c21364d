//! Aggregates and collection built-ins: counting, summing, sorting,
//! set algebra, and array/object helpers.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::{Number, Value};

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure("count", sig(&[Type::Any], Type::Number), count),
        Builtin::pure("sum", sig(&[Type::Collection], Type::Number), sum),
        Builtin::pure("product", sig(&[Type::Collection], Type::Number), product),
        Builtin::pure("max", sig(&[Type::Collection], Type::Any), max),
        Builtin::pure("min", sig(&[Type::Collection], Type::Any), min),
        Builtin::pure("sort", sig(&[Type::Collection], Type::Array), sort),
        Builtin::pure("union", sig(&[Type::Set, Type::Set], Type::Set), union),
        Builtin::pure(
            "intersection",
            sig(&[Type::Set, Type::Set], Type::Set),
            intersection,
        ),
        Builtin::pure(
            "difference",
            sig(&[Type::Set, Type::Set], Type::Set),
            difference,
        ),
        Builtin::pure(
            "array.concat",
            sig(&[Type::Array, Type::Array], Type::Array),
            array_concat,
        ),
        Builtin::pure(
            "array.slice",
            sig(&[Type::Array, Type::Number, Type::Number], Type::Array),
            array_slice,
        ),
        Builtin::pure(
            "object.get",
            sig(&[Type::Object, Type::Any, Type::Any], Type::Any),
            object_get,
        ),
        Builtin::pure("object.keys", sig(&[Type::Object], Type::Set), object_keys),
        Builtin::pure("type_name", sig(&[Type::Any], Type::String), type_name),
        Builtin::pure("is_number", sig(&[Type::Any], Type::Boolean), is_number),
        Builtin::pure("is_string", sig(&[Type::Any], Type::Boolean), is_string),
        Builtin::pure("is_boolean", sig(&[Type::Any], Type::Boolean), is_boolean),
        Builtin::pure("is_array", sig(&[Type::Any], Type::Boolean), is_array),
        Builtin::pure("is_object", sig(&[Type::Any], Type::Boolean), is_object),
        Builtin::pure("is_set", sig(&[Type::Any], Type::Boolean), is_set),
        Builtin::pure("is_null", sig(&[Type::Any], Type::Boolean), is_null),
    ]
}

/// Members of any collection, for the numeric folds.
fn members(name: &str, value: Option<&Value>) -> Result<Vec<Value>, BuiltinError> {
    match value {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::Set(items)) => Ok(items.iter().cloned().collect()),
        Some(Value::Object(map)) => Ok(map.values().cloned().collect()),
        other => Err(err(format!(
            "{name}: operand must be a collection, got {}",
            other.map_or("nothing", |v| v.type_name())
        ))),
    }
}

fn count(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let n = match args.first() {
        Some(Value::Array(items)) => items.len(),
        Some(Value::Set(items)) => items.len(),
        Some(Value::Object(map)) => map.len(),
        Some(Value::String(s)) => s.chars().count(),
        other => {
            return Err(err(format!(
                "count: operand must be a collection or string, got {}",
                other.map_or("nothing", |v| v.type_name())
            )))
        }
    };
    Ok(Value::number(n as i64))
}

fn numeric_fold(
    name: &str,
    args: &[Value],
    init: Number,
    f: impl Fn(&Number, &Number) -> Number,
) -> Result<Value, BuiltinError> {
    let mut acc = init;
    for item in members(name, args.first())? {
        let n = item
            .as_number()
            .ok_or_else(|| err(format!("{name}: collection contains a non-number")))?;
        acc = f(&acc, n);
    }
    Ok(Value::Number(acc))
}

fn sum(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    numeric_fold("sum", args, Number::from_i64(0), Number::checked_add)
}

fn product(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    numeric_fold("product", args, Number::from_i64(1), Number::checked_mul)
}

fn max(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    members("max", args.first())?
        .into_iter()
        .max()
        .ok_or_else(|| err("max: empty collection"))
}

fn min(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    members("min", args.first())?
        .into_iter()
        .min()
        .ok_or_else(|| err("min: empty collection"))
}

fn sort(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let mut items = members("sort", args.first())?;
    items.sort();
    Ok(Value::Array(items))
}

fn set_args<'a>(
    name: &str,
    args: &'a [Value],
) -> Result<(&'a std::collections::BTreeSet<Value>, &'a std::collections::BTreeSet<Value>), BuiltinError>
{
    match (args.first(), args.get(1)) {
        (Some(Value::Set(a)), Some(Value::Set(b))) => Ok((a, b)),
        _ => Err(err(format!("{name}: both operands must be sets"))),
    }
}

fn union(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = set_args("union", args)?;
    Ok(Value::Set(a.union(b).cloned().collect()))
}

fn intersection(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = set_args("intersection", args)?;
    Ok(Value::Set(a.intersection(b).cloned().collect()))
}

fn difference(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let (a, b) = set_args("difference", args)?;
    Ok(Value::Set(a.difference(b).cloned().collect()))
}

fn array_concat(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    match (args.first(), args.get(1)) {
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::Array(out))
        }
        _ => Err(err("array.concat: both operands must be arrays")),
    }
}

fn array_slice(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let Some(Value::Array(items)) = args.first() else {
        return Err(err("array.slice: first operand must be an array"));
    };
    let start = args
        .get(1)
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("array.slice: start must be an integer"))?;
    let stop = args
        .get(2)
        .and_then(Value::as_number)
        .and_then(Number::as_i64)
        .ok_or_else(|| err("array.slice: stop must be an integer"))?;
    let len = items.len() as i64;
    let start = start.clamp(0, len) as usize;
    let stop = stop.clamp(0, len) as usize;
    if start >= stop {
        return Ok(Value::Array(Vec::new()));
    }
    Ok(Value::Array(items[start..stop].to_vec()))
}

fn object_get(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let Some(Value::Object(map)) = args.first() else {
        return Err(err("object.get: first operand must be an object"));
    };
    let key = args.get(1).ok_or_else(|| err("object.get: missing key"))?;
    let fallback = args
        .get(2)
        .ok_or_else(|| err("object.get: missing default"))?;
    Ok(map.get(key).cloned().unwrap_or_else(|| fallback.clone()))
}

fn object_keys(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let Some(Value::Object(map)) = args.first() else {
        return Err(err("object.keys: operand must be an object"));
    };
    Ok(Value::Set(map.keys().cloned().collect()))
}

fn type_name(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    args.first()
        .map(|v| Value::string(v.type_name()))
        .ok_or_else(|| err("type_name: missing operand"))
}

macro_rules! type_predicate {
    ($fn_name:ident, $variant:pat) => {
        fn $fn_name(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
            Ok(Value::Bool(matches!(args.first(), Some($variant))))
        }
    };
}

type_predicate!(is_number, Value::Number(_));
type_predicate!(is_string, Value::String(_));
type_predicate!(is_boolean, Value::Bool(_));
type_predicate!(is_array, Value::Array(_));
type_predicate!(is_object, Value::Object(_));
type_predicate!(is_set, Value::Set(_));
type_predicate!(is_null, Value::Null);

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_count_variants() {
        assert_eq!(
            call("count", &[Value::Array(vec![Value::number(1)])]).unwrap(),
            Value::number(1)
        );
        assert_eq!(
            call("count", &[Value::string("abc")]).unwrap(),
            Value::number(3)
        );
        assert!(call("count", &[Value::number(1)]).is_err());
    }

    #[test]
    fn test_sum_and_product() {
        let xs = Value::Array(vec![Value::number(2), Value::number(3), Value::number(4)]);
        assert_eq!(call("sum", &[xs.clone()]).unwrap(), Value::number(9));
        assert_eq!(call("product", &[xs]).unwrap(), Value::number(24));
    }

    #[test]
    fn test_min_max_empty() {
        assert!(call("max", &[Value::Array(vec![])]).is_err());
    }

    #[test]
    fn test_sort_set_to_array() {
        let s = Value::set_from(vec![Value::number(3), Value::number(1)]);
        assert_eq!(
            call("sort", &[s]).unwrap(),
            Value::Array(vec![Value::number(1), Value::number(3)])
        );
    }

    #[test]
    fn test_set_algebra() {
        let a = Value::set_from(vec![Value::number(1), Value::number(2)]);
        let b = Value::set_from(vec![Value::number(2), Value::number(3)]);
        assert_eq!(
            call("union", &[a.clone(), b.clone()]).unwrap(),
            Value::set_from(vec![Value::number(1), Value::number(2), Value::number(3)])
        );
        assert_eq!(
            call("intersection", &[a.clone(), b.clone()]).unwrap(),
            Value::set_from(vec![Value::number(2)])
        );
        assert_eq!(
            call("difference", &[a, b]).unwrap(),
            Value::set_from(vec![Value::number(1)])
        );
    }

    #[test]
    fn test_object_get_with_default() {
        let obj = Value::object_from(vec![(Value::string("a"), Value::number(1))]);
        assert_eq!(
            call("object.get", &[obj.clone(), Value::string("a"), Value::Null]).unwrap(),
            Value::number(1)
        );
        assert_eq!(
            call("object.get", &[obj, Value::string("b"), Value::number(9)]).unwrap(),
            Value::number(9)
        );
    }

    #[test]
    fn test_array_slice_clamps() {
        let xs = Value::Array(vec![Value::number(0), Value::number(1), Value::number(2)]);
        assert_eq!(
            call("array.slice", &[xs, Value::number(1), Value::number(99)]).unwrap(),
            Value::Array(vec![Value::number(1), Value::number(2)])
        );
    }

    #[test]
    fn test_type_predicates() {
        assert_eq!(call("is_string", &[Value::string("x")]).unwrap(), Value::Bool(true));
        assert_eq!(call("is_number", &[Value::string("x")]).unwrap(), Value::Bool(false));
        assert_eq!(call("type_name", &[Value::Null]).unwrap(), Value::string("null"));
    }
}
