//! Encoding built-ins: JSON, base64, hex, and URL query escaping.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::Value;
use base64::Engine;

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure("json.marshal", sig(&[Type::Any], Type::String), json_marshal),
        Builtin::pure(
            "json.unmarshal",
            sig(&[Type::String], Type::Any),
            json_unmarshal,
        ),
        Builtin::pure(
            "base64.encode",
            sig(&[Type::String], Type::String),
            base64_encode,
        ),
        Builtin::pure(
            "base64.decode",
            sig(&[Type::String], Type::String),
            base64_decode,
        ),
        Builtin::pure(
            "base64url.encode",
            sig(&[Type::String], Type::String),
            base64url_encode,
        ),
        Builtin::pure(
            "base64url.decode",
            sig(&[Type::String], Type::String),
            base64url_decode,
        ),
        Builtin::pure("hex.encode", sig(&[Type::String], Type::String), hex_encode),
        Builtin::pure("hex.decode", sig(&[Type::String], Type::String), hex_decode),
        Builtin::pure(
            "urlquery.encode",
            sig(&[Type::String], Type::String),
            urlquery_encode,
        ),
        Builtin::pure(
            "urlquery.decode",
            sig(&[Type::String], Type::String),
            urlquery_decode,
        ),
    ]
}

fn string_arg<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, BuiltinError> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| err(format!("{name}: operand must be a string")))
}

fn json_marshal(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let value = args.first().ok_or_else(|| err("json.marshal: missing operand"))?;
    let json = value
        .to_json()
        .ok_or_else(|| err("json.marshal: value contains unbound terms"))?;
    serde_json::to_string(&json)
        .map(Value::string)
        .map_err(|e| err(format!("json.marshal: {e}")))
}

fn json_unmarshal(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("json.unmarshal", args)?;
    Value::from_json_str(s).map_err(|e| err(format!("json.unmarshal: {e}")))
}

fn base64_encode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("base64.encode", args)?;
    Ok(Value::string(
        base64::engine::general_purpose::STANDARD.encode(s.as_bytes()),
    ))
}

fn base64_decode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("base64.decode", args)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| err(format!("base64.decode: {e}")))?;
    String::from_utf8(bytes)
        .map(Value::string)
        .map_err(|_| err("base64.decode: payload is not UTF-8"))
}

fn base64url_encode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("base64url.encode", args)?;
    Ok(Value::string(
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(s.as_bytes()),
    ))
}

fn base64url_decode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("base64url.decode", args)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| err(format!("base64url.decode: {e}")))?;
    String::from_utf8(bytes)
        .map(Value::string)
        .map_err(|_| err("base64url.decode: payload is not UTF-8"))
}

fn hex_encode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("hex.encode", args)?;
    Ok(Value::string(to_hex(s.as_bytes())))
}

fn hex_decode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("hex.decode", args)?;
    if !s.is_ascii() {
        return Err(err("hex.decode: invalid hex digit"));
    }
    if s.len() % 2 != 0 {
        return Err(err("hex.decode: odd-length input"));
    }
    let mut bytes = Vec::with_capacity(s.len() / 2);
    for i in (0..s.len()).step_by(2) {
        let byte = u8::from_str_radix(&s[i..i + 2], 16)
            .map_err(|_| err("hex.decode: invalid hex digit"))?;
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map(Value::string)
        .map_err(|_| err("hex.decode: payload is not UTF-8"))
}

pub(super) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn urlquery_encode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("urlquery.encode", args)?;
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    Ok(Value::string(out))
}

fn urlquery_decode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = string_arg("urlquery.decode", args)?;
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(byte) = iter.next() {
        match byte {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hi = iter.next().ok_or_else(|| err("urlquery.decode: truncated escape"))?;
                let lo = iter.next().ok_or_else(|| err("urlquery.decode: truncated escape"))?;
                let pair = [hi, lo];
                let text = std::str::from_utf8(&pair)
                    .map_err(|_| err("urlquery.decode: invalid escape"))?;
                let decoded = u8::from_str_radix(text, 16)
                    .map_err(|_| err("urlquery.decode: invalid escape"))?;
                bytes.push(decoded);
            }
            other => bytes.push(other),
        }
    }
    String::from_utf8(bytes)
        .map(Value::string)
        .map_err(|_| err("urlquery.decode: payload is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_json_round_trip() {
        let marshalled = call("json.marshal", &[Value::number(3)]).unwrap();
        assert_eq!(marshalled, Value::string("3"));
        let back = call("json.unmarshal", &[marshalled]).unwrap();
        assert_eq!(back, Value::number(3));
    }

    #[test]
    fn test_base64() {
        let encoded = call("base64.encode", &[Value::string("hello")]).unwrap();
        assert_eq!(encoded, Value::string("aGVsbG8="));
        assert_eq!(
            call("base64.decode", &[encoded]).unwrap(),
            Value::string("hello")
        );
    }

    #[test]
    fn test_base64url_no_padding() {
        let encoded = call("base64url.encode", &[Value::string("ab")]).unwrap();
        assert_eq!(encoded, Value::string("YWI"));
    }

    #[test]
    fn test_hex() {
        let encoded = call("hex.encode", &[Value::string("AB")]).unwrap();
        assert_eq!(encoded, Value::string("4142"));
        assert_eq!(
            call("hex.decode", &[encoded]).unwrap(),
            Value::string("AB")
        );
    }

    #[test]
    fn test_urlquery() {
        let encoded = call("urlquery.encode", &[Value::string("a b&c")]).unwrap();
        assert_eq!(encoded, Value::string("a+b%26c"));
        assert_eq!(
            call("urlquery.decode", &[encoded]).unwrap(),
            Value::string("a b&c")
        );
    }
}
