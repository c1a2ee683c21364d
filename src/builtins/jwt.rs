//! JSON Web Token built-ins: decoding and HS256 verification.

use super::{crypto::hmac_sha256, encoding::to_hex, err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::Value;
use base64::Engine;

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure("io.jwt.decode", sig(&[Type::String], Type::Array), decode),
        Builtin::pure(
            "io.jwt.verify_hs256",
            sig(&[Type::String, Type::String], Type::Boolean),
            verify_hs256,
        ),
    ]
}

fn split_token(token: &str) -> Result<(&str, &str, &str), BuiltinError> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => Ok((h, p, s)),
        _ => Err(err("io.jwt: token must have three dot-separated parts")),
    }
}

fn decode_part(part: &str, what: &str) -> Result<Value, BuiltinError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| err(format!("io.jwt: {what} is not base64url: {e}")))?;
    let text =
        String::from_utf8(bytes).map_err(|_| err(format!("io.jwt: {what} is not UTF-8")))?;
    Value::from_json_str(&text).map_err(|e| err(format!("io.jwt: {what} is not JSON: {e}")))
}

/// `io.jwt.decode(token)` returns `[header, payload, signature-hex]`.
/// No verification is performed.
fn decode(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let token = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| err("io.jwt.decode: operand must be a string"))?;
    let (header, payload, signature) = split_token(token)?;
    let sig_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| err(format!("io.jwt.decode: signature is not base64url: {e}")))?;
    Ok(Value::Array(vec![
        decode_part(header, "header")?,
        decode_part(payload, "payload")?,
        Value::string(to_hex(&sig_bytes)),
    ]))
}

/// `io.jwt.verify_hs256(token, secret)`: recompute the HMAC over
/// `header.payload` and compare against the embedded signature.
fn verify_hs256(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let token = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| err("io.jwt.verify_hs256: token must be a string"))?;
    let secret = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| err("io.jwt.verify_hs256: secret must be a string"))?;

    let (header, payload, signature) = split_token(token)?;
    let Ok(claimed) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(signature) else {
        return Ok(Value::Bool(false));
    };
    let signing_input = format!("{header}.{payload}");
    let expected = hmac_sha256(signing_input.as_bytes(), secret.as_bytes());

    // Constant-time comparison.
    let equal = claimed.len() == expected.len()
        && claimed
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    Ok(Value::Bool(equal))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;
    use base64::Engine;

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
    }

    fn make_token(secret: &str) -> String {
        let header = b64(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = b64(br#"{"sub":"alice","admin":true}"#);
        let signing_input = format!("{header}.{payload}");
        let sig = crate::builtins::crypto::hmac_sha256(signing_input.as_bytes(), secret.as_bytes());
        format!("{signing_input}.{}", b64(&sig))
    }

    #[test]
    fn test_decode() {
        let token = make_token("secret");
        let out = call("io.jwt.decode", &[Value::string(token)]).unwrap();
        let Value::Array(parts) = out else {
            panic!("expected array")
        };
        assert_eq!(
            parts[0].get_key(&Value::string("alg")),
            Some(&Value::string("HS256"))
        );
        assert_eq!(
            parts[1].get_key(&Value::string("sub")),
            Some(&Value::string("alice"))
        );
    }

    #[test]
    fn test_verify_round_trip() {
        let token = make_token("secret");
        assert_eq!(
            call(
                "io.jwt.verify_hs256",
                &[Value::string(token.clone()), Value::string("secret")]
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(
                "io.jwt.verify_hs256",
                &[Value::string(token), Value::string("wrong")]
            )
            .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_malformed_token() {
        assert!(call("io.jwt.decode", &[Value::string("onlyonepart")]).is_err());
    }
}
