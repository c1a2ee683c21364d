//! Cryptographic built-ins: SHA-256 digests and HMAC signatures.

use super::{encoding::to_hex, err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::Value;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub(super) fn builtins() -> Vec<Builtin> {
    vec![
        Builtin::pure(
            "crypto.sha256",
            sig(&[Type::String], Type::String),
            sha256_hex,
        ),
        Builtin::pure(
            "crypto.hmac.sha256",
            sig(&[Type::String, Type::String], Type::String),
            hmac_sha256_hex,
        ),
    ]
}

fn sha256_hex(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let s = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| err("crypto.sha256: operand must be a string"))?;
    let digest = Sha256::digest(s.as_bytes());
    Ok(Value::string(to_hex(&digest)))
}

pub(super) fn hmac_sha256(message: &[u8], key: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256_hex(_: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let message = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| err("crypto.hmac.sha256: message must be a string"))?;
    let key = args
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| err("crypto.hmac.sha256: key must be a string"))?;
    Ok(Value::string(to_hex(&hmac_sha256(
        message.as_bytes(),
        key.as_bytes(),
    ))))
}

#[cfg(test)]
mod tests {
    use crate::builtins::testutil::call;
    use crate::value::Value;

    #[test]
    fn test_sha256_known_vector() {
        let digest = call("crypto.sha256", &[Value::string("abc")]).unwrap();
        assert_eq!(
            digest,
            Value::string("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_hmac_deterministic() {
        let a = call(
            "crypto.hmac.sha256",
            &[Value::string("msg"), Value::string("key")],
        )
        .unwrap();
        let b = call(
            "crypto.hmac.sha256",
            &[Value::string("msg"), Value::string("key")],
        )
        .unwrap();
        assert_eq!(a, b);
        let c = call(
            "crypto.hmac.sha256",
            &[Value::string("msg"), Value::string("other")],
        )
        .unwrap();
        assert_ne!(a, c);
    }
}
