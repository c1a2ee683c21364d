//! `http.send` - the effectful HTTP client built-in.
//!
//! Responses are cached per request signature for the duration of one
//! evaluation (the registry layer keys the cache on the full argument
//! list), so a query that sends the same request twice observes one
//! response.

use super::{err, sig, Builtin, BuiltinContext, BuiltinError, Type};
use crate::value::Value;
use std::time::Duration;

pub(super) fn builtins() -> Vec<Builtin> {
    vec![Builtin {
        name: "http.send",
        signature: sig(&[Type::Object], Type::Object),
        effectful: true,
        nondeterministic: true,
        func: send,
    }]
}

fn send(ctx: &mut BuiltinContext<'_>, args: &[Value]) -> Result<Value, BuiltinError> {
    let Some(Value::Object(request)) = args.first() else {
        return Err(err("http.send: operand must be an object"));
    };

    let method = request
        .get(&Value::string("method"))
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();
    let url = request
        .get(&Value::string("url"))
        .and_then(Value::as_str)
        .ok_or_else(|| err("http.send: request must have a 'url' string"))?;
    let timeout_ms = request
        .get(&Value::string("timeout_ms"))
        .and_then(Value::as_number)
        .and_then(crate::value::Number::as_i64)
        .unwrap_or(5_000);

    if ctx.cancel.is_cancelled() {
        return Err(BuiltinError::Cancelled);
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(timeout_ms.max(1) as u64))
        .build()
        .map_err(|e| err(format!("http.send: client: {e}")))?;

    let mut builder = match method.as_str() {
        "GET" => client.get(url),
        "POST" => client.post(url),
        "PUT" => client.put(url),
        "DELETE" => client.delete(url),
        "HEAD" => client.head(url),
        "PATCH" => client.patch(url),
        other => return Err(err(format!("http.send: unsupported method '{other}'"))),
    };

    if let Some(Value::Object(headers)) = request.get(&Value::string("headers")) {
        for (k, v) in headers {
            if let (Some(name), Some(value)) = (k.as_str(), v.as_str()) {
                builder = builder.header(name, value);
            }
        }
    }
    if let Some(body) = request.get(&Value::string("body")) {
        let json = body
            .to_json()
            .ok_or_else(|| err("http.send: body contains unbound terms"))?;
        builder = builder.json(&json);
    }

    let response = builder
        .send()
        .map_err(|e| err(format!("http.send: request failed: {e}")))?;

    if ctx.cancel.is_cancelled() {
        return Err(BuiltinError::Cancelled);
    }

    let status = response.status().as_u16();
    let mut headers_out = Vec::new();
    for (name, value) in response.headers() {
        if let Ok(text) = value.to_str() {
            headers_out.push((Value::string(name.as_str()), Value::string(text)));
        }
    }
    let raw_body = response
        .text()
        .map_err(|e| err(format!("http.send: reading body: {e}")))?;
    let parsed = Value::from_json_str(&raw_body).ok();

    let mut out = vec![
        (Value::string("status_code"), Value::number(i64::from(status))),
        (Value::string("raw_body"), Value::string(raw_body)),
        (Value::string("headers"), Value::object_from(headers_out)),
    ];
    if let Some(body) = parsed {
        out.push((Value::string("body"), body));
    }
    Ok(Value::object_from(out))
}
