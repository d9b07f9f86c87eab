//! Functions exposed by `hyportal serve`.

use hyportal::{ExposedFunctions, PortalError, Result};
use serde_json::{json, Value};

/// The demo function table: `add`, `echo` and `ping`.
pub fn functions() -> ExposedFunctions {
    ExposedFunctions::new()
        .expose("add", add)
        .expose("echo", echo)
        .expose("ping", ping)
}

/// Sum of all arguments. Integers stay integers.
async fn add(args: Vec<Value>) -> Result<Value> {
    if let Some(bad) = args.iter().find(|arg| !arg.is_number()) {
        return Err(PortalError::remote(format!(
            "TypeError: add expects numbers, got {}",
            bad
        )));
    }

    if args.iter().all(|arg| arg.is_i64()) {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        return Ok(json!(sum));
    }

    let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
    Ok(json!(sum))
}

/// A single argument comes back as-is, several as an array.
async fn echo(mut args: Vec<Value>) -> Result<Value> {
    Ok(match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    })
}

async fn ping(_args: Vec<Value>) -> Result<Value> {
    Ok(json!("pong"))
}
