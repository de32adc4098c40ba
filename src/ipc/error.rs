use crate::error::CoreError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Reply for a failed core operation. Internal failures are logged here and
/// only described to the caller in development mode.
pub fn fail(id: &str, e: &CoreError, dev_mode: bool) -> serde_json::Value {
    let message = match e {
        CoreError::Internal(inner) => {
            tracing::error!(error = %format!("{:#}", inner), "internal error");
            if dev_mode {
                format!("{:#}", inner)
            } else {
                "internal error".to_string()
            }
        }
        other => other.to_string(),
    };
    err(id, e.code(), message, Some(json!({ "kind": e.kind() })))
}
