//! JSON snapshots of engine values
//!
//! Sandboxes built from host data enter the engine through `JSON.parse`, and
//! sandbox contents and completion values leave it through `JSON.stringify`.
//! Anything JSON cannot represent at the top level (`undefined`, functions,
//! symbols) comes out as `null`.

use crate::error::{ContextifyError, Result};
use rquickjs::{Ctx, Type, Value};

/// Build an engine value in `ctx` from host JSON
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> Result<Value<'js>> {
    let text = serde_json::to_string(value)
        .map_err(|e| ContextifyError::conversion(format!("cannot serialize sandbox data: {}", e)))?;
    ctx.json_parse(text).map_err(|e| {
        let _ = ctx.catch();
        ContextifyError::conversion(format!("engine rejected sandbox data: {}", e))
    })
}

/// Snapshot an engine value as host JSON
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value> {
    match value.type_of() {
        Type::Uninitialized
        | Type::Undefined
        | Type::Null
        | Type::Function
        | Type::Constructor
        | Type::Symbol => return Ok(serde_json::Value::Null),
        _ => {}
    }

    let text = match ctx.json_stringify(value) {
        Ok(Some(text)) => text.to_string()?,
        Ok(None) => return Ok(serde_json::Value::Null),
        Err(e) => {
            // Cycles and throwing `toJSON` methods leave the exception pending
            let _ = ctx.catch();
            return Err(ContextifyError::conversion(format!(
                "cannot snapshot value: {}",
                e
            )));
        }
    };
    serde_json::from_str(&text)
        .map_err(|e| ContextifyError::conversion(format!("engine produced invalid JSON: {}", e)))
}
