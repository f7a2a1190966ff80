use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{bump, db, merge, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::snapshot::{settings_key, SETTINGS_KEYS};
use crate::store::{SettingsStore, SqliteStore};

fn storage_key(params: &serde_json::Value) -> Result<(String, &'static str), HandlerErr> {
    let field = required_str(params, "key")?;
    let Some(key) = settings_key(&field) else {
        let allowed: Vec<&str> = SETTINGS_KEYS.iter().map(|(f, _)| *f).collect();
        return Err(HandlerErr::new("bad_params", format!("unknown settings key: {}", field))
            .with_details(json!({ "allowed": allowed })));
    };
    Ok((field, key))
}

fn settings_get(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (field, key) = storage_key(params)?;
    let conn = db(state)?;
    let raw = SqliteStore::new(conn)
        .get(key)
        .map_err(HandlerErr::storage)?;
    // Unparseable blobs come back as null; maintenance.health lists them.
    let value = raw
        .as_deref()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .unwrap_or(serde_json::Value::Null);
    Ok(json!({ "key": field, "value": value }))
}

fn settings_set(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (field, key) = storage_key(params)?;
    let text = match params.get("value") {
        Some(v @ serde_json::Value::Object(_)) => v.to_string(),
        Some(serde_json::Value::String(s))
            if serde_json::from_str::<serde_json::Value>(s).is_ok_and(|v| v.is_object()) =>
        {
            s.clone()
        }
        _ => {
            return Err(HandlerErr::new(
                "bad_params",
                "value must be a JSON object or a string holding one",
            ))
        }
    };
    let conn = db(state)?;
    SqliteStore::new(conn)
        .set(key, &text)
        .map_err(HandlerErr::storage)?;

    let rev = bump(state, vec!["settings"]);
    Ok(merge(json!({ "key": field }), rev))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "settings.get" => settings_get(state, &req.params),
        "settings.set" => settings_set(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
