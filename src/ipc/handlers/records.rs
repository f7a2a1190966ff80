use chrono::Utc;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{bump, db, merge, required_kind, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::normalize::{normalize_any, BatchContext};
use crate::store::{RecordStore, SqliteStore};

fn records_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let kind = required_kind(params)?;
    let conn = db(state)?;
    let rows = SqliteStore::new(conn)
        .get_all(kind)
        .map_err(HandlerErr::storage)?;
    Ok(json!({
        "kind": kind.as_str(),
        "count": rows.len(),
        "records": rows,
    }))
}

fn records_upsert(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let kind = required_kind(params)?;
    let Some(raw) = params.get("record") else {
        return Err(HandlerErr::new("bad_params", "missing record"));
    };
    let ctx = BatchContext::new(Utc::now());
    let (id, record) = normalize_any(kind, raw, 0, &ctx).map_err(|reason| {
        HandlerErr::new("bad_params", format!("invalid {}: {}", kind.as_str(), reason))
            .with_details(json!({ "kind": kind.as_str(), "reason": reason }))
    })?;

    let conn = db(state)?;
    SqliteStore::new(conn)
        .upsert(kind, &id, &record)
        .map_err(HandlerErr::storage)?;
    tracing::debug!(kind = kind.as_str(), id = %id, "record saved");

    let rev = bump(state, vec![kind.collection()]);
    Ok(merge(json!({ "id": id, "record": record }), rev))
}

fn records_delete(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let kind = required_kind(params)?;
    let id = required_str(params, "id")?;
    let conn = db(state)?;
    let deleted = SqliteStore::new(conn)
        .delete(kind, &id)
        .map_err(HandlerErr::storage)?;

    let changed = if deleted { vec![kind.collection()] } else { Vec::new() };
    let rev = bump(state, changed);
    Ok(merge(json!({ "deleted": deleted }), rev))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "records.list" => records_list(state, &req.params),
        "records.upsert" => records_upsert(state, &req.params),
        "records.delete" => records_delete(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
