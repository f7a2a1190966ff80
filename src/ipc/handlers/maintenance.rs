use chrono::Utc;
use serde_json::json;

use crate::ipc::error::ok;
use crate::ipc::helpers::{bump, db, merge, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::maintenance::{self, RemovalCounts, CLEAR_ALL_CONFIRMATION};
use crate::model::RecordKind;
use crate::store::SqliteStore;

fn changed_by(removed: &RemovalCounts) -> Vec<&'static str> {
    let mut out = Vec::new();
    for (kind, n) in [
        (RecordKind::Member, removed.members),
        (RecordKind::Payment, removed.payments),
        (RecordKind::Activity, removed.activities),
    ] {
        if n > 0 {
            out.push(kind.collection());
        }
    }
    out
}

fn health(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db(state)?;
    let store = SqliteStore::new(conn);
    let report = maintenance::check_health(&store).map_err(HandlerErr::storage)?;
    let unreadable = maintenance::unreadable_settings(&store).map_err(HandlerErr::storage)?;
    let healthy = report.healthy && unreadable.is_empty();
    let mut out = serde_json::to_value(&report)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    out["healthy"] = json!(healthy);
    out["unreadableSettings"] = json!(unreadable);
    Ok(out)
}

fn cleanup(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let removed = {
        let conn = db(state)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let removed = maintenance::cleanup(&SqliteStore::new(&tx)).map_err(HandlerErr::storage)?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        removed
    };
    let rev = bump(state, changed_by(&removed));
    Ok(merge(json!({ "removed": removed, "total": removed.total() }), rev))
}

fn optimize(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let days = match params.get("olderThanDays") {
        None | Some(serde_json::Value::Null) => state.config.activity_retention_days,
        Some(v) => match v.as_i64() {
            Some(d) if d >= 0 => d,
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "olderThanDays must be a non-negative integer",
                ))
            }
        },
    };
    // VACUUM cannot run inside a transaction, so this works on the plain connection.
    let report = {
        let conn = db(state)?;
        maintenance::optimize(&SqliteStore::new(conn), days, Utc::now())
            .map_err(HandlerErr::storage)?
    };
    let changed = if report.activities_removed > 0 {
        vec![RecordKind::Activity.collection()]
    } else {
        Vec::new()
    };
    let rev = bump(state, changed);
    Ok(merge(
        json!({
            "olderThanDays": days,
            "cutoff": report.cutoff,
            "activitiesRemoved": report.activities_removed,
        }),
        rev,
    ))
}

fn clear_all(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let confirmed = params.get("confirm").and_then(|v| v.as_str()) == Some(CLEAR_ALL_CONFIRMATION);
    if !confirmed {
        return Err(HandlerErr::new(
            "confirmation_required",
            format!("pass confirm: \"{}\"", CLEAR_ALL_CONFIRMATION),
        ));
    }
    let report = {
        let conn = db(state)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let store = SqliteStore::new(&tx);
        let report = maintenance::clear_all(&store, &store).map_err(HandlerErr::storage)?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        report
    };
    let mut changed: Vec<&'static str> = RecordKind::ALL.iter().map(|k| k.collection()).collect();
    changed.push("settings");
    let rev = bump(state, changed);
    Ok(merge(
        json!({
            "removed": report.removed,
            "settingsRemoved": report.settings_removed,
        }),
        rev,
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "maintenance.health" => health(state),
        "maintenance.cleanup" => cleanup(state),
        "maintenance.optimize" => optimize(state, &req.params),
        "maintenance.clearAll" => clear_all(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
