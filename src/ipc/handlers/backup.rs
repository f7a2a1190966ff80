use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;

use crate::bundle;
use crate::db;
use crate::ipc::error::ok;
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::{self, bump, merge, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::RecordKind;
use crate::normalize::BatchContext;
use crate::snapshot::{self, ImportError};
use crate::store::SqliteStore;

fn import_err(e: ImportError, path: &str) -> HandlerErr {
    HandlerErr::new(e.code(), e.to_string()).with_details(json!({ "path": path }))
}

fn handle_export_snapshot(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let out_path = required_str(params, "outPath")?;
    let conn = helpers::db(state)?;
    let store = SqliteStore::new(conn);

    let snap = snapshot::export_snapshot(&store, &store, &state.config.gym_name, Utc::now())
        .map_err(|e| {
            tracing::error!(error = ?e, "snapshot export failed");
            HandlerErr::new("export_failed", format!("{e:#}"))
        })?;
    let written = snapshot::write_snapshot_file(&snap, &PathBuf::from(&out_path)).map_err(|e| {
        HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": out_path }))
    })?;
    tracing::info!(path = %written.display(), members = snap.metadata.total_members, "snapshot exported");

    Ok(json!({
        "path": written.to_string_lossy(),
        "fileName": written.file_name().map(|n| n.to_string_lossy().to_string()),
        "exportId": snap.metadata.export_id,
        "counts": {
            "members": snap.metadata.total_members,
            "payments": snap.metadata.total_payments,
            "activities": snap.metadata.total_activities,
        },
        "totalRevenue": snap.metadata.total_revenue,
    }))
}

fn handle_import_snapshot(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let in_path = required_str(params, "inPath")?;
    let doc = snapshot::read_import_file(&PathBuf::from(&in_path), state.config.max_import_bytes)
        .map_err(|e| {
            tracing::warn!(path = %in_path, error = %e, "import rejected");
            import_err(e, &in_path)
        })?;

    let report = {
        let conn = helpers::db(state)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let store = SqliteStore::new(&tx);
        let ctx = BatchContext::new(Utc::now());
        // Dropping the transaction on error rolls every write back.
        let report = snapshot::import_snapshot(&store, &store, &doc, &ctx)
            .map_err(|e| import_err(e, &in_path))?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
        report
    };

    let rev = bump(state, report.changed_collections());
    Ok(merge(
        json!({
            "format": report.format,
            "counts": {
                "members": report.members_imported,
                "payments": report.payments_imported,
                "activities": report.activities_imported,
            },
            "activitiesSkipped": report.activities_skipped,
            "errorsCount": report.errors.len(),
            "errors": report.errors,
            "settingsRestored": report.settings_restored,
        }),
        rev,
    ))
}

fn handle_export_workspace_bundle(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let out_path = required_str(params, "outPath")?;
    let workspace_path = helpers::workspace(state)?;
    let conn = helpers::db(state)?;

    let mut counts = Vec::new();
    for kind in RecordKind::ALL {
        let n = db::count_records(conn, kind.as_str()).map_err(HandlerErr::storage)?;
        counts.push((kind.collection(), n));
    }

    let export = bundle::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path), &counts)
        .map_err(|e| {
            HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": out_path }))
        })?;
    tracing::info!(path = %out_path, sha256 = %export.sha256, "workspace bundle exported");

    Ok(json!({
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
        "sha256": export.sha256,
    }))
}

fn handle_import_workspace_bundle(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let in_path = required_str(params, "inPath")?;
    let workspace_path = helpers::workspace(state)?;

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return Err(HandlerErr::new("not_found", "bundle file not found")
            .with_details(json!({ "path": in_path })));
    }

    // Drop open handle before replacing file.
    state.db = None;

    let imported = bundle::import_workspace_bundle(&src, &workspace_path);
    let reopened = open_workspace(state, &workspace_path);
    let import = imported.map_err(|e| {
        HandlerErr::new("io_failed", format!("{e:#}")).with_details(json!({ "path": in_path }))
    })?;
    reopened.map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    tracing::info!(format = %import.bundle_format_detected, bytes = import.bytes, "workspace bundle imported");

    let mut changed: Vec<&'static str> = RecordKind::ALL.iter().map(|k| k.collection()).collect();
    changed.push("settings");
    let rev = bump(state, changed);
    Ok(merge(
        json!({
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormatDetected": import.bundle_format_detected,
        }),
        rev,
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "backup.exportSnapshot" => handle_export_snapshot(state, &req.params),
        "backup.importSnapshot" => handle_import_snapshot(state, &req.params),
        "backup.exportWorkspaceBundle" => handle_export_workspace_bundle(state, &req.params),
        "backup.importWorkspaceBundle" => handle_import_workspace_bundle(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
