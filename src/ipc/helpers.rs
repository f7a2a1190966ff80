use std::path::PathBuf;

use rusqlite::Connection;
use serde_json::json;

use super::error::err;
use super::types::AppState;
use crate::model::RecordKind;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn storage(e: anyhow::Error) -> Self {
        Self::new("db_failed", format!("{e:#}"))
    }
}

pub fn db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn workspace(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn required_kind(params: &serde_json::Value) -> Result<RecordKind, HandlerErr> {
    let raw = required_str(params, "kind")?;
    RecordKind::parse(&raw).ok_or_else(|| {
        HandlerErr::new("bad_params", format!("unknown kind: {}", raw))
            .with_details(json!({ "kind": raw }))
    })
}

/// Bumps the workspace revision and builds the `{revision, changed}` pair
/// every mutating method returns.
pub fn bump(state: &mut AppState, changed: Vec<&'static str>) -> serde_json::Value {
    if !changed.is_empty() {
        state.revision += 1;
    }
    json!({ "revision": state.revision, "changed": changed })
}

/// Merges `extra` (an object) into `base` (an object).
pub fn merge(mut base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    if let (Some(b), serde_json::Value::Object(e)) = (base.as_object_mut(), extra) {
        b.extend(e);
    }
    base
}
