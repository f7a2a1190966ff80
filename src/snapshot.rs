//! JSON backup snapshots: export of every collection plus settings, and the
//! import path that recovers records from current, legacy and hand-made
//! backup shapes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::model::RecordKind;
use crate::normalize::{self, BatchContext};
use crate::store::{upsert_record, RecordStore, SettingsStore};

pub const SNAPSHOT_VERSION: &str = "5.0";

/// Snapshot field name and settings-store key for each settings blob.
pub const SETTINGS_KEYS: [(&str, &str); 3] = [
    ("pricing", "gymPricingSettings"),
    ("user", "gymUserSettings"),
    ("notifications", "gymNotificationSettings"),
];

pub fn settings_key(field: &str) -> Option<&'static str> {
    SETTINGS_KEYS
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, k)| *k)
}

/// Keys written by the oldest toolbar export, which dumped browser storage.
const STORAGE_DUMP_KEYS: [(RecordKind, &str); 3] = [
    (RecordKind::Member, "gym-tracker-members"),
    (RecordKind::Payment, "gym-tracker-payments"),
    (RecordKind::Activity, "gym-tracker-activities"),
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: SnapshotData,
    pub settings: SnapshotSettings,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub export_date: String,
    pub version: String,
    pub gym_name: String,
    pub export_id: String,
    pub total_members: usize,
    pub total_payments: usize,
    pub total_activities: usize,
    pub total_revenue: f64,
    pub data_integrity: DataIntegrity,
}

/// Collection lengths only. A sanity marker, not a digest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataIntegrity {
    pub members_checksum: usize,
    pub payments_checksum: usize,
    pub activities_checksum: usize,
    pub export_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotData {
    pub members: Vec<Value>,
    pub payments: Vec<Value>,
    pub activities: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSettings {
    pub pricing: String,
    pub user: String,
    pub notifications: String,
}

/// Reads every collection and the settings blobs. Any failed read aborts the
/// whole export.
pub fn export_snapshot(
    records: &dyn RecordStore,
    settings: &dyn SettingsStore,
    gym_name: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Snapshot> {
    let members = records
        .get_all(RecordKind::Member)
        .context("failed to read members")?;
    let payments = records
        .get_all(RecordKind::Payment)
        .context("failed to read payments")?;
    let activities = records
        .get_all(RecordKind::Activity)
        .context("failed to read activities")?;

    let blob = |field: &str| -> anyhow::Result<String> {
        let key = settings_key(field).unwrap_or(field);
        let v = settings
            .get(key)
            .with_context(|| format!("failed to read setting {}", key))?;
        Ok(v.unwrap_or_else(|| "{}".to_string()))
    };
    let pricing = blob("pricing")?;
    let user = blob("user")?;
    let notifications = blob("notifications")?;

    let total_revenue = payments
        .iter()
        .filter_map(|p| p.get("amount").and_then(|v| v.as_f64()))
        .filter(|a| a.is_finite())
        .sum();

    let stamp = normalize::iso_millis(now);
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(9);

    Ok(Snapshot {
        metadata: SnapshotMetadata {
            export_date: stamp.clone(),
            version: SNAPSHOT_VERSION.to_string(),
            gym_name: gym_name.to_string(),
            export_id: format!("export_{}_{}", now.timestamp_millis(), suffix),
            total_members: members.len(),
            total_payments: payments.len(),
            total_activities: activities.len(),
            total_revenue,
            data_integrity: DataIntegrity {
                members_checksum: members.len(),
                payments_checksum: payments.len(),
                activities_checksum: activities.len(),
                export_complete: true,
            },
        },
        data: SnapshotData {
            members,
            payments,
            activities,
        },
        settings: SnapshotSettings {
            pricing,
            user,
            notifications,
        },
        timestamp: stamp,
    })
}

/// `{gym-slug}-complete-backup-{YYYYMMDD}.json`
pub fn default_file_name(meta: &SnapshotMetadata) -> String {
    let mut slug = String::new();
    for ch in meta.gym_name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "gym" } else { slug };
    let day: String = meta
        .export_date
        .chars()
        .take(10)
        .filter(|c| c.is_ascii_digit())
        .collect();
    format!("{}-complete-backup-{}.json", slug, day)
}

/// Writes next to the target and renames, so a failed write never leaves a
/// partial backup behind. A directory target gets the default file name.
pub fn write_snapshot_file(snapshot: &Snapshot, out_path: &Path) -> anyhow::Result<PathBuf> {
    let target = if out_path.is_dir() {
        out_path.join(default_file_name(&snapshot.metadata))
    } else {
        out_path.to_path_buf()
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let text = serde_json::to_string_pretty(snapshot).context("failed to serialize snapshot")?;
    let tmp = target.with_extension("json.partial");
    fs::write(&tmp, text).with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to move backup to {}", target.display()));
    }
    Ok(target)
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("file is too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    #[error("file is empty")]
    Empty,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("no valid data to import")]
    NoData,
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("import failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "file_too_large",
            Self::Empty => "empty_file",
            Self::InvalidJson(_) => "invalid_json",
            Self::NoData => "no_data",
            Self::Io { .. } => "io_failed",
            Self::Storage(_) => "import_failed",
        }
    }
}

/// Size is checked from metadata, before a single byte is read.
pub fn read_import_file(path: &Path, max_bytes: u64) -> Result<Value, ImportError> {
    let io_err = |source: std::io::Error| ImportError::Io {
        path: path.display().to_string(),
        source,
    };
    let size = fs::metadata(path).map_err(io_err)?.len();
    if size > max_bytes {
        return Err(ImportError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let bytes = fs::read(path).map_err(io_err)?;
    parse_import_bytes(&bytes)
}

pub fn parse_import_bytes(bytes: &[u8]) -> Result<Value, ImportError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ImportError::InvalidJson(e.to_string()))?;
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Err(ImportError::Empty);
    }
    serde_json::from_str(text).map_err(|e| ImportError::InvalidJson(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// `{ metadata, data: {...}, settings }`
    Versioned,
    /// Top-level `members` / `payments` arrays.
    Legacy,
    /// `gym-tracker-*` keys holding JSON text.
    StorageDump,
    /// One array of mixed records, classified by field sniffing.
    FlatArray,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Versioned => "versioned",
            Self::Legacy => "legacy",
            Self::StorageDump => "storage-dump",
            Self::FlatArray => "flat-array",
        }
    }
}

#[derive(Debug, Default)]
pub struct DetectedPayload {
    pub format: Option<SourceFormat>,
    pub members: Vec<Value>,
    pub payments: Vec<Value>,
    pub activities: Vec<Value>,
    pub settings: Option<Map<String, Value>>,
}

impl DetectedPayload {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.payments.is_empty() && self.activities.is_empty()
    }
}

/// First match wins: versioned, legacy, storage dump, flat array.
pub fn detect_format(doc: &Value) -> DetectedPayload {
    if let Some(items) = doc.as_array() {
        let mut out = DetectedPayload {
            format: Some(SourceFormat::FlatArray),
            ..Default::default()
        };
        for item in items {
            let Some(obj) = item.as_object() else {
                continue;
            };
            if obj.contains_key("amount") {
                out.payments.push(item.clone());
            } else if obj.contains_key("name") {
                out.members.push(item.clone());
            } else if obj.contains_key("activityType") {
                out.activities.push(item.clone());
            }
        }
        return out;
    }

    let Some(obj) = doc.as_object() else {
        return DetectedPayload::default();
    };
    let settings = obj.get("settings").and_then(|v| v.as_object()).cloned();

    if obj.get("data").is_some_and(truthy) {
        let data = &obj["data"];
        return DetectedPayload {
            format: Some(SourceFormat::Versioned),
            members: array_field(data.get("members")),
            payments: array_field(data.get("payments")),
            activities: array_field(data.get("activities")),
            settings,
        };
    }

    if obj.get("members").is_some_and(truthy) || obj.get("payments").is_some_and(truthy) {
        return DetectedPayload {
            format: Some(SourceFormat::Legacy),
            members: array_field(obj.get("members")),
            payments: array_field(obj.get("payments")),
            activities: array_field(obj.get("activities")),
            settings,
        };
    }

    if STORAGE_DUMP_KEYS.iter().any(|(_, k)| obj.contains_key(*k)) {
        let mut out = DetectedPayload {
            format: Some(SourceFormat::StorageDump),
            settings,
            ..Default::default()
        };
        for (kind, key) in STORAGE_DUMP_KEYS {
            let items = dumped_array(obj.get(key));
            match kind {
                RecordKind::Member => out.members = items,
                RecordKind::Payment => out.payments = items,
                RecordKind::Activity => out.activities = items,
            }
        }
        return out;
    }

    DetectedPayload {
        settings,
        ..Default::default()
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn array_field(v: Option<&Value>) -> Vec<Value> {
    v.and_then(|v| v.as_array()).cloned().unwrap_or_default()
}

fn dumped_array(v: Option<&Value>) -> Vec<Value> {
    match v {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordIssue {
    pub kind: &'static str,
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub format: Option<&'static str>,
    pub members_imported: usize,
    pub payments_imported: usize,
    pub activities_imported: usize,
    /// Activities dropped for lacking a memberId. Not errors.
    pub activities_skipped: usize,
    pub errors: Vec<RecordIssue>,
    pub settings_restored: Vec<&'static str>,
}

impl ImportReport {
    pub fn changed_collections(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.members_imported > 0 {
            out.push(RecordKind::Member.collection());
        }
        if self.payments_imported > 0 {
            out.push(RecordKind::Payment.collection());
        }
        if self.activities_imported > 0 {
            out.push(RecordKind::Activity.collection());
        }
        if !self.settings_restored.is_empty() {
            out.push("settings");
        }
        out
    }
}

/// Normalizes and upserts every recoverable record. Per-record failures are
/// collected in the report; a failed settings write aborts.
pub fn import_snapshot(
    records: &dyn RecordStore,
    settings: &dyn SettingsStore,
    doc: &Value,
    ctx: &BatchContext,
) -> Result<ImportReport, ImportError> {
    let payload = detect_format(doc);
    if payload.is_empty() {
        return Err(ImportError::NoData);
    }

    let mut report = ImportReport {
        format: payload.format.map(SourceFormat::as_str),
        ..Default::default()
    };

    for (i, raw) in payload.members.iter().enumerate() {
        let outcome = normalize::normalize_member(raw, i, ctx)
            .and_then(|m| upsert_record(records, &m).map_err(|e| format!("{e:#}")));
        match outcome {
            Ok(()) => report.members_imported += 1,
            Err(reason) => report.errors.push(RecordIssue {
                kind: RecordKind::Member.as_str(),
                index: i,
                reason,
            }),
        }
    }

    for (i, raw) in payload.payments.iter().enumerate() {
        let outcome = normalize::normalize_payment(raw, i, ctx)
            .and_then(|p| upsert_record(records, &p).map_err(|e| format!("{e:#}")));
        match outcome {
            Ok(()) => report.payments_imported += 1,
            Err(reason) => report.errors.push(RecordIssue {
                kind: RecordKind::Payment.as_str(),
                index: i,
                reason,
            }),
        }
    }

    for (i, raw) in payload.activities.iter().enumerate() {
        let Some(activity) = normalize::normalize_activity(raw, i, ctx) else {
            report.activities_skipped += 1;
            continue;
        };
        match upsert_record(records, &activity) {
            Ok(()) => report.activities_imported += 1,
            Err(e) => tracing::debug!(index = i, error = %e, "activity write failed"),
        }
    }

    if let Some(blobs) = &payload.settings {
        for (field, key) in SETTINGS_KEYS {
            let Some(v) = blobs.get(field).filter(|v| truthy(v)) else {
                continue;
            };
            let text = match v {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other).context("failed to encode setting")?,
            };
            settings
                .set(key, &text)
                .with_context(|| format!("failed to restore {} settings", field))?;
            report.settings_restored.push(field);
        }
    }

    if !report.errors.is_empty() {
        tracing::warn!(count = report.errors.len(), "import skipped records");
        for issue in &report.errors {
            tracing::warn!(kind = issue.kind, index = issue.index, reason = %issue.reason, "skipped");
        }
    }
    tracing::info!(
        format = report.format.unwrap_or("unknown"),
        members = report.members_imported,
        payments = report.payments_imported,
        activities = report.activities_imported,
        "import finished"
    );
    Ok(report)
}
