use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::model::RecordKind;
use crate::normalize::{check_record, text, RecordCheck};
use crate::snapshot::SETTINGS_KEYS;
use crate::store::{RecordStore, SettingsStore};

pub const CLEAR_ALL_CONFIRMATION: &str = "DELETE ALL DATA";

const MAX_REPORTED_ISSUES: usize = 200;
const UNKNOWN_MEMBER: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionHealth {
    pub total: usize,
    pub corrupt: usize,
    pub invalid: usize,
    pub orphaned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub kind: &'static str,
    pub id: String,
    pub problem: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub members: CollectionHealth,
    pub payments: CollectionHealth,
    pub activities: CollectionHealth,
    pub duplicate_invoices: Vec<String>,
    pub issues: Vec<HealthIssue>,
    pub issues_truncated: bool,
    /// False only when a cleanup would remove something.
    pub healthy: bool,
}

impl HealthReport {
    fn collection_mut(&mut self, kind: RecordKind) -> &mut CollectionHealth {
        match kind {
            RecordKind::Member => &mut self.members,
            RecordKind::Payment => &mut self.payments,
            RecordKind::Activity => &mut self.activities,
        }
    }

    fn note(&mut self, kind: RecordKind, id: &str, problem: String) {
        if self.issues.len() >= MAX_REPORTED_ISSUES {
            self.issues_truncated = true;
            return;
        }
        self.issues.push(HealthIssue {
            kind: kind.as_str(),
            id: id.to_string(),
            problem,
        });
    }
}

/// Read-only scan of every collection. Corrupt records are the ones the
/// importer would reject; invalid ones would be coerced on the next import.
pub fn check_health(records: &dyn RecordStore) -> anyhow::Result<HealthReport> {
    let members = records.entries(RecordKind::Member)?;
    let payments = records.entries(RecordKind::Payment)?;
    let activities = records.entries(RecordKind::Activity)?;

    let member_ids: HashSet<String> = members.iter().map(|(id, _)| id.clone()).collect();
    let mut report = HealthReport::default();

    for (kind, rows) in [
        (RecordKind::Member, &members),
        (RecordKind::Payment, &payments),
        (RecordKind::Activity, &activities),
    ] {
        report.collection_mut(kind).total = rows.len();
        for (id, doc) in rows {
            match check_record(kind, doc) {
                RecordCheck::Corrupt(reason) => {
                    report.collection_mut(kind).corrupt += 1;
                    report.note(kind, id, reason);
                    continue;
                }
                RecordCheck::Drifted(fields) => {
                    report.collection_mut(kind).invalid += 1;
                    report.note(kind, id, format!("non-canonical {}", fields.join(", ")));
                }
                RecordCheck::Clean => {}
            }
            if kind == RecordKind::Member {
                continue;
            }
            let owner = doc.as_object().and_then(|o| text(o, "memberId"));
            if let Some(owner) = owner {
                if owner != UNKNOWN_MEMBER && !member_ids.contains(&owner) {
                    report.collection_mut(kind).orphaned += 1;
                    report.note(kind, id, format!("unknown member {}", owner));
                }
            }
        }
    }

    let mut invoices: BTreeMap<String, usize> = BTreeMap::new();
    for (_, doc) in &payments {
        if let Some(inv) = doc.as_object().and_then(|o| text(o, "invoiceNumber")) {
            *invoices.entry(inv).or_default() += 1;
        }
    }
    report.duplicate_invoices = invoices
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(inv, _)| inv)
        .collect();

    report.healthy = report.members.corrupt == 0
        && report.payments.corrupt == 0
        && report.activities.corrupt == 0;
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalCounts {
    pub members: usize,
    pub payments: usize,
    pub activities: usize,
}

impl RemovalCounts {
    fn add(&mut self, kind: RecordKind, n: usize) {
        match kind {
            RecordKind::Member => self.members += n,
            RecordKind::Payment => self.payments += n,
            RecordKind::Activity => self.activities += n,
        }
    }

    pub fn total(&self) -> usize {
        self.members + self.payments + self.activities
    }
}

/// Deletes every record the importer would reject.
pub fn cleanup(records: &dyn RecordStore) -> anyhow::Result<RemovalCounts> {
    let mut removed = RemovalCounts::default();
    for kind in RecordKind::ALL {
        for (id, doc) in records.entries(kind)? {
            if let RecordCheck::Corrupt(reason) = check_record(kind, &doc) {
                if records.delete(kind, &id)? {
                    tracing::debug!(kind = kind.as_str(), id = %id, reason = %reason, "removed");
                    removed.add(kind, 1);
                }
            }
        }
    }
    tracing::info!(removed = removed.total(), "cleanup finished");
    Ok(removed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    /// None when the window reaches past the earliest representable date.
    pub cutoff: Option<String>,
    pub activities_removed: usize,
}

/// Prunes activities older than `older_than_days` and compacts the store.
/// Activities whose timestamp does not parse are kept, and so is everything
/// when the window is too large to compute a cutoff.
pub fn optimize(
    records: &dyn RecordStore,
    older_than_days: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<OptimizeReport> {
    let cutoff = Duration::try_days(older_than_days.max(0))
        .and_then(|window| now.checked_sub_signed(window));
    let mut removed = 0;
    for (id, doc) in records.entries(RecordKind::Activity)? {
        let stamp = doc
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let expired = matches!((stamp, cutoff), (Some(t), Some(c)) if t < c);
        if expired && records.delete(RecordKind::Activity, &id)? {
            removed += 1;
        }
    }
    records.compact()?;
    tracing::info!(removed, days = older_than_days, "optimize finished");
    Ok(OptimizeReport {
        cutoff: cutoff.map(crate::normalize::iso_millis),
        activities_removed: removed,
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub removed: RemovalCounts,
    pub settings_removed: Vec<&'static str>,
}

pub fn clear_all(
    records: &dyn RecordStore,
    settings: &dyn SettingsStore,
) -> anyhow::Result<ClearReport> {
    let mut report = ClearReport::default();
    for kind in RecordKind::ALL {
        let n = records.clear(kind)?;
        report.removed.add(kind, n);
    }
    for (field, key) in SETTINGS_KEYS {
        if settings.remove(key)? {
            report.settings_removed.push(field);
        }
    }
    tracing::warn!(removed = report.removed.total(), "all data cleared");
    Ok(report)
}

/// Settings blobs that are present but not valid JSON.
pub fn unreadable_settings(settings: &dyn SettingsStore) -> anyhow::Result<Vec<&'static str>> {
    let mut out = Vec::new();
    for (field, key) in SETTINGS_KEYS {
        if let Some(raw) = settings.get(key)? {
            if serde_json::from_str::<Value>(&raw).is_err() {
                out.push(field);
            }
        }
    }
    Ok(out)
}
