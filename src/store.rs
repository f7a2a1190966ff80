use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::model::{Record, RecordKind};

/// Document store for the three record collections. Upserts are keyed by
/// `(kind, id)` and the last write wins.
pub trait RecordStore {
    /// Row key and body of every stored document, in storage order. The key
    /// still addresses a row whose body lost its `id` field.
    fn entries(&self, kind: RecordKind) -> anyhow::Result<Vec<(String, Value)>>;
    fn upsert(&self, kind: RecordKind, id: &str, record: &Value) -> anyhow::Result<()>;
    fn delete(&self, kind: RecordKind, id: &str) -> anyhow::Result<bool>;
    fn clear(&self, kind: RecordKind) -> anyhow::Result<usize>;

    fn get_all(&self, kind: RecordKind) -> anyhow::Result<Vec<Value>> {
        Ok(self.entries(kind)?.into_iter().map(|(_, v)| v).collect())
    }

    /// Reclaim space after bulk deletes.
    fn compact(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Key-value store holding the settings blobs (JSON text).
pub trait SettingsStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<bool>;
}

pub fn upsert_record<R: Record>(store: &dyn RecordStore, record: &R) -> anyhow::Result<()> {
    let value = serde_json::to_value(record).context("failed to serialize record")?;
    store.upsert(R::KIND, record.id(), &value)
}

/// Works on a plain connection and on a transaction (which derefs to one).
pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl RecordStore for SqliteStore<'_> {
    fn entries(&self, kind: RecordKind) -> anyhow::Result<Vec<(String, Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM records WHERE kind = ? ORDER BY rowid")?;
        let rows = stmt
            .query_map([kind.as_str()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to read {}", kind.collection()))?;
        // A body that is not JSON is kept as a string so health checks can flag it.
        Ok(rows
            .into_iter()
            .map(|(id, body)| {
                let value: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
                (id, value)
            })
            .collect())
    }

    fn upsert(&self, kind: RecordKind, id: &str, record: &Value) -> anyhow::Result<()> {
        let body = serde_json::to_string(record)?;
        self.conn
            .execute(
                "INSERT INTO records(kind, id, body, updated_at)
                 VALUES(?, ?, ?, datetime('now'))
                 ON CONFLICT(kind, id) DO UPDATE SET
                   body = excluded.body,
                   updated_at = excluded.updated_at",
                (kind.as_str(), id, &body),
            )
            .with_context(|| format!("failed to upsert {} {}", kind.as_str(), id))?;
        Ok(())
    }

    fn delete(&self, kind: RecordKind, id: &str) -> anyhow::Result<bool> {
        let n = self.conn.execute(
            "DELETE FROM records WHERE kind = ? AND id = ?",
            (kind.as_str(), id),
        )?;
        Ok(n > 0)
    }

    fn clear(&self, kind: RecordKind) -> anyhow::Result<usize> {
        let n = self
            .conn
            .execute("DELETE FROM records WHERE kind = ?", [kind.as_str()])?;
        Ok(n)
    }

    fn compact(&self) -> anyhow::Result<()> {
        self.conn.execute_batch("VACUUM").context("vacuum failed")?;
        Ok(())
    }
}

impl SettingsStore for SqliteStore<'_> {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let v = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?;
        Ok(v)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings(key, value) VALUES(?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                (key, value),
            )
            .with_context(|| format!("failed to store setting {}", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let n = self.conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
pub use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap};

    use serde_json::Value;

    use super::{RecordStore, SettingsStore};
    use crate::model::RecordKind;

    /// In-memory store for unit tests, with switchable write and read failures.
    #[derive(Default)]
    pub struct MemoryStore {
        records: RefCell<HashMap<RecordKind, BTreeMap<String, Value>>>,
        settings: RefCell<HashMap<String, String>>,
        fail_ids: Vec<String>,
        fail_reads: bool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_writes(mut self, ids: &[&str]) -> Self {
            self.fail_ids = ids.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn failing_reads(mut self) -> Self {
            self.fail_reads = true;
            self
        }

        pub fn count(&self, kind: RecordKind) -> usize {
            self.records.borrow().get(&kind).map_or(0, |m| m.len())
        }

        pub fn record(&self, kind: RecordKind, id: &str) -> Option<Value> {
            self.records.borrow().get(&kind)?.get(id).cloned()
        }
    }

    impl RecordStore for MemoryStore {
        fn entries(&self, kind: RecordKind) -> anyhow::Result<Vec<(String, Value)>> {
            if self.fail_reads {
                anyhow::bail!("store offline");
            }
            Ok(self
                .records
                .borrow()
                .get(&kind)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default())
        }

        fn upsert(&self, kind: RecordKind, id: &str, record: &Value) -> anyhow::Result<()> {
            if self.fail_ids.iter().any(|f| f == id) {
                anyhow::bail!("write rejected for {}", id);
            }
            self.records
                .borrow_mut()
                .entry(kind)
                .or_default()
                .insert(id.to_string(), record.clone());
            Ok(())
        }

        fn delete(&self, kind: RecordKind, id: &str) -> anyhow::Result<bool> {
            Ok(self
                .records
                .borrow_mut()
                .get_mut(&kind)
                .and_then(|m| m.remove(id))
                .is_some())
        }

        fn clear(&self, kind: RecordKind) -> anyhow::Result<usize> {
            Ok(self
                .records
                .borrow_mut()
                .remove(&kind)
                .map_or(0, |m| m.len()))
        }
    }

    impl SettingsStore for MemoryStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.settings.borrow().get(key).cloned())
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.settings
                .borrow_mut()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn remove(&self, key: &str) -> anyhow::Result<bool> {
            Ok(self.settings.borrow_mut().remove(key).is_some())
        }
    }
}
