//! Applied-migration ledger kept in `<ledger_schema>.schema_migrations`.

use super::{Migration, SchemaSnapshot};
use crate::db::{Connection, Database};
use crate::error::EngineError;
use crate::sql::{qualified_table, quoted, QueryBuf};
use crate::transaction::TransactionManager;
use crate::value::{Record, Value};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;

const LEDGER_TABLE: &str = "schema_migrations";

/// Whether the caller has accepted breaking or data-loss changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// Only safe migrations run.
    Auto,
    Confirmed,
}

#[derive(Clone, Debug, Serialize)]
pub struct LedgerEntry {
    pub version: i64,
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub snapshot: Option<SchemaSnapshot>,
}

impl LedgerEntry {
    fn from_record(r: &Record) -> Result<Self, EngineError> {
        let version = r
            .get("version")
            .and_then(Value::as_i64)
            .ok_or_else(|| EngineError::Migration("ledger row without version".into()))?;
        let snapshot = match r.get("snapshot").and_then(Value::as_str) {
            Some(json) => Some(
                serde_json::from_str(json)
                    .map_err(|e| EngineError::Migration(format!("ledger snapshot {}: {}", version, e)))?,
            ),
            None => None,
        };
        Ok(LedgerEntry {
            version,
            name: r.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            applied_at: match r.get("applied_at") {
                Some(Value::Timestamp(t)) => Some(*t),
                _ => None,
            },
            snapshot,
        })
    }
}

/// Records applied migrations and runs their scripts, each inside one transaction together
/// with its ledger row.
pub struct MigrationLedger<D: Database> {
    tx: TransactionManager<D>,
    schema: String,
}

impl<D: Database> MigrationLedger<D> {
    pub fn new(tx: TransactionManager<D>, ledger_schema: &str) -> Self {
        Self {
            tx,
            schema: ledger_schema.to_string(),
        }
    }

    fn table(&self) -> String {
        qualified_table(&self.schema, LEDGER_TABLE)
    }

    /// CREATE SCHEMA / TABLE IF NOT EXISTS for the ledger itself.
    pub async fn ensure_table(&self) -> Result<(), EngineError> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(&self.schema)),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\"version\" BIGINT PRIMARY KEY, \"name\" TEXT NOT NULL, \"applied_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW(), \"snapshot\" TEXT)",
                self.table()
            ),
        ];
        self.tx
            .run(move |tx| {
                async move {
                    for sql in statements {
                        tx.execute(&QueryBuf::raw(sql)).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await
    }

    /// Applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<LedgerEntry>, EngineError> {
        let q = QueryBuf::raw(format!(
            "SELECT main.\"version\", main.\"name\", main.\"applied_at\", main.\"snapshot\" FROM {} main ORDER BY main.\"version\"",
            self.table()
        ));
        let mut conn = self.tx.database().acquire().await?;
        let rows = conn.fetch_all(&q).await?;
        rows.iter().map(LedgerEntry::from_record).collect()
    }

    pub async fn next_version(&self) -> Result<i64, EngineError> {
        Ok(self.applied().await?.last().map(|e| e.version + 1).unwrap_or(1))
    }

    /// Target snapshot of the newest applied migration that recorded one.
    pub async fn latest_snapshot(&self) -> Result<Option<SchemaSnapshot>, EngineError> {
        Ok(self.applied().await?.into_iter().rev().find_map(|e| e.snapshot))
    }

    /// Migration from the latest recorded snapshot to `current`, or None when nothing changed.
    pub async fn plan(&self, name: &str, current: &SchemaSnapshot) -> Result<Option<Migration>, EngineError> {
        let applied = self.applied().await?;
        let version = applied.last().map(|e| e.version + 1).unwrap_or(1);
        let base = applied
            .into_iter()
            .rev()
            .find_map(|e| e.snapshot)
            .unwrap_or_default();
        let migration = Migration::between(version, name, &base, current)?;
        Ok((!migration.is_empty()).then_some(migration))
    }

    /// Run the forward script and record the migration. With [`Confirmation::Auto`] a breaking
    /// or data-loss migration fails with `MigrationSafety` before anything runs.
    pub async fn apply(&self, migration: &mut Migration, confirmation: Confirmation) -> Result<(), EngineError> {
        if confirmation == Confirmation::Auto {
            migration.ensure_auto_applicable()?;
        }
        let version = migration.version();
        if self.applied().await?.iter().any(|e| e.version == version) {
            return Err(EngineError::Migration(format!("migration {} is already applied", version)));
        }
        let snapshot = match migration.target() {
            Some(s) => Value::Text(
                serde_json::to_string(s).map_err(|e| EngineError::Migration(format!("snapshot: {}", e)))?,
            ),
            None => Value::Null,
        };
        let applied_at = Utc::now();
        let mut insert = QueryBuf::new();
        let values = [
            insert.placeholder(Value::Int(version), "int8"),
            insert.placeholder(Value::Text(migration.name().to_string()), "text"),
            insert.placeholder(Value::Timestamp(applied_at), "timestamptz"),
            insert.placeholder(snapshot, "text"),
        ];
        insert.sql = format!(
            "INSERT INTO {} (\"version\", \"name\", \"applied_at\", \"snapshot\") VALUES ({})",
            self.table(),
            values.join(", ")
        );
        let up = migration.up().to_vec();
        self.tx
            .run(move |tx| {
                async move {
                    for sql in up {
                        tx.execute(&QueryBuf::raw(sql)).await?;
                    }
                    tx.execute(&insert).await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;
        migration.mark_applied(applied_at);
        tracing::info!(
            version,
            name = %migration.name(),
            changes = migration.changes().len(),
            breaking = migration.breaking(),
            data_loss = migration.data_loss(),
            "migration applied"
        );
        Ok(())
    }

    /// Run the reverse script and remove the ledger row. Reverting an additive migration drops
    /// what it added, so [`Confirmation::Auto`] refuses when any reversed change is unsafe.
    pub async fn revert(&self, migration: &Migration, confirmation: Confirmation) -> Result<(), EngineError> {
        let version = migration.version();
        if confirmation == Confirmation::Auto {
            let unsafe_changes: Vec<_> = migration
                .changes()
                .iter()
                .rev()
                .map(|c| c.inverse())
                .filter(|c| !c.is_safe())
                .collect();
            if !unsafe_changes.is_empty() {
                return Err(EngineError::MigrationSafety {
                    version,
                    changes: unsafe_changes,
                });
            }
        }
        if !self.applied().await?.iter().any(|e| e.version == version) {
            return Err(EngineError::Migration(format!("migration {} is not applied", version)));
        }
        let mut delete = QueryBuf::new();
        let ph = delete.placeholder(Value::Int(version), "int8");
        delete.sql = format!("DELETE FROM {} WHERE \"version\" = {}", self.table(), ph);
        let down = migration.down().to_vec();
        self.tx
            .run(move |tx| {
                async move {
                    for sql in down {
                        tx.execute(&QueryBuf::raw(sql)).await?;
                    }
                    tx.execute(&delete).await?;
                    Ok(())
                }
                .boxed()
            })
            .await?;
        tracing::info!(version, name = %migration.name(), "migration reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{blog_registry, MemoryDatabase};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ledger(db: &Arc<MemoryDatabase>) -> MigrationLedger<MemoryDatabase> {
        MigrationLedger::new(TransactionManager::new(Arc::clone(db)), "engine")
    }

    #[tokio::test]
    async fn plans_applies_and_records_snapshots() {
        let db = Arc::new(MemoryDatabase::new());
        let ledger = ledger(&db);
        ledger.ensure_table().await.unwrap();
        assert_eq!(ledger.next_version().await.unwrap(), 1);

        let current = blog_registry().snapshot();
        let mut initial = ledger.plan("initial", &current).await.unwrap().unwrap();
        assert_eq!(initial.version(), 1);
        ledger.apply(&mut initial, Confirmation::Auto).await.unwrap();
        assert!(initial.applied_at().is_some());
        assert!(db
            .statements()
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"public\".\"posts\"")));

        let applied = ledger.applied().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "initial");
        assert!(ledger.latest_snapshot().await.unwrap().unwrap().equivalent(&current));
        assert!(ledger.plan("noop", &current).await.unwrap().is_none());
        assert_eq!(ledger.next_version().await.unwrap(), 2);

        let err = ledger.apply(&mut initial, Confirmation::Confirmed).await.unwrap_err();
        assert!(matches!(err, EngineError::Migration(m) if m.contains("already applied")));
    }

    #[tokio::test]
    async fn unsafe_migrations_need_confirmation_and_revert_removes_the_row() {
        let db = Arc::new(MemoryDatabase::new());
        let ledger = ledger(&db);
        let old = blog_registry().snapshot();
        let mut first = ledger.plan("initial", &old).await.unwrap().unwrap();
        ledger.apply(&mut first, Confirmation::Auto).await.unwrap();

        let mut new = old.clone();
        new.resources.get_mut("posts").unwrap().fields.retain(|f| f.name != "body");
        let mut drop_body = ledger.plan("drop body", &new).await.unwrap().unwrap();
        assert_eq!(drop_body.version(), 2);

        let err = ledger.apply(&mut drop_body, Confirmation::Auto).await.unwrap_err();
        assert!(matches!(err, EngineError::MigrationSafety { version: 2, .. }));
        assert_eq!(ledger.applied().await.unwrap().len(), 1);

        ledger.apply(&mut drop_body, Confirmation::Confirmed).await.unwrap();
        assert!(db
            .statements()
            .contains(&"ALTER TABLE \"public\".\"posts\" DROP COLUMN \"body\"".to_string()));
        assert_eq!(ledger.applied().await.unwrap().len(), 2);

        ledger.revert(&drop_body, Confirmation::Auto).await.unwrap();
        assert!(db
            .statements()
            .contains(&"ALTER TABLE \"public\".\"posts\" ADD COLUMN \"body\" TEXT".to_string()));
        let versions: Vec<i64> = ledger.applied().await.unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1]);
        assert!(ledger.latest_snapshot().await.unwrap().unwrap().equivalent(&old));

        let err = ledger.revert(&drop_body, Confirmation::Confirmed).await.unwrap_err();
        assert!(matches!(err, EngineError::Migration(m) if m.contains("not applied")));
    }
}
