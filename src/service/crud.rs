//! CRUD orchestration: each write runs hooks, validation and the statement in one transaction.

use crate::config::EngineConfig;
use crate::db::{Connection, Database, PgDatabase};
use crate::error::EngineError;
use crate::hooks::{HookDispatcher, HookExecutor, Operation};
use crate::loader::{LazyRecord, RelationshipLoader};
use crate::migration::MigrationLedger;
use crate::schema::{ResourceSchema, SchemaRegistry};
use crate::service::validation::{ensure_known_fields, RecordChecks};
use crate::sql::{delete, insert, update, Query};
use crate::tracker::ChangeSet;
use crate::transaction::{Transaction, TransactionManager};
use crate::value::{Record, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

struct Inner<D: Database> {
    registry: Arc<SchemaRegistry>,
    tx: TransactionManager<D>,
    hooks: HookExecutor,
    dispatcher: HookDispatcher,
    loader: RelationshipLoader,
    config: EngineConfig,
}

/// Entry point for callers: schema-shaped records in, schema-shaped records out.
///
/// Cloning is cheap; clones share the registry, pool and hook workers.
pub struct Engine<D: Database> {
    inner: Arc<Inner<D>>,
}

impl<D: Database> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Engine<PgDatabase> {
    /// Connect to PostgreSQL with `config` and build an engine over `registry`.
    pub async fn connect(
        config: EngineConfig,
        registry: Arc<SchemaRegistry>,
        hooks: HookExecutor,
    ) -> Result<Self, EngineError> {
        let db = PgDatabase::connect(&config).await?;
        Self::new(Arc::new(db), registry, hooks, config)
    }
}

impl<D: Database> Engine<D> {
    /// Seals the registry if it is still open, checks that every hook and validator name it
    /// references is bound, and starts the async hook workers. Must be called inside a tokio
    /// runtime.
    pub fn new(
        db: Arc<D>,
        registry: Arc<SchemaRegistry>,
        hooks: HookExecutor,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        if !registry.is_sealed() {
            registry.seal()?;
        }
        hooks.verify(&registry)?;
        let dispatcher = HookDispatcher::from_config(&config);
        let tx = TransactionManager::from_config(db, &config).with_dispatcher(dispatcher.clone());
        let loader = RelationshipLoader::new(Arc::clone(&registry), config.max_include_depth);
        tracing::info!(resources = registry.len(), "engine ready");
        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                tx,
                hooks,
                dispatcher,
                loader,
                config,
            }),
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn transactions(&self) -> &TransactionManager<D> {
        &self.inner.tx
    }

    pub fn dispatcher(&self) -> &HookDispatcher {
        &self.inner.dispatcher
    }

    pub fn loader(&self) -> &RelationshipLoader {
        &self.inner.loader
    }

    /// Ledger in the configured ledger schema, sharing this engine's transaction settings.
    pub fn ledger(&self) -> MigrationLedger<D> {
        MigrationLedger::new(self.inner.tx.clone(), &self.inner.config.ledger_schema)
    }

    fn schema(&self, resource: &str) -> Result<Arc<ResourceSchema>, EngineError> {
        self.inner.registry.resource(resource)
    }

    fn checks(&self) -> RecordChecks<'_> {
        RecordChecks {
            registry: &self.inner.registry,
            hooks: &self.inner.hooks,
        }
    }

    // ---- reads ----

    pub async fn find(&self, resource: &str, id: impl Into<Value>) -> Result<Record, EngineError> {
        self.find_with::<&str>(resource, id, &[]).await
    }

    /// [`Engine::find`] with relationship paths eager-loaded onto the record.
    pub async fn find_with<S: AsRef<str>>(
        &self,
        resource: &str,
        id: impl Into<Value>,
        includes: &[S],
    ) -> Result<Record, EngineError> {
        let schema = self.schema(resource)?;
        let id = id.into();
        let q = Query::new(resource)
            .where_eq(schema.primary_key.clone(), id.clone())
            .compile(&self.inner.registry, self.inner.config.max_limit)?;
        let mut conn = self.inner.tx.database().acquire().await?;
        let row = conn.fetch_optional(&q).await?.ok_or_else(|| not_found(&schema, &id))?;
        let mut rows = [row];
        self.inner
            .loader
            .eager_load(&mut conn, resource, &mut rows, includes)
            .await?;
        let [row] = rows;
        Ok(row)
    }

    /// Rows matching `query`, with its includes loaded. The configured default limit applies
    /// when the query sets none.
    pub async fn query(&self, query: &Query) -> Result<Vec<Record>, EngineError> {
        let query = match query.get_limit() {
            Some(_) => query.clone(),
            None => query.clone().limit(self.inner.config.default_limit),
        };
        let q = query.compile(&self.inner.registry, self.inner.config.max_limit)?;
        let mut conn = self.inner.tx.database().acquire().await?;
        let mut rows = conn.fetch_all(&q).await?;
        self.inner
            .loader
            .eager_load(&mut conn, query.resource(), &mut rows, query.includes())
            .await?;
        Ok(rows)
    }

    pub async fn count(&self, query: &Query) -> Result<i64, EngineError> {
        let q = query.compile_count(&self.inner.registry)?;
        let mut conn = self.inner.tx.database().acquire().await?;
        let row = conn.fetch_optional(&q).await?;
        Ok(row
            .as_ref()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    /// Record whose relationships load on first access.
    pub fn lazy(&self, resource: &str, record: Record) -> Result<LazyRecord<D>, EngineError> {
        let schema = self.schema(resource)?;
        Ok(LazyRecord::new(
            Arc::clone(self.inner.tx.database()),
            self.inner.loader.clone(),
            schema,
            record,
        ))
    }

    // ---- writes ----

    pub async fn create(&self, resource: &str, data: Record) -> Result<Record, EngineError> {
        let resource = resource.to_string();
        let engine = self.clone();
        self.inner
            .tx
            .run_with_retry(move |tx| {
                let engine = engine.clone();
                let resource = resource.clone();
                let data = data.clone();
                async move { engine.create_in(tx, &resource, data).await }.boxed()
            })
            .await
    }

    /// [`Engine::create`] from a JSON object; unknown keys and type mismatches are rejected.
    pub async fn create_json(&self, resource: &str, data: &serde_json::Value) -> Result<Record, EngineError> {
        let schema = self.schema(resource)?;
        let record = Record::from_json(&schema, data)?;
        self.create(resource, record).await
    }

    pub async fn update(&self, resource: &str, id: impl Into<Value>, changes: Record) -> Result<Record, EngineError> {
        let resource = resource.to_string();
        let id = id.into();
        let engine = self.clone();
        self.inner
            .tx
            .run_with_retry(move |tx| {
                let engine = engine.clone();
                let resource = resource.clone();
                let id = id.clone();
                let changes = changes.clone();
                async move { engine.update_in(tx, &resource, id, changes).await }.boxed()
            })
            .await
    }

    pub async fn update_json(
        &self,
        resource: &str,
        id: impl Into<Value>,
        changes: &serde_json::Value,
    ) -> Result<Record, EngineError> {
        let schema = self.schema(resource)?;
        let record = Record::from_json(&schema, changes)?;
        self.update(resource, id, record).await
    }

    pub async fn delete(&self, resource: &str, id: impl Into<Value>) -> Result<(), EngineError> {
        let resource = resource.to_string();
        let id = id.into();
        let engine = self.clone();
        self.inner
            .tx
            .run_with_retry(move |tx| {
                let engine = engine.clone();
                let resource = resource.clone();
                let id = id.clone();
                async move { engine.delete_in(tx, &resource, id).await }.boxed()
            })
            .await
    }

    /// Run several operations as one transaction, re-run as a whole on conflicts. Use the
    /// `*_in` methods inside `f`.
    pub async fn unit_of_work<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Transaction<D::Conn>) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        self.inner.tx.run_with_retry(f).await
    }

    /// Load a record for mutation. Edit it through [`Tracked::set`], then [`Engine::save`].
    pub async fn load(&self, resource: &str, id: impl Into<Value>) -> Result<Tracked, EngineError> {
        let id = id.into();
        let record = self.find(resource, id.clone()).await?;
        Ok(Tracked {
            resource: resource.to_string(),
            id,
            changes: ChangeSet::loaded(record),
        })
    }

    /// Write the tracked changes. An unmodified record returns as-is without touching the
    /// database; a successful save re-snapshots the tracker.
    pub async fn save(&self, tracked: &mut Tracked) -> Result<Record, EngineError> {
        if !tracked.changes.is_dirty() {
            return Ok(tracked.changes.current().clone());
        }
        let saved = self
            .update(&tracked.resource, tracked.id.clone(), tracked.changes.changed_data())
            .await?;
        tracked.changes.reset(Some(saved.clone()));
        Ok(saved)
    }

    // ---- in-transaction pipelines ----

    /// before-hooks, validate, insert, after-hooks.
    pub async fn create_in(
        &self,
        tx: &mut Transaction<D::Conn>,
        resource: &str,
        data: Record,
    ) -> Result<Record, EngineError> {
        let schema = self.schema(resource)?;
        ensure_known_fields(&schema, &data)?;
        let mut changes = ChangeSet::created(data);

        self.inner
            .hooks
            .run_before(tx, &schema, Operation::Create, &mut changes)
            .await?;
        ensure_known_fields(&schema, changes.current())?;
        self.checks()
            .run(&mut *tx, &schema, &mut changes, None)
            .await?
            .into_result()?;

        let q = insert(&schema, changes.current());
        let row = tx
            .fetch_optional(&q)
            .await?
            .ok_or_else(|| EngineError::TransactionFatal(format!("insert into {} returned no row", schema.name)))?;
        changes.merge(row);

        self.inner
            .hooks
            .run_after(tx, &schema, Operation::Create, &mut changes)
            .await?;
        tracing::debug!(resource = %schema.name, "created");
        Ok(changes.into_current())
    }

    /// Load `FOR UPDATE`, merge, before-hooks, validate, write changed fields only (nothing
    /// when nothing changed), after-hooks.
    pub async fn update_in(
        &self,
        tx: &mut Transaction<D::Conn>,
        resource: &str,
        id: Value,
        incoming: Record,
    ) -> Result<Record, EngineError> {
        let schema = self.schema(resource)?;
        ensure_known_fields(&schema, &incoming)?;
        if let Some(new_id) = incoming.get(&schema.primary_key) {
            if *new_id != id {
                return Err(EngineError::QueryBuild(format!(
                    "{}.{} cannot be changed",
                    schema.name, schema.primary_key
                )));
            }
        }
        let existing = self.load_locked(tx, &schema, &id).await?;
        let mut changes = ChangeSet::loaded(existing);
        changes.merge(incoming);

        self.inner
            .hooks
            .run_before(tx, &schema, Operation::Update, &mut changes)
            .await?;
        ensure_known_fields(&schema, changes.current())?;
        self.checks()
            .run(&mut *tx, &schema, &mut changes, Some(&id))
            .await?
            .into_result()?;

        let changed = changes.changed_data();
        match update(&schema, &id, &changed) {
            Some(q) => {
                let row = tx.fetch_optional(&q).await?.ok_or_else(|| not_found(&schema, &id))?;
                changes.merge(row);
                tracing::debug!(resource = %schema.name, id = %id, fields = ?changed.fields().collect::<Vec<_>>(), "updated");
            }
            None => tracing::debug!(resource = %schema.name, id = %id, "no changes; write skipped"),
        }

        self.inner
            .hooks
            .run_after(tx, &schema, Operation::Update, &mut changes)
            .await?;
        Ok(changes.into_current())
    }

    /// before-hooks, delete, after-hooks. Hooks see the row as it was.
    pub async fn delete_in(
        &self,
        tx: &mut Transaction<D::Conn>,
        resource: &str,
        id: Value,
    ) -> Result<(), EngineError> {
        let schema = self.schema(resource)?;
        let existing = self.load_locked(tx, &schema, &id).await?;
        let mut changes = ChangeSet::loaded(existing);

        self.inner
            .hooks
            .run_before(tx, &schema, Operation::Delete, &mut changes)
            .await?;
        tx.fetch_optional(&delete(&schema, &id))
            .await?
            .ok_or_else(|| not_found(&schema, &id))?;
        self.inner
            .hooks
            .run_after(tx, &schema, Operation::Delete, &mut changes)
            .await?;
        tracing::debug!(resource = %schema.name, id = %id, "deleted");
        Ok(())
    }

    async fn load_locked(
        &self,
        tx: &mut Transaction<D::Conn>,
        schema: &ResourceSchema,
        id: &Value,
    ) -> Result<Record, EngineError> {
        let q = Query::new(&schema.name)
            .where_eq(schema.primary_key.clone(), id.clone())
            .for_update()
            .compile(&self.inner.registry, self.inner.config.max_limit)?;
        tx.fetch_optional(&q).await?.ok_or_else(|| not_found(schema, id))
    }
}

fn not_found(schema: &ResourceSchema, id: &Value) -> EngineError {
    EngineError::NotFound {
        resource: schema.name.clone(),
        id: id.to_string(),
    }
}

/// A loaded record plus its change tracker.
#[derive(Clone, Debug)]
pub struct Tracked {
    resource: String,
    id: Value,
    changes: ChangeSet,
}

impl Tracked {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn record(&self) -> &Record {
        self.changes.current()
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.changes.set(field, value);
    }
}
