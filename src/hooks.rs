//! Hooks and procedural validators, bound by name and referenced from resource schemas.
//!
//! In-transaction [`Hook`]s run before or after a write and may change the record (before) or
//! issue further statements on the same transaction. [`AsyncHook`]s only run at after points:
//! they are queued on the transaction and handed to the [`HookDispatcher`] once the outermost
//! transaction commits. Their failures are logged, never returned to the caller.

use crate::config::EngineConfig;
use crate::db::Connection;
use crate::error::{EngineError, SchemaError, ValidationReport};
use crate::schema::{HookPoint, ResourceSchema, SchemaRegistry};
use crate::tracker::ChangeSet;
use crate::transaction::Transaction;
use crate::value::Record;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn before(&self) -> HookPoint {
        match self {
            Operation::Create => HookPoint::BeforeCreate,
            Operation::Update => HookPoint::BeforeUpdate,
            Operation::Delete => HookPoint::BeforeDelete,
        }
    }

    pub fn after(&self) -> HookPoint {
        match self {
            Operation::Create => HookPoint::AfterCreate,
            Operation::Update => HookPoint::AfterUpdate,
            Operation::Delete => HookPoint::AfterDelete,
        }
    }
}

/// What an in-transaction hook sees. `changes.current()` is the record being written; after
/// hooks also see what changed relative to the loaded row.
pub struct HookContext<'a> {
    pub resource: &'a ResourceSchema,
    pub operation: Operation,
    pub point: HookPoint,
    pub changes: &'a mut ChangeSet,
    pub conn: &'a mut dyn Connection,
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: &mut HookContext<'_>) -> Result<(), EngineError>;
}

/// Post-commit notification payload.
#[derive(Clone, Debug, PartialEq)]
pub struct HookEvent {
    pub resource: String,
    pub operation: Operation,
    pub record: Record,
    pub changed_fields: Vec<String>,
}

#[async_trait]
pub trait AsyncHook: Send + Sync {
    async fn call(&self, event: HookEvent) -> Result<(), EngineError>;
}

/// Resource-level check; adds violations to the shared report instead of failing fast.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, resource: &ResourceSchema, record: &Record, report: &mut ValidationReport);
}

/// Synchronous closure as a [`Hook`].
pub struct FnHook<F>(F);

impl<F> FnHook<F>
where
    F: Fn(&mut HookContext<'_>) -> Result<(), EngineError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnHook(f)
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&mut HookContext<'_>) -> Result<(), EngineError> + Send + Sync,
{
    async fn run(&self, ctx: &mut HookContext<'_>) -> Result<(), EngineError> {
        (self.0)(ctx)
    }
}

/// Closure as a [`RecordValidator`].
pub struct FnValidator<F>(F);

impl<F> FnValidator<F>
where
    F: Fn(&ResourceSchema, &Record, &mut ValidationReport) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnValidator(f)
    }
}

impl<F> RecordValidator for FnValidator<F>
where
    F: Fn(&ResourceSchema, &Record, &mut ValidationReport) + Send + Sync,
{
    fn validate(&self, resource: &ResourceSchema, record: &Record, report: &mut ValidationReport) {
        (self.0)(resource, record, report)
    }
}

/// A deferred async hook invocation, queued on a transaction until commit.
pub struct AsyncTask {
    pub name: String,
    pub hook: Arc<dyn AsyncHook>,
    pub event: HookEvent,
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("name", &self.name)
            .field("event", &self.event)
            .finish()
    }
}

/// Name -> implementation bindings for everything resource schemas reference.
#[derive(Clone, Default)]
pub struct HookExecutor {
    hooks: HashMap<String, Arc<dyn Hook>>,
    async_hooks: HashMap<String, Arc<dyn AsyncHook>>,
    validators: HashMap<String, Arc<dyn RecordValidator>>,
}

impl HookExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(mut self, name: impl Into<String>, hook: impl Hook + 'static) -> Self {
        self.hooks.insert(name.into(), Arc::new(hook));
        self
    }

    pub fn async_hook(mut self, name: impl Into<String>, hook: impl AsyncHook + 'static) -> Self {
        self.async_hooks.insert(name.into(), Arc::new(hook));
        self
    }

    pub fn validator(mut self, name: impl Into<String>, validator: impl RecordValidator + 'static) -> Self {
        self.validators.insert(name.into(), Arc::new(validator));
        self
    }

    /// Every hook and validator name referenced by a registered resource must be bound, and
    /// async hooks may only be bound at after points.
    pub fn verify(&self, registry: &SchemaRegistry) -> Result<(), SchemaError> {
        for schema in registry.all() {
            for binding in &schema.hooks {
                let bound = self.hooks.contains_key(&binding.name)
                    || (!binding.point.is_before() && self.async_hooks.contains_key(&binding.name));
                if !bound {
                    return Err(SchemaError::UnboundHook {
                        resource: schema.name.clone(),
                        name: binding.name.clone(),
                    });
                }
            }
            if let Some(name) = schema.validators.iter().find(|v| !self.validators.contains_key(*v)) {
                return Err(SchemaError::UnboundHook {
                    resource: schema.name.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn sync_hook(&self, schema: &ResourceSchema, name: &str) -> Result<&Arc<dyn Hook>, EngineError> {
        self.hooks.get(name).ok_or_else(|| {
            EngineError::Schema(SchemaError::UnboundHook {
                resource: schema.name.clone(),
                name: name.to_string(),
            })
        })
    }

    /// Before-hooks in declaration order. The first failure aborts the operation.
    pub async fn run_before<C: Connection>(
        &self,
        tx: &mut Transaction<C>,
        schema: &ResourceSchema,
        operation: Operation,
        changes: &mut ChangeSet,
    ) -> Result<(), EngineError> {
        let point = operation.before();
        for name in schema.hooks_at(point) {
            let hook = self.sync_hook(schema, name)?;
            tracing::debug!(resource = %schema.name, hook = %name, ?point, "running hook");
            let mut ctx = HookContext {
                resource: schema,
                operation,
                point,
                changes: &mut *changes,
                conn: &mut *tx,
            };
            hook.run(&mut ctx).await?;
        }
        Ok(())
    }

    /// After-hooks in declaration order: synchronous ones run now on the transaction, async
    /// ones are queued for dispatch after commit.
    pub async fn run_after<C: Connection>(
        &self,
        tx: &mut Transaction<C>,
        schema: &ResourceSchema,
        operation: Operation,
        changes: &mut ChangeSet,
    ) -> Result<(), EngineError> {
        let point = operation.after();
        for name in schema.hooks_at(point) {
            if let Some(hook) = self.hooks.get(name) {
                tracing::debug!(resource = %schema.name, hook = %name, ?point, "running hook");
                let mut ctx = HookContext {
                    resource: schema,
                    operation,
                    point,
                    changes: &mut *changes,
                    conn: &mut *tx,
                };
                hook.run(&mut ctx).await?;
            } else if let Some(hook) = self.async_hooks.get(name) {
                tx.defer(AsyncTask {
                    name: name.to_string(),
                    hook: Arc::clone(hook),
                    event: HookEvent {
                        resource: schema.name.clone(),
                        operation,
                        record: changes.current().clone(),
                        changed_fields: changes.changed_fields(),
                    },
                });
            } else {
                self.sync_hook(schema, name)?;
            }
        }
        Ok(())
    }

    /// Run the resource's procedural validators into `report`.
    pub fn validate(&self, schema: &ResourceSchema, record: &Record, report: &mut ValidationReport) {
        for name in &schema.validators {
            match self.validators.get(name) {
                Some(v) => v.validate(schema, record, report),
                None => report.add_resource(name, format!("validator '{}' is not bound", name)),
            }
        }
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded queue feeding a fixed set of tokio workers. Fire-and-forget: a full queue drops
/// the task with a warning, a failing or panicking hook is logged.
#[derive(Clone)]
pub struct HookDispatcher {
    sender: mpsc::Sender<AsyncTask>,
    stats: Arc<DispatchStats>,
}

impl HookDispatcher {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn start(workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<AsyncTask>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(DispatchStats::default());
        for worker in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let stats = Arc::clone(&stats);
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(task) = next else { break };
                    run_task(worker, task, &stats).await;
                }
                tracing::debug!(worker, "hook worker stopped");
            });
        }
        tracing::info!(workers = workers.max(1), capacity = capacity.max(1), "hook dispatcher started");
        Self { sender, stats }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::start(config.hook_workers, config.hook_queue)
    }

    pub fn dispatch(&self, task: AsyncTask) {
        if let Err(e) = self.sender.try_send(task) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            let (reason, task) = match e {
                mpsc::error::TrySendError::Full(t) => ("queue full", t),
                mpsc::error::TrySendError::Closed(t) => ("dispatcher closed", t),
            };
            tracing::warn!(hook = %task.name, resource = %task.event.resource, reason, "async hook dropped");
        }
    }

    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

async fn run_task(worker: usize, task: AsyncTask, stats: &DispatchStats) {
    let AsyncTask { name, hook, event } = task;
    let resource = event.resource.clone();
    match AssertUnwindSafe(hook.call(event)).catch_unwind().await {
        Ok(Ok(())) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker, hook = %name, resource = %resource, error = %e, "async hook failed");
        }
        Err(_) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(worker, hook = %name, resource = %resource, "async hook panicked");
        }
    }
}
