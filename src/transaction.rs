//! Transactions: savepoint nesting, conflict retry with backoff, timeouts and panic rollback.

use crate::config::EngineConfig;
use crate::db::{Connection, Database, IsolationLevel, TxControl};
use crate::error::EngineError;
use crate::hooks::{AsyncTask, HookDispatcher};
use crate::sql::QueryBuf;
use crate::value::Record;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `failed`-th attempt: base * 2^(failed-1), capped at `max_delay`.
    pub fn delay_for(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// One unit of work's handle on a connection. Nested scopes are savepoints on the same handle.
///
/// Consumed by [`Transaction::commit`] or [`Transaction::rollback`]. Dropped while open, the
/// connection is discarded and the server rolls back.
pub struct Transaction<C: Connection> {
    conn: C,
    state: TxState,
    depth: u32,
    savepoints: u32,
    deferred: Vec<AsyncTask>,
}

impl<C: Connection> Transaction<C> {
    pub(crate) async fn begin(
        mut conn: C,
        isolation: IsolationLevel,
        statement_timeout_ms: Option<u64>,
    ) -> Result<Self, EngineError> {
        conn.control(TxControl::Begin(isolation)).await?;
        let mut tx = Transaction {
            conn,
            state: TxState::Open,
            depth: 0,
            savepoints: 0,
            deferred: Vec::new(),
        };
        if let Some(ms) = statement_timeout_ms {
            tx.conn
                .execute(&QueryBuf::raw(format!("SET LOCAL statement_timeout = {}", ms)))
                .await?;
        }
        Ok(tx)
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// 0 at the top level, +1 per enclosing savepoint.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        match self.state {
            TxState::Open => Ok(()),
            other => Err(EngineError::TransactionFatal(format!("transaction is {:?}", other))),
        }
    }

    /// Queue an async after-hook to run once the outermost transaction commits.
    pub fn defer(&mut self, task: AsyncTask) {
        self.deferred.push(task);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Run `f` inside a savepoint. Success releases it; failure or panic rolls back to it,
    /// discards async hooks queued inside, and leaves the enclosing transaction usable.
    pub async fn savepoint<T, F>(&mut self, f: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction<C>) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        self.ensure_open()?;
        self.savepoints += 1;
        let name = format!("sp_{}", self.savepoints);
        let queued = self.deferred.len();
        self.conn.control(TxControl::Savepoint(name.clone())).await?;
        self.depth += 1;
        let outcome = AssertUnwindSafe(f(&mut *self)).catch_unwind().await;
        self.depth -= 1;

        let result = match outcome {
            Ok(r) => r,
            Err(panic) => Err(EngineError::TransactionFatal(format!(
                "unit of work panicked: {}",
                panic_message(&*panic)
            ))),
        };
        match result {
            Ok(v) => {
                self.conn.control(TxControl::ReleaseSavepoint(name)).await?;
                Ok(v)
            }
            Err(e) => {
                self.deferred.truncate(queued);
                if let Err(rb) = self.conn.control(TxControl::RollbackToSavepoint(name.clone())).await {
                    tracing::error!(savepoint = %name, error = %rb, "rollback to savepoint failed");
                    return Err(rb);
                }
                Err(e)
            }
        }
    }

    /// Commit and hand back the async hooks queued during the transaction.
    pub async fn commit(mut self) -> Result<Vec<AsyncTask>, EngineError> {
        self.ensure_open()?;
        let result = self.conn.control(TxControl::Commit).await;
        match result {
            Ok(()) => {
                self.state = TxState::Committed;
                Ok(std::mem::take(&mut self.deferred))
            }
            Err(e) => {
                self.state = TxState::RolledBack;
                Err(e)
            }
        }
    }

    pub async fn rollback(mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.state = TxState::RolledBack;
        self.deferred.clear();
        self.conn.control(TxControl::Rollback).await
    }
}

impl<C: Connection> Drop for Transaction<C> {
    fn drop(&mut self) {
        if self.state == TxState::Open {
            tracing::warn!("transaction dropped while open; it will be rolled back");
        }
    }
}

/// Statements run through a transaction; control statements stay with the transaction itself.
#[async_trait]
impl<C: Connection> Connection for Transaction<C> {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, EngineError> {
        self.ensure_open()?;
        self.conn.fetch_all(q).await
    }

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, EngineError> {
        self.ensure_open()?;
        self.conn.execute(q).await
    }

    async fn control(&mut self, op: TxControl) -> Result<(), EngineError> {
        Err(EngineError::TransactionFatal(format!(
            "'{}' must go through the transaction handle",
            op.sql()
        )))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

enum Outcome<T> {
    Done(Result<T, EngineError>),
    Panicked(String),
    TimedOut(Duration),
}

/// Opens transactions against a [`Database`] and runs units of work in them.
pub struct TransactionManager<D: Database> {
    db: Arc<D>,
    isolation: IsolationLevel,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    statement_timeout_ms: Option<u64>,
    dispatcher: Option<HookDispatcher>,
}

impl<D: Database> Clone for TransactionManager<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            isolation: self.isolation,
            retry: self.retry,
            timeout: self.timeout,
            statement_timeout_ms: self.statement_timeout_ms,
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<D: Database> TransactionManager<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self {
            db,
            isolation: IsolationLevel::Serializable,
            retry: RetryPolicy::default(),
            timeout: None,
            statement_timeout_ms: None,
            dispatcher: None,
        }
    }

    pub fn from_config(db: Arc<D>, config: &EngineConfig) -> Self {
        Self {
            db,
            isolation: config.isolation,
            retry: RetryPolicy {
                max_attempts: config.retry_attempts.max(1),
                base_delay: Duration::from_millis(config.retry_base_ms),
                max_delay: Duration::from_millis(config.retry_max_ms),
            },
            timeout: config.transaction_timeout(),
            statement_timeout_ms: config.statement_timeout_ms,
            dispatcher: None,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Abort (and roll back) any unit of work running longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: HookDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn begin(&self) -> Result<Transaction<D::Conn>, EngineError> {
        let conn = self.db.acquire().await?;
        Transaction::begin(conn, self.isolation, self.statement_timeout_ms).await
    }

    /// Run `f` once in a fresh transaction: commit on success, roll back on error, panic or timeout.
    pub async fn run<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction<D::Conn>) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        let mut f = Some(f);
        self.with_retry(1, move |tx| match f.take() {
            Some(f) => f(tx),
            None => async { Err(EngineError::TransactionFatal("unit of work already consumed".into())) }.boxed(),
        })
        .await
    }

    /// [`TransactionManager::with_retry`] using the configured attempt bound.
    pub async fn run_with_retry<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Transaction<D::Conn>) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        self.with_retry(self.retry.max_attempts, f).await
    }

    /// Re-run the whole unit of work on serialization or deadlock conflicts, with exponential
    /// backoff, up to `max_attempts` in total. Other errors propagate immediately.
    pub async fn with_retry<T, F>(&self, max_attempts: u32, mut f: F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Transaction<D::Conn>) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(&mut f).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transaction conflict; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn attempt<T, F>(&self, f: &mut F) -> Result<T, EngineError>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Transaction<D::Conn>) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        let mut tx = self.begin().await?;
        let outcome = {
            let work = AssertUnwindSafe(f(&mut tx)).catch_unwind();
            let finished = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| limit),
                None => Ok(work.await),
            };
            match finished {
                Ok(Ok(result)) => Outcome::Done(result),
                Ok(Err(panic)) => Outcome::Panicked(panic_message(&*panic)),
                Err(limit) => Outcome::TimedOut(limit),
            }
        };

        match outcome {
            Outcome::Done(Ok(value)) => {
                let tasks = tx.commit().await?;
                self.dispatch(tasks);
                Ok(value)
            }
            Outcome::Done(Err(e)) => {
                rollback_quietly(tx).await;
                Err(e)
            }
            Outcome::Panicked(msg) => {
                rollback_quietly(tx).await;
                Err(EngineError::TransactionFatal(format!("unit of work panicked: {}", msg)))
            }
            Outcome::TimedOut(limit) => {
                // The in-flight statement was cancelled mid-protocol; discard the connection
                // instead of issuing ROLLBACK on it.
                drop(tx);
                Err(EngineError::Timeout(limit))
            }
        }
    }

    fn dispatch(&self, tasks: Vec<AsyncTask>) {
        if tasks.is_empty() {
            return;
        }
        match &self.dispatcher {
            Some(d) => {
                for task in tasks {
                    d.dispatch(task);
                }
            }
            None => tracing::warn!(count = tasks.len(), "no hook dispatcher; async hooks dropped"),
        }
    }
}

async fn rollback_quietly<C: Connection>(tx: Transaction<C>) {
    if let Err(e) = tx.rollback().await {
        tracing::error!(error = %e, "rollback failed");
    }
}
