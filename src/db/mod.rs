//! Storage seam: a pool of connections that run compiled statements and transaction control.

mod postgres;

pub use postgres::*;

use crate::error::EngineError;
use crate::sql::QueryBuf;
use crate::value::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Some(IsolationLevel::ReadCommitted),
            "repeatable_read" => Some(IsolationLevel::RepeatableRead),
            "serializable" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// Transaction control statements. Savepoint names are generated internally, never caller input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxControl {
    Begin(IsolationLevel),
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
}

impl TxControl {
    pub fn sql(&self) -> String {
        match self {
            TxControl::Begin(level) => format!("BEGIN ISOLATION LEVEL {}", level.sql()),
            TxControl::Commit => "COMMIT".into(),
            TxControl::Rollback => "ROLLBACK".into(),
            TxControl::Savepoint(name) => format!("SAVEPOINT {}", name),
            TxControl::ReleaseSavepoint(name) => format!("RELEASE SAVEPOINT {}", name),
            TxControl::RollbackToSavepoint(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
        }
    }
}

/// One checked-out connection. Dropping it returns it to the pool.
#[async_trait]
pub trait Connection: Send {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, EngineError>;

    /// Rows affected.
    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, EngineError>;

    async fn control(&mut self, op: TxControl) -> Result<(), EngineError>;

    async fn fetch_optional(&mut self, q: &QueryBuf) -> Result<Option<Record>, EngineError> {
        Ok(self.fetch_all(q).await?.into_iter().next())
    }
}

#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Conn: Connection + 'static;

    async fn acquire(&self) -> Result<Self::Conn, EngineError>;
}
