//! Resource Engine: schema-driven data access for PostgreSQL.
//!
//! Resources are declared as JSON definitions and registered in a [`SchemaRegistry`]. The
//! registry drives migration generation, query compilation, relationship loading and the
//! CRUD pipeline run by [`Engine`].

pub mod config;
pub mod db;
pub mod error;
pub mod hooks;
pub mod loader;
pub mod migration;
pub mod schema;
pub mod service;
pub mod sql;
pub mod tracker;
pub mod transaction;
pub mod value;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use db::{ensure_database_exists, Connection, Database, IsolationLevel, PgDatabase};
pub use error::{ConfigError, EngineError, SchemaError, ValidationReport, Violation};
pub use hooks::{
    AsyncHook, FnHook, FnValidator, Hook, HookContext, HookDispatcher, HookEvent, HookExecutor, Operation,
    RecordValidator,
};
pub use loader::{LazyRecord, RelationshipLoader};
pub use migration::{
    diff, generate_migration, ChangeKind, Confirmation, LedgerEntry, Migration, MigrationLedger, SchemaChange,
    SchemaSnapshot,
};
pub use schema::{load_definitions_from_dir, parse_definitions, ResourceDefinition, ResourceSchema, SchemaRegistry};
pub use service::{Engine, Tracked};
pub use sql::{Direction, Operator, Query};
pub use tracker::ChangeSet;
pub use transaction::{RetryPolicy, Transaction, TransactionManager};
pub use value::{Record, Value};
