//! Engine: CRUD orchestration over the registry, hooks, validation and transactions.

mod crud;
mod validation;
pub use crud::{Engine, Tracked};
pub use validation::{check_fields, ensure_known_fields, RecordChecks};
