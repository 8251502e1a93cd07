//! Safe SQL builder: identifiers from validated schemas only, values as parameters.

mod builder;
pub mod params;
pub mod query;

pub use builder::*;
pub use params::*;
pub use query::*;

use crate::value::Value;

/// Quote identifier for PostgreSQL (safe: only from validated schemas).
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quoted(schema), quoted(table))
}

/// Statement text plus its positional parameters, in `$n` order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statement without parameters (DDL, transaction control).
    pub fn raw(sql: impl Into<String>) -> Self {
        QueryBuf {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter and return its 1-based placeholder number.
    pub fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// Append a parameter and return its placeholder with a cast (`$3::timestamptz`).
    pub fn placeholder(&mut self, v: Value, cast: &str) -> String {
        let n = self.push_param(v);
        format!("${}::{}", n, cast)
    }
}
