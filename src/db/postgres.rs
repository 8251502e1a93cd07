//! PostgreSQL backend over a sqlx pool.

use crate::config::EngineConfig;
use crate::db::{Connection, Database, TxControl};
use crate::error::{ConfigError, EngineError};
use crate::sql::{PgBindValue, QueryBuf};
use crate::value::{Record, Value};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{ConnectOptions, PgPool, Postgres};
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using `config`, creating the database first when `create_database` is set.
    pub async fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        if config.create_database {
            ensure_database_exists(&config.database_url).await?;
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Conn = PgConn;

    async fn acquire(&self) -> Result<PgConn, EngineError> {
        Ok(PgConn {
            conn: self.pool.acquire().await?,
            in_transaction: false,
        })
    }
}

/// Pooled connection. If dropped with a transaction still open (cancelled future, panic) the
/// connection is closed instead of returned, so the server rolls the transaction back.
pub struct PgConn {
    conn: PoolConnection<Postgres>,
    in_transaction: bool,
}

impl Drop for PgConn {
    fn drop(&mut self) {
        if self.in_transaction {
            tracing::warn!("connection dropped inside a transaction; closing it");
            self.conn.close_on_drop();
        }
    }
}

fn bind_all<'q>(
    sql: &'q str,
    params: &[Value],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(sql);
    for p in params {
        query = query.bind(PgBindValue::from(p));
    }
    query
}

#[async_trait]
impl Connection for PgConn {
    async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Record>, EngineError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let rows = bind_all(&q.sql, &q.params).fetch_all(&mut *self.conn).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, EngineError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
        let done = bind_all(&q.sql, &q.params).execute(&mut *self.conn).await?;
        Ok(done.rows_affected())
    }

    async fn control(&mut self, op: TxControl) -> Result<(), EngineError> {
        let sql = op.sql();
        tracing::debug!(sql = %sql, "transaction control");
        sqlx::query(&sql).execute(&mut *self.conn).await?;
        match op {
            TxControl::Begin(_) => self.in_transaction = true,
            TxControl::Commit | TxControl::Rollback => self.in_transaction = false,
            _ => {}
        }
        Ok(())
    }
}

pub fn row_to_record(row: &PgRow) -> Record {
    use sqlx::Column;
    use sqlx::Row;
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), cell_to_value(row, col.name())))
        .collect()
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Int(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Int(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Int(n);
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        return Value::Float(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        return Value::Float(n);
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::Uuid(u);
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::Timestamp(d);
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::Timestamp(d.and_utc());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::Text(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::Text(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<serde_json::Value>, _>(name) {
        return Value::Json(j);
    }
    Value::Null
}

/// Create the target database if missing, connecting through the `postgres` maintenance database.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), EngineError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", crate::sql::quoted(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), ConfigError> {
    let path_start = url
        .rfind('/')
        .map(|i| i + 1)
        .ok_or_else(|| ConfigError::InvalidVar {
            key: "DATABASE_URL",
            value: url.to_string(),
        })?;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres", base), db_name.to_string()))
}
