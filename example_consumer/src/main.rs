//! Example consumer: a separate Rust project that uses resource-engine as a dependency.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Or from this directory: `cargo run`

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use resource_engine::{
    load_definitions_from_dir, Confirmation, Engine, EngineConfig, EngineError, HookExecutor, PgDatabase, Query,
    Record, SchemaRegistry,
};
use std::sync::Arc;
use tokio::net::TcpListener;

type AppEngine = Engine<PgDatabase>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("resource_engine=info,example_consumer=info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let definitions_path = std::env::var("DEFINITIONS_PATH")
        .unwrap_or_else(|_| concat!(env!("CARGO_MANIFEST_DIR"), "/definitions").into());

    let registry = SchemaRegistry::new(&config.schema);
    registry.register_all(load_definitions_from_dir(&definitions_path)?)?;
    registry.seal()?;
    let engine = Engine::connect(config, Arc::new(registry), HookExecutor::new()).await?;

    let ledger = engine.ledger();
    ledger.ensure_table().await?;
    match ledger.plan("initial", &engine.registry().snapshot()).await? {
        Some(mut migration) => {
            for change in migration.changes() {
                tracing::info!(change = %change.describe(), "planned");
            }
            ledger.apply(&mut migration, Confirmation::Auto).await?;
        }
        None => tracing::info!("schema up to date"),
    }

    let author = engine
        .create_json("authors", &serde_json::json!({ "name": "Ursula K. Le Guin" }))
        .await?;
    let author_id = author.get("id").cloned().ok_or("author without id")?;
    engine
        .create(
            "books",
            Record::new()
                .with("title", "The Dispossessed")
                .with("author_id", author_id.clone()),
        )
        .await?;
    let found = engine.find_with("authors", author_id.clone(), &["books"]).await?;
    tracing::info!(author = %found.to_json(), "loaded with books");
    let books = engine
        .query(&Query::new("books").where_eq("author_id", author_id).include("author"))
        .await?;
    tracing::info!(count = books.len(), "books by author");

    let app = Router::new()
        .route("/:resource", post(create_record))
        .route("/:resource/:id", get(find_record))
        .with_state(engine);
    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Example consumer listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn find_record(
    State(engine): State<AppEngine>,
    Path((resource, id)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let record = engine.find(&resource, id).await?;
    Ok(Json(record.to_json()))
}

async fn create_record(
    State(engine): State<AppEngine>,
    Path(resource): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let record = engine.create_json(&resource, &body).await?;
    Ok(Json(record.to_json()))
}
