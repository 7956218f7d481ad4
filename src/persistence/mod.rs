//! Persistence Layer
//!
//! SQLite storage for the shared state store. Every record lives in a single
//! `records` table keyed by its full path; the collection and record id are
//! stored alongside so collection listings are an indexed range scan.
//!
//! # Database Schema
//!
//! ## Records Table
//! - path: Full record path (e.g., "payments/tenant-1"), primary key
//! - collection: Everything before the last slash
//! - record_id: Everything after the last slash
//! - value: JSON text
//! - updated_at: Timestamp of the last write

pub mod state_repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Failed to create database directory {path}: {reason}")]
    Directory { path: String, reason: String },
}

/// Initialize the database connection pool
///
/// # Arguments
/// - `database_url`: SQLite URL (e.g., "sqlite://data/tenantbot.db" or "sqlite::memory:")
///
/// # Errors
/// Returns error if the data directory cannot be created, the connection fails
/// or migrations fail
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Directory {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    // Each connection to an in-memory database sees its own database
    let max_connections = if database_url.contains(":memory:") {
        1
    } else {
        MAX_CONNECTIONS
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            path TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create records table: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection, record_id)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    Ok(())
}
