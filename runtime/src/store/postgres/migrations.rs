//! Postgres migration management
//!
//! Handles schema initialization and versioned migrations.

use sqlx::PgPool;

use super::schema::{SCHEMA_VERSION, schema_sql};
use crate::store::StoreError;

/// Run all pending migrations
pub async fn run_migrations(pool: &PgPool, prefix: &str) -> Result<(), StoreError> {
    let version_table = format!("{prefix}schema_version");

    // Check if the version table exists
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = current_schema()
            AND table_name = $1
        )
        "#,
    )
    .bind(&version_table)
    .fetch_one(pool)
    .await?;

    if !table_exists {
        // Fresh database - apply initial schema
        tracing::debug!("applying initial schema v{}", SCHEMA_VERSION);
        apply_initial_schema(pool, prefix).await?;
        return Ok(());
    }

    let current_version: Option<i32> =
        sqlx::query_scalar(&format!("SELECT version FROM {version_table} WHERE id = 1"))
            .fetch_optional(pool)
            .await?;

    match current_version {
        None => {
            // Table exists but no version row - apply schema
            tracing::debug!("applying initial schema v{}", SCHEMA_VERSION);
            apply_initial_schema(pool, prefix).await?;
        }
        Some(v) if v < SCHEMA_VERSION => {
            tracing::debug!("migrating schema from v{} to v{}", v, SCHEMA_VERSION);
            for version in (v + 1)..=SCHEMA_VERSION {
                apply_versioned_migration(pool, prefix, version).await?;
            }
        }
        Some(v) if v > SCHEMA_VERSION => {
            tracing::warn!(
                "schema version {} is newer than runtime version {}. This may cause issues.",
                v,
                SCHEMA_VERSION
            );
        }
        _ => {
            tracing::debug!("schema is up to date (v{})", SCHEMA_VERSION);
        }
    }

    Ok(())
}

/// Apply the initial schema
async fn apply_initial_schema(pool: &PgPool, prefix: &str) -> Result<(), StoreError> {
    let now = chrono::Utc::now().timestamp();

    sqlx::raw_sql(&schema_sql(prefix)).execute(pool).await?;

    sqlx::query(&format!(
        "INSERT INTO {prefix}schema_version (id, version, applied_at, description)
         VALUES (1, $1, $2, 'Initial schema')
         ON CONFLICT (id) DO UPDATE SET version = $1, applied_at = $2"
    ))
    .bind(SCHEMA_VERSION)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::debug!("schema v{} applied successfully", SCHEMA_VERSION);
    Ok(())
}

/// Apply a specific versioned migration
///
/// Add future migrations here as match arms. Schema v1 is applied via the
/// schema constant, so no versioned migrations exist yet.
async fn apply_versioned_migration(
    _pool: &PgPool,
    _prefix: &str,
    version: i32,
) -> Result<(), StoreError> {
    Err(StoreError::Migration {
        version,
        error: format!("no migration defined for version {version}"),
    })
}
