use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Canonical registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_patients (
            id INTEGER PRIMARY KEY,
            partner_a_name TEXT,
            partner_b_name TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Alternate-role identifiers, one row per (patient, role) slot
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alternate_identifiers (
            patient_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            value INTEGER NOT NULL,
            PRIMARY KEY (patient_id, role),
            FOREIGN KEY (patient_id) REFERENCES canonical_patients(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // External references carrying a loosely-keyed patient pointer.
    // resolved_id = -1 means unresolved; a real id is never overwritten.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_refs (
            value INTEGER PRIMARY KEY,
            site TEXT NOT NULL,
            first_name TEXT,
            last_name TEXT,
            resolved_id INTEGER NOT NULL DEFAULT -1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only mirror of externally-fetched records
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS synced_records (
            id TEXT PRIMARY KEY,
            site TEXT NOT NULL,
            record_type TEXT NOT NULL,
            patient_ref INTEGER,
            case_name TEXT,
            payload_json TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            UNIQUE(site, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-(site, record type) sync bookkeeping
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_metadata (
            site TEXT NOT NULL,
            record_type TEXT NOT NULL,
            last_fetch_at INTEGER NOT NULL,
            row_count INTEGER NOT NULL,
            aggregate_fingerprint TEXT NOT NULL,
            run_id TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (site, record_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Completed (patient, case) crawl work, cleared when the patient finishes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crawl_checkpoints (
            site TEXT NOT NULL,
            patient_ref INTEGER NOT NULL,
            case_name TEXT NOT NULL,
            completed_at INTEGER NOT NULL,
            PRIMARY KEY (site, patient_ref, case_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_synced_records_site_type ON synced_records(site, record_type)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_synced_records_pair ON synced_records(site, patient_ref, case_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_alternate_identifiers_value ON alternate_identifiers(value)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_external_refs_resolved ON external_refs(resolved_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
