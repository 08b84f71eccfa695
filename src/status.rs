//! Mirror health report for the `status` subcommand.

use anyhow::Result;
use chrono::DateTime;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::UNRESOLVED;
use crate::resolve;

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    print_sync_status(&pool).await?;
    print_resolution_status(&pool).await?;
    print_checkpoint_status(&pool).await?;
    pool.close().await;
    Ok(())
}

async fn print_sync_status(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query(
        "SELECT site, record_type, row_count, last_fetch_at, run_id
         FROM sync_metadata ORDER BY site, record_type",
    )
    .fetch_all(pool)
    .await?;

    println!("Mirrored streams: {}", rows.len());
    for row in &rows {
        let site: String = row.get("site");
        let record_type: String = row.get("record_type");
        let row_count: i64 = row.get("row_count");
        let last_fetch_at: i64 = row.get("last_fetch_at");
        let run_id: String = row.get("run_id");

        let fetched = DateTime::from_timestamp(last_fetch_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {}/{}: {} rows, last fetch {} (run {})",
            site, record_type, row_count, fetched, run_id
        );
    }
    Ok(())
}

async fn print_resolution_status(pool: &SqlitePool) -> Result<()> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total,
                SUM(CASE WHEN resolved_id != ? THEN 1 ELSE 0 END) AS resolved
         FROM external_refs",
    )
    .bind(UNRESOLVED)
    .fetch_one(pool)
    .await?;
    let total: i64 = row.get("total");
    let resolved: i64 = row.get::<Option<i64>, _>("resolved").unwrap_or(0);

    println!("External references: {}", total);
    println!("  resolved: {}", resolved);
    println!("  unresolved: {}", resolve::count_unresolved(pool).await?);
    if total > 0 {
        println!(
            "  resolution rate: {:.1}%",
            resolved as f64 * 100.0 / total as f64
        );
    }
    Ok(())
}

async fn print_checkpoint_status(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query(
        "SELECT site, COUNT(*) AS n FROM crawl_checkpoints GROUP BY site ORDER BY site",
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        println!("Pending crawl checkpoints: none");
        return Ok(());
    }

    println!("Pending crawl checkpoints:");
    for row in &rows {
        let site: String = row.get("site");
        let n: i64 = row.get("n");
        println!("  {}: {} case(s) from an interrupted run", site, n);
    }
    Ok(())
}
