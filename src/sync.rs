//! Incremental record sync into the local mirror.
//!
//! Every fetched record is fingerprinted and inserted only if its
//! (site, fingerprint) pair is new. Re-fetching unchanged data is therefore
//! a no-op, and an edited upstream record lands as a fresh row rather than
//! overwriting history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use uuid::Uuid;

use crate::fingerprint::{aggregate_fingerprint, record_fingerprint};
use crate::models::{FetchedRecord, SyncOutcome};

/// Mirror one batch of fetched records for a (site, record type) stream.
pub async fn sync_batch(
    pool: &SqlitePool,
    site: &str,
    record_type: &str,
    records: &[FetchedRecord],
    run_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome {
        fetched: records.len(),
        ..Default::default()
    };

    let mut seen: HashSet<String> = sqlx::query(
        "SELECT fingerprint FROM synced_records WHERE site = ?",
    )
    .bind(site)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| row.get("fingerprint"))
    .collect();

    let mut tx = pool.begin().await?;
    for record in records {
        let fp = record_fingerprint(&record.payload);
        if !seen.insert(fp.clone()) {
            outcome.duplicates += 1;
            continue;
        }

        let payload_json = serde_json::to_string(&record.payload)?;
        sqlx::query(
            "INSERT INTO synced_records
                 (id, site, record_type, patient_ref, case_name,
                  payload_json, fingerprint, fetched_at, run_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(site)
        .bind(record_type)
        .bind(record.patient_ref)
        .bind(&record.case_name)
        .bind(payload_json)
        .bind(&fp)
        .bind(fetched_at.timestamp())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        outcome.inserted += 1;
    }
    tx.commit().await?;

    update_metadata(pool, site, record_type, run_id, fetched_at).await?;
    Ok(outcome)
}

/// Recompute the (site, record type) bookkeeping row from the mirror.
async fn update_metadata(
    pool: &SqlitePool,
    site: &str,
    record_type: &str,
    run_id: &str,
    fetched_at: DateTime<Utc>,
) -> Result<()> {
    let fingerprints: Vec<String> = sqlx::query(
        "SELECT fingerprint FROM synced_records WHERE site = ? AND record_type = ?",
    )
    .bind(site)
    .bind(record_type)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|row| row.get("fingerprint"))
    .collect();

    sqlx::query(
        "INSERT INTO sync_metadata
             (site, record_type, last_fetch_at, row_count, aggregate_fingerprint, run_id, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(site, record_type) DO UPDATE SET
             last_fetch_at = excluded.last_fetch_at,
             row_count = excluded.row_count,
             aggregate_fingerprint = excluded.aggregate_fingerprint,
             run_id = excluded.run_id,
             updated_at = excluded.updated_at",
    )
    .bind(site)
    .bind(record_type)
    .bind(fetched_at.timestamp())
    .bind(fingerprints.len() as i64)
    .bind(aggregate_fingerprint(&fingerprints))
    .bind(run_id)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

/// Whether a (patient, case) pair already has mirrored records on this site.
pub async fn pair_is_mirrored(
    pool: &SqlitePool,
    site: &str,
    patient_ref: i64,
    case_name: &str,
) -> Result<bool> {
    let row = sqlx::query(
        "SELECT 1 FROM synced_records
         WHERE site = ? AND patient_ref = ? AND case_name = ? LIMIT 1",
    )
    .bind(site)
    .bind(patient_ref)
    .bind(case_name)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::create_schema(&pool).await.unwrap();
        pool
    }

    fn record(patient_ref: i64, case_name: &str, grade: i64) -> FetchedRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("case".to_string(), json!(case_name));
        payload.insert("grade".to_string(), json!(grade));
        FetchedRecord {
            patient_ref: Some(patient_ref),
            case_name: Some(case_name.to_string()),
            payload,
        }
    }

    #[tokio::test]
    async fn test_fresh_batch_inserts_all() {
        let pool = test_pool().await;
        let records = vec![record(7, "D2024.01", 4), record(7, "D2024.01", 5)];
        let outcome = sync_batch(&pool, "lab1", "embryo_data", &records, "run-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.fetched, 2);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 0);
    }

    #[tokio::test]
    async fn test_refetch_is_noop() {
        let pool = test_pool().await;
        let records = vec![record(7, "D2024.01", 4), record(7, "D2024.01", 5)];
        sync_batch(&pool, "lab1", "embryo_data", &records, "run-1", Utc::now())
            .await
            .unwrap();
        let outcome = sync_batch(&pool, "lab1", "embryo_data", &records, "run-2", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.duplicates, 2);
    }

    #[tokio::test]
    async fn test_changed_record_lands_as_new_row() {
        let pool = test_pool().await;
        sync_batch(
            &pool,
            "lab1",
            "embryo_data",
            &[record(7, "D2024.01", 4)],
            "run-1",
            Utc::now(),
        )
        .await
        .unwrap();
        let outcome = sync_batch(
            &pool,
            "lab1",
            "embryo_data",
            &[record(7, "D2024.01", 5)],
            "run-2",
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.inserted, 1);

        let row = sqlx::query("SELECT COUNT(*) AS n FROM synced_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_collapse() {
        let pool = test_pool().await;
        let records = vec![record(7, "D2024.01", 4), record(7, "D2024.01", 4)];
        let outcome = sync_batch(&pool, "lab1", "embryo_data", &records, "run-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn test_dedup_scoped_per_site() {
        let pool = test_pool().await;
        let records = vec![record(7, "D2024.01", 4)];
        sync_batch(&pool, "lab1", "embryo_data", &records, "run-1", Utc::now())
            .await
            .unwrap();
        let outcome = sync_batch(&pool, "lab2", "embryo_data", &records, "run-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
    }

    #[tokio::test]
    async fn test_metadata_tracks_totals() {
        let pool = test_pool().await;
        sync_batch(
            &pool,
            "lab1",
            "embryo_data",
            &[record(7, "D2024.01", 4)],
            "run-1",
            Utc::now(),
        )
        .await
        .unwrap();
        sync_batch(
            &pool,
            "lab1",
            "embryo_data",
            &[record(7, "D2024.01", 4), record(7, "D2024.01", 5)],
            "run-2",
            Utc::now(),
        )
        .await
        .unwrap();

        let row = sqlx::query(
            "SELECT row_count, run_id FROM sync_metadata WHERE site = 'lab1' AND record_type = 'embryo_data'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let row_count: i64 = row.get("row_count");
        let run_id: String = row.get("run_id");
        assert_eq!(row_count, 2);
        assert_eq!(run_id, "run-2");
    }

    #[tokio::test]
    async fn test_pair_is_mirrored() {
        let pool = test_pool().await;
        assert!(!pair_is_mirrored(&pool, "lab1", 7, "D2024.01").await.unwrap());
        sync_batch(
            &pool,
            "lab1",
            "embryo_data",
            &[record(7, "D2024.01", 4)],
            "run-1",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(pair_is_mirrored(&pool, "lab1", 7, "D2024.01").await.unwrap());
    }
}
