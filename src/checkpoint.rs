//! Crawl checkpoint bookkeeping.
//!
//! A checkpoint row records that one (patient, case) unit of work finished
//! on a site. An interrupted crawl skips checkpointed work on the next run;
//! once every case of a patient completes, that patient's rows are cleared
//! so a future run re-examines it for new cases.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_completed(&self, site: &str, patient_ref: i64, case_name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM crawl_checkpoints WHERE site = ? AND patient_ref = ? AND case_name = ?",
        )
        .bind(site)
        .bind(patient_ref)
        .bind(case_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn mark_completed(&self, site: &str, patient_ref: i64, case_name: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO crawl_checkpoints (site, patient_ref, case_name, completed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(site)
        .bind(patient_ref)
        .bind(case_name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every checkpoint for one patient after all its cases finished.
    pub async fn clear_patient(&self, site: &str, patient_ref: i64) -> Result<()> {
        sqlx::query("DELETE FROM crawl_checkpoints WHERE site = ? AND patient_ref = ?")
            .bind(site)
            .bind(patient_ref)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self, site: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM crawl_checkpoints WHERE site = ?")
            .bind(site)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}
