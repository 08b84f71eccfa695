//! Site crawler: walks each remote site's patient and case listings and
//! mirrors the records behind them.
//!
//! Sites crawl in parallel, one worker per site; within a site every
//! request is sequential, so a device never sees more than one in-flight
//! request plus the rate limiter's spacing.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::client::{ClientError, RemoteApi, RemotePatient, SiteClient};
use crate::config::Config;
use crate::db;
use crate::models::{FetchedRecord, UnitSummary};
use crate::sync;

pub const RECORD_TYPE_PATIENT: &str = "patient";
pub const RECORD_TYPE_CASE: &str = "case_record";

pub async fn run_crawl(config: &Config, site_filter: Option<&str>, full: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let run_id = Uuid::new_v4().to_string();

    let sites: Vec<String> = config
        .sites
        .iter()
        .filter(|(name, site)| {
            site.enabled && site_filter.map_or(true, |wanted| wanted == name.as_str())
        })
        .map(|(name, _)| name.clone())
        .collect();

    if sites.is_empty() {
        anyhow::bail!("No enabled sites matched");
    }

    println!("Starting crawl");
    println!("  run: {}", run_id);
    println!("  sites: {}", sites.join(", "));
    println!("  mode: {}", if full { "full" } else { "incremental" });

    let mut workers = JoinSet::new();
    for site in sites {
        let site_config = config.sites[&site].clone();
        let crawl_config = config.crawl.clone();
        let pool = pool.clone();
        let run_id = run_id.clone();

        workers.spawn(async move {
            let client = match SiteClient::new(&site, &site_config, &crawl_config) {
                Ok(client) => Arc::new(client),
                Err(e) => return (site, Err(e)),
            };
            let result = crawl_site(&pool, &site, client.as_ref(), full, &run_id).await;
            (site, result)
        });
    }

    let mut failures = 0;
    while let Some(joined) = workers.join_next().await {
        let (site, result) = joined?;
        match result {
            Ok(summary) => print_summary(&summary),
            Err(e) => {
                failures += 1;
                eprintln!("Site {} failed: {:#}", site, e);
            }
        }
    }

    pool.close().await;
    if failures > 0 {
        anyhow::bail!("{} site(s) failed", failures);
    }
    Ok(())
}

fn print_summary(summary: &UnitSummary) {
    println!("Site {} done", summary.site);
    println!("  cases completed: {}", summary.completed);
    println!("  cases failed: {}", summary.failed);
    println!("  cases skipped: {}", summary.skipped);
    println!("  records inserted: {}", summary.records_inserted);
}

/// Crawl one site end to end. Per-case fetch failures are counted and the
/// crawl moves on; an authentication failure aborts the whole site.
pub async fn crawl_site(
    pool: &SqlitePool,
    site: &str,
    api: &dyn RemoteApi,
    full: bool,
    run_id: &str,
) -> Result<UnitSummary> {
    let checkpoints = CheckpointStore::new(pool.clone());
    let mut summary = UnitSummary {
        site: site.to_string(),
        ..Default::default()
    };

    let patients = api.list_patients().await?;
    upsert_external_refs(pool, site, &patients).await?;
    let outcome = sync::sync_batch(
        pool,
        site,
        RECORD_TYPE_PATIENT,
        &patient_records(&patients),
        run_id,
        Utc::now(),
    )
    .await?;
    summary.records_inserted += outcome.inserted;

    for patient in &patients {
        let cases = match api.list_cases(patient.patient_ref).await {
            Ok(cases) => cases,
            Err(e @ ClientError::AuthFailed { .. }) => return Err(e.into()),
            Err(e) => {
                eprintln!("  listing cases for {} failed: {}", patient.patient_ref, e);
                summary.failed += 1;
                continue;
            }
        };

        let mut patient_clean = true;
        for case_name in &cases {
            if !full {
                if checkpoints
                    .is_completed(site, patient.patient_ref, case_name)
                    .await?
                {
                    summary.skipped += 1;
                    continue;
                }
                // Known pairs were mirrored by an earlier finished run;
                // only new (patient, case) pairs are worth a fetch.
                if sync::pair_is_mirrored(pool, site, patient.patient_ref, case_name).await? {
                    summary.skipped += 1;
                    continue;
                }
            }

            match api.fetch_case_records(patient.patient_ref, case_name).await {
                Ok(records) => {
                    let outcome = sync::sync_batch(
                        pool,
                        site,
                        RECORD_TYPE_CASE,
                        &records,
                        run_id,
                        Utc::now(),
                    )
                    .await?;
                    summary.records_inserted += outcome.inserted;
                    summary.completed += 1;
                    checkpoints
                        .mark_completed(site, patient.patient_ref, case_name)
                        .await?;
                }
                Err(e @ ClientError::AuthFailed { .. }) => return Err(e.into()),
                Err(e) => {
                    eprintln!(
                        "  case {} for {} failed: {}",
                        case_name, patient.patient_ref, e
                    );
                    summary.failed += 1;
                    patient_clean = false;
                }
            }
        }

        // All cases done: drop the patient's checkpoints so a later run
        // re-examines it for newly opened cases.
        if patient_clean {
            checkpoints.clear_patient(site, patient.patient_ref).await?;
        }
    }

    Ok(summary)
}

fn patient_records(patients: &[RemotePatient]) -> Vec<FetchedRecord> {
    patients
        .iter()
        .map(|p| {
            let mut payload = serde_json::Map::new();
            payload.insert("PatientRef".to_string(), json!(p.patient_ref));
            payload.insert("FirstName".to_string(), json!(p.first_name));
            payload.insert("LastName".to_string(), json!(p.last_name));
            FetchedRecord {
                patient_ref: Some(p.patient_ref),
                case_name: None,
                payload,
            }
        })
        .collect()
}

/// Record every externally-seen patient pointer. Resolution state is owned
/// by the resolver; an upsert here must never disturb it.
async fn upsert_external_refs(
    pool: &SqlitePool,
    site: &str,
    patients: &[RemotePatient],
) -> Result<()> {
    for patient in patients {
        sqlx::query(
            "INSERT INTO external_refs (value, site, first_name, last_name)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(value) DO UPDATE SET
                 site = excluded.site,
                 first_name = excluded.first_name,
                 last_name = excluded.last_name",
        )
        .bind(patient.patient_ref)
        .bind(site)
        .bind(&patient.first_name)
        .bind(&patient.last_name)
        .execute(pool)
        .await?;
    }
    Ok(())
}
