//! Multi-pass resolution of external references against the registry.
//!
//! Passes run in configured order, strictest first. Each pass only looks at
//! references still unresolved when it starts, and a write is conditional on
//! the row still being unresolved, so a reference is assigned at most once
//! and an earlier (stricter) pass always wins.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::{Config, PassConfig};
use crate::db;
use crate::matcher::{
    first_name_token, full_name_key, resolve_reference, MatchConfig, NameRule,
};
use crate::models::{ExternalReference, UNRESOLVED};
use crate::registry::{RegistryIndex, RegistrySubset};

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub subset: String,
    pub rule: String,
    pub examined: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveReport {
    pub passes: Vec<PassReport>,
    pub resolved_total: usize,
    pub unresolved_remaining: usize,
}

pub async fn run_resolve(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = resolve_all(&pool, config).await?;
    pool.close().await;

    println!("Resolution finished");
    for pass in &report.passes {
        println!(
            "  pass {}/{}: resolved {} of {}",
            pass.subset, pass.rule, pass.resolved, pass.examined
        );
    }
    println!("  newly resolved: {}", report.resolved_total);
    println!("  still unresolved: {}", report.unresolved_remaining);
    Ok(())
}

pub async fn resolve_all(pool: &SqlitePool, config: &Config) -> Result<ResolveReport> {
    let index = RegistryIndex::load(pool).await?;
    if index.is_empty() {
        anyhow::bail!("empty registry: no canonical patients loaded");
    }
    let match_config = MatchConfig::new(config.matching.role_ranks.clone());

    let mut report = ResolveReport::default();
    for pass_config in &config.matching.passes {
        let pass = run_pass(pool, &index, &match_config, pass_config).await?;
        report.resolved_total += pass.resolved;
        report.passes.push(pass);
    }

    report.unresolved_remaining = count_unresolved(pool).await?;
    Ok(report)
}

async fn run_pass(
    pool: &SqlitePool,
    index: &RegistryIndex,
    match_config: &MatchConfig,
    pass_config: &PassConfig,
) -> Result<PassReport> {
    // Config validation already vetted these strings.
    let subset = RegistrySubset::parse(&pass_config.subset)
        .ok_or_else(|| anyhow::anyhow!("unknown registry subset: {}", pass_config.subset))?;
    let rule = NameRule::parse(&pass_config.rule)
        .ok_or_else(|| anyhow::anyhow!("unknown name rule: {}", pass_config.rule))?;

    let mut report = PassReport {
        subset: pass_config.subset.clone(),
        rule: pass_config.rule.clone(),
        ..Default::default()
    };

    // A subset with no rows can't resolve anything; skip the pass rather
    // than spin through every reference.
    if index.ensure_subset(subset).is_err() {
        return Ok(report);
    }

    let refs = load_unresolved(pool).await?;
    report.examined = refs.len();

    for reference in &refs {
        let token = match rule {
            NameRule::FirstName => reference
                .first_name
                .as_deref()
                .and_then(first_name_token),
            NameRule::FullName => full_name_key(
                reference.first_name.as_deref(),
                reference.last_name.as_deref(),
            ),
        };

        let candidates = index.candidates(reference.value, subset);
        let Some(selection) =
            resolve_reference(&candidates, token.as_deref(), rule, match_config)
        else {
            continue;
        };

        // Conditional on the sentinel so an already-assigned row is never
        // reassigned, whoever got there first.
        let updated = sqlx::query(
            "UPDATE external_refs SET resolved_id = ? WHERE value = ? AND resolved_id = ?",
        )
        .bind(selection.patient_id)
        .bind(reference.value)
        .bind(UNRESOLVED)
        .execute(pool)
        .await?;

        if updated.rows_affected() > 0 {
            report.resolved += 1;
        }
    }

    Ok(report)
}

async fn load_unresolved(pool: &SqlitePool) -> Result<Vec<ExternalReference>> {
    let rows = sqlx::query(
        "SELECT value, first_name, last_name, resolved_id
         FROM external_refs WHERE resolved_id = ? ORDER BY value",
    )
    .bind(UNRESOLVED)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ExternalReference {
            value: row.get("value"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            resolved_id: row.get("resolved_id"),
        })
        .collect())
}

pub async fn count_unresolved(pool: &SqlitePool) -> Result<usize> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM external_refs WHERE resolved_id = ?")
        .bind(UNRESOLVED)
        .fetch_one(pool)
        .await?;
    let n: i64 = row.get("n");
    Ok(n as usize)
}
