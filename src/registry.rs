//! In-memory index over the canonical patient registry.
//!
//! Loaded once per resolution run. Candidate lookup walks a single
//! identifier-value index instead of one query branch per alternate-role
//! column, so adding a role is a data change, not a code change.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use thiserror::Error;

use crate::matcher::{first_name_token, normalize_name};
use crate::models::{CanonicalPatient, LinkagePath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrySubset {
    Active,
    Inactive,
}

impl RegistrySubset {
    pub fn parse(s: &str) -> Option<RegistrySubset> {
        match s {
            "active" => Some(RegistrySubset::Active),
            "inactive" => Some(RegistrySubset::Inactive),
            _ => None,
        }
    }

    fn includes(&self, patient: &CanonicalPatient) -> bool {
        match self {
            RegistrySubset::Active => patient.active,
            RegistrySubset::Inactive => !patient.active,
        }
    }
}

impl std::fmt::Display for RegistrySubset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrySubset::Active => write!(f, "active"),
            RegistrySubset::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Debug, Error)]
#[error("empty registry: no {subset} canonical patients loaded")]
pub struct EmptyRegistry {
    pub subset: RegistrySubset,
}

pub struct RegistryIndex {
    patients: HashMap<i64, CanonicalPatient>,
    /// identifier value -> every (patient, path) reachable through it
    by_identifier: HashMap<i64, Vec<(i64, LinkagePath)>>,
    active_count: usize,
    inactive_count: usize,
}

impl RegistryIndex {
    /// Load the full registry (both subsets) from the database.
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let rows = sqlx::query(
            "SELECT id, partner_a_name, partner_b_name, active FROM canonical_patients",
        )
        .fetch_all(pool)
        .await?;

        let mut patients = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.get("id");
            let partner_a_raw: Option<String> = row.get("partner_a_name");
            let partner_b_raw: Option<String> = row.get("partner_b_name");
            let active: i64 = row.get("active");

            patients.insert(
                id,
                CanonicalPatient {
                    id,
                    partner_a_name: partner_a_raw.as_deref().map(normalize_name),
                    partner_b_name: partner_b_raw.as_deref().map(normalize_name),
                    partner_a_token: partner_a_raw.as_deref().and_then(first_name_token),
                    partner_b_token: partner_b_raw.as_deref().and_then(first_name_token),
                    active: active != 0,
                    alternates: Vec::new(),
                },
            );
        }

        let alt_rows =
            sqlx::query("SELECT patient_id, role, value FROM alternate_identifiers ORDER BY role")
                .fetch_all(pool)
                .await?;

        for row in &alt_rows {
            let patient_id: i64 = row.get("patient_id");
            let role: String = row.get("role");
            let value: i64 = row.get("value");
            if let Some(patient) = patients.get_mut(&patient_id) {
                patient.alternates.push((role, value));
            }
        }

        Ok(Self::from_patients(patients.into_values().collect()))
    }

    /// Build the index from already-loaded rows.
    pub fn from_patients(rows: Vec<CanonicalPatient>) -> Self {
        let mut patients = HashMap::with_capacity(rows.len());
        let mut by_identifier: HashMap<i64, Vec<(i64, LinkagePath)>> = HashMap::new();
        let mut active_count = 0;
        let mut inactive_count = 0;

        for patient in rows {
            if patient.active {
                active_count += 1;
            } else {
                inactive_count += 1;
            }

            by_identifier
                .entry(patient.id)
                .or_default()
                .push((patient.id, LinkagePath::Primary));
            for (role, value) in &patient.alternates {
                by_identifier
                    .entry(*value)
                    .or_default()
                    .push((patient.id, LinkagePath::Alternate(role.clone())));
            }

            patients.insert(patient.id, patient);
        }

        Self {
            patients,
            by_identifier,
            active_count,
            inactive_count,
        }
    }

    /// Fail if the requested subset holds no rows at all.
    pub fn ensure_subset(&self, subset: RegistrySubset) -> Result<(), EmptyRegistry> {
        let count = match subset {
            RegistrySubset::Active => self.active_count,
            RegistrySubset::Inactive => self.inactive_count,
        };
        if count == 0 {
            return Err(EmptyRegistry { subset });
        }
        Ok(())
    }

    /// All registry rows reachable from an external value through the primary
    /// id or any alternate-role slot, restricted to the given subset. An
    /// unmatched value yields an empty set, not an error.
    pub fn candidates(
        &self,
        value: i64,
        subset: RegistrySubset,
    ) -> Vec<(&CanonicalPatient, LinkagePath)> {
        let Some(entries) = self.by_identifier.get(&value) else {
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|(patient_id, path)| {
                let patient = self.patients.get(patient_id)?;
                subset.includes(patient).then(|| (patient, path.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }
}
