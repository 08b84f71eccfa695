//! Core data models shared across the matcher, sync engine, and crawler.

use serde_json::{Map, Value};

/// Which identifier slot a candidate match was found through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkagePath {
    /// The canonical row's own primary identifier.
    Primary,
    /// One of the alternate-role identifier slots, tagged with its role.
    Alternate(String),
}

impl std::fmt::Display for LinkagePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkagePath::Primary => write!(f, "primary"),
            LinkagePath::Alternate(role) => write!(f, "alternate:{}", role),
        }
    }
}

/// One row of the canonical registry, loaded into the in-memory index.
///
/// Name fields are already normalized (lowercased, accent-folded); the
/// `_token` variants hold the extracted first-name token used by the
/// strict matching rule.
#[derive(Debug, Clone)]
pub struct CanonicalPatient {
    pub id: i64,
    pub partner_a_name: Option<String>,
    pub partner_b_name: Option<String>,
    pub partner_a_token: Option<String>,
    pub partner_b_token: Option<String>,
    pub active: bool,
    /// Alternate-role identifier slots as (role, value) pairs.
    pub alternates: Vec<(String, i64)>,
}

/// A loosely-keyed patient pointer from an external source.
#[derive(Debug, Clone)]
pub struct ExternalReference {
    pub value: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub resolved_id: i64,
}

impl ExternalReference {
    pub fn is_resolved(&self) -> bool {
        self.resolved_id != UNRESOLVED
    }
}

/// Sentinel for an external reference that no pass has resolved yet.
pub const UNRESOLVED: i64 = -1;

/// A record fetched from a remote site before it enters the mirror.
///
/// `payload` holds business fields only; site, fetch timestamp, and run id
/// are supplied separately so they never leak into the fingerprint.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub patient_ref: Option<i64>,
    pub case_name: Option<String>,
    pub payload: Map<String, Value>,
}

/// Outcome of one incremental sync batch.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

/// Per-site crawl result counters.
#[derive(Debug, Clone, Default)]
pub struct UnitSummary {
    pub site: String,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_inserted: usize,
}
