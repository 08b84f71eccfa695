//! regsync mirrors patient records from remote lab sites into a local
//! SQLite database and links the loosely-keyed external references they
//! carry to canonical registry identities.
//!
//! Three moving parts:
//!
//! - a crawler that walks each site's patient and case listings, one
//!   rate-limited worker per site, checkpointing its progress;
//! - an incremental sync layer that fingerprints every fetched record and
//!   only appends content not already mirrored;
//! - a multi-pass resolver that scores candidate registry matches by
//!   linkage path and name agreement, strictest pass first.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod crawl;
pub mod db;
pub mod fingerprint;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod rate_limit;
pub mod registry;
pub mod resolve;
pub mod status;
pub mod sync;
