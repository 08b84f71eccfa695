//! Match scoring and winner selection for external patient references.
//!
//! Candidates arrive from the registry index tagged with the linkage path
//! they were reached through. This module validates them against the
//! reference's name token, scores the survivors, and picks a single winner.
//!
//! Combined score = name term + linkage-path term, lower is better:
//!
//! - name term: 0 exact token equality, 2 no external token available,
//!   4 substring-only containment; candidates failing containment are
//!   discarded outright.
//! - path term: declared rank x 10, primary identifier at rank 0, so any
//!   primary match outranks any alternate regardless of name term.
//!
//! Remaining ties go to the larger canonical id. Arbitrary, but it has to
//! be deterministic and this mirrors what the matching has always done.

use std::collections::BTreeMap;

use crate::models::{CanonicalPatient, LinkagePath};

/// Rank applied to alternate roles absent from the configured priority list.
const UNRANKED_ROLE: u32 = 9;

/// Spacing between path ranks. Must exceed the largest name term so the
/// path ordering is never inverted by name quality.
const PATH_RANK_STEP: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRule {
    /// Match the external first-name token against the partners' first-name tokens.
    FirstName,
    /// Relaxed: match the concatenated "first last" key against full partner names.
    FullName,
}

impl NameRule {
    pub fn parse(s: &str) -> Option<NameRule> {
        match s {
            "first_name" => Some(NameRule::FirstName),
            "full_name" => Some(NameRule::FullName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    role_ranks: BTreeMap<String, u32>,
}

impl MatchConfig {
    pub fn new(role_ranks: BTreeMap<String, u32>) -> Self {
        Self { role_ranks }
    }

    fn path_rank(&self, path: &LinkagePath) -> u32 {
        match path {
            LinkagePath::Primary => 0,
            LinkagePath::Alternate(role) => self
                .role_ranks
                .get(role)
                .copied()
                .unwrap_or(UNRANKED_ROLE),
        }
    }
}

/// The winning candidate for one external reference within one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub patient_id: i64,
    pub path: LinkagePath,
    pub score: u32,
}

/// Pick the best candidate for one external reference, or `None` when no
/// candidate survives name validation (a normal "no match yet" outcome).
pub fn resolve_reference(
    candidates: &[(&CanonicalPatient, LinkagePath)],
    external_token: Option<&str>,
    rule: NameRule,
    config: &MatchConfig,
) -> Option<Selection> {
    let mut best: Option<Selection> = None;

    for (patient, path) in candidates {
        let Some(name_term) = name_term(patient, external_token, rule) else {
            continue;
        };
        let score = name_term + config.path_rank(path) * PATH_RANK_STEP;

        let better = match &best {
            None => true,
            Some(current) => {
                score < current.score
                    || (score == current.score && patient.id > current.patient_id)
            }
        };
        if better {
            best = Some(Selection {
                patient_id: patient.id,
                path: path.clone(),
                score,
            });
        }
    }

    best
}

/// Name-quality term for one candidate, or `None` to discard it.
///
/// An absent external token never discards: the identifier match alone is
/// trusted, at a worse score than an exact name confirmation.
fn name_term(patient: &CanonicalPatient, external_token: Option<&str>, rule: NameRule) -> Option<u32> {
    let token = match external_token {
        Some(t) if !t.is_empty() => t,
        _ => return Some(2),
    };

    let (a, b) = match rule {
        NameRule::FirstName => (&patient.partner_a_token, &patient.partner_b_token),
        NameRule::FullName => (&patient.partner_a_name, &patient.partner_b_name),
    };

    let exact = matches(a, |n| n == token) || matches(b, |n| n == token);
    if exact {
        return Some(0);
    }
    let contained = matches(a, |n| n.contains(token)) || matches(b, |n| n.contains(token));
    if contained {
        return Some(4);
    }
    None
}

fn matches(name: &Option<String>, pred: impl Fn(&str) -> bool) -> bool {
    name.as_deref().map(&pred).unwrap_or(false)
}

// ============ Name normalization ============

/// Normalize a raw name: lowercase, fold Latin accents, collapse whitespace.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_space = true;
    for c in raw.trim().to_lowercase().chars() {
        let f = fold_char(c);
        if f.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(f);
            last_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Extract the first-name token from a free-text name field.
///
/// Handles both "FIRST MIDDLE" and "LAST, FIRST MIDDLE" layouts, plus the
/// dotted abbreviations lab operators type ("VALADARES, FLAVIA.F.N." yields
/// "flavia"). Returns `None` when no alphabetic run exists.
pub fn first_name_token(raw: &str) -> Option<String> {
    let part = match raw.split_once(',') {
        Some((_, after)) => after,
        None => raw,
    };
    let normalized = normalize_name(part);

    let mut token = String::new();
    for c in normalized.chars() {
        if c.is_ascii_alphabetic() {
            token.push(c);
        } else if !token.is_empty() {
            break;
        }
    }

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Build the relaxed-rule key: "first last" with dots stripped from the
/// first name, matching how full partner names are stored.
pub fn full_name_key(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let first = first.unwrap_or("").replace('.', " ");
    let last = last.unwrap_or("");
    let key = normalize_name(&format!("{} {}", first, last));
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Fold common Latin accented characters to their ASCII base.
fn fold_char(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        'ý' | 'ÿ' => 'y',
        _ => c,
    }
}
