use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    /// Minimum interval between requests to one site, in milliseconds.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: default_rate_limit_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rate_limit_ms() -> u64 {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Rank per alternate-identifier role. Primary-id matches implicitly rank 0;
    /// configured roles must rank 1 or higher so the primary always outranks them.
    #[serde(default = "default_role_ranks")]
    pub role_ranks: BTreeMap<String, u32>,
    #[serde(default = "default_passes")]
    pub passes: Vec<PassConfig>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            role_ranks: default_role_ranks(),
            passes: default_passes(),
        }
    }
}

fn default_role_ranks() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("partner_a".to_string(), 1),
        ("partner_b".to_string(), 1),
        ("guardian_a".to_string(), 2),
        ("guardian_b".to_string(), 2),
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct PassConfig {
    pub subset: String,
    pub rule: String,
}

fn default_passes() -> Vec<PassConfig> {
    vec![
        PassConfig {
            subset: "active".to_string(),
            rule: "first_name".to_string(),
        },
        PassConfig {
            subset: "inactive".to_string(),
            rule: "first_name".to_string(),
        },
        PassConfig {
            subset: "active".to_string(),
            rule: "full_name".to_string(),
        },
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Accept self-signed certificates. Lab devices commonly ship with them.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Override the https scheme, e.g. "http" for a local test endpoint.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_enabled() -> bool {
    true
}

fn default_scheme() -> String {
    "https".to_string()
}

impl SiteConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.crawl.max_retries == 0 {
        anyhow::bail!("crawl.max_retries must be >= 1");
    }

    if config.matching.passes.is_empty() {
        anyhow::bail!("matching.passes must define at least one pass");
    }
    for pass in &config.matching.passes {
        match pass.subset.as_str() {
            "active" | "inactive" => {}
            other => anyhow::bail!(
                "Unknown registry subset: '{}'. Must be active or inactive.",
                other
            ),
        }
        match pass.rule.as_str() {
            "first_name" | "full_name" => {}
            other => anyhow::bail!(
                "Unknown name rule: '{}'. Must be first_name or full_name.",
                other
            ),
        }
    }

    for (role, rank) in &config.matching.role_ranks {
        if *rank == 0 {
            anyhow::bail!(
                "matching.role_ranks.{} must be >= 1 (rank 0 is reserved for the primary identifier)",
                role
            );
        }
    }

    for (name, site) in &config.sites {
        if site.host.is_empty() {
            anyhow::bail!("sites.{}.host must not be empty", name);
        }
        match site.scheme.as_str() {
            "http" | "https" => {}
            other => anyhow::bail!("sites.{}.scheme must be http or https, got '{}'", name, other),
        }
    }

    Ok(config)
}
