//! HTTP client for one remote site.
//!
//! The remote API is token-authenticated: a login call trades credentials
//! for a short-lived token that every later request carries in an
//! `API-token` header. Devices revoke tokens at will, so a 401 mid-run
//! clears the cached token and re-authenticates once before failing.
//! Transient failures are retried with exponential backoff; every outbound
//! request first passes the per-site rate limiter.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{CrawlConfig, SiteConfig};
use crate::models::FetchedRecord;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed for site {site}: {reason}")]
    AuthFailed { site: String, reason: String },
    #[error("request to {url} failed after {attempts} attempts: {last_error}")]
    RequestFailed {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("unexpected payload from {url}: {detail}")]
    UnexpectedPayload { url: String, detail: String },
}

/// The subset of the remote API the crawler depends on. Split out so crawl
/// logic can be tested against an in-memory fake.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list_patients(&self) -> Result<Vec<RemotePatient>, ClientError>;
    async fn list_cases(&self, patient_ref: i64) -> Result<Vec<String>, ClientError>;
    async fn fetch_case_records(
        &self,
        patient_ref: i64,
        case_name: &str,
    ) -> Result<Vec<FetchedRecord>, ClientError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePatient {
    #[serde(rename = "PatientRef")]
    pub patient_ref: i64,
    #[serde(rename = "FirstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "LastName", default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatientList {
    #[serde(rename = "Patients", default)]
    patients: Vec<RemotePatient>,
}

#[derive(Debug, Deserialize)]
struct CaseList {
    #[serde(rename = "Cases", default)]
    cases: Vec<RemoteCase>,
}

#[derive(Debug, Deserialize)]
struct RemoteCase {
    #[serde(rename = "CaseName")]
    case_name: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "Token")]
    token: String,
}

pub struct SiteClient {
    site: String,
    base_url: String,
    username: String,
    password: String,
    crawl: CrawlConfig,
    http: reqwest::Client,
    limiter: RateLimiter,
    token: Mutex<Option<String>>,
}

impl SiteClient {
    pub fn new(site: &str, site_config: &SiteConfig, crawl: &CrawlConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(crawl.timeout_secs))
            .danger_accept_invalid_certs(site_config.accept_invalid_certs)
            .build()?;

        Ok(Self {
            site: site.to_string(),
            base_url: site_config.base_url(),
            username: site_config.username.clone(),
            password: site_config.password.clone(),
            crawl: crawl.clone(),
            http,
            limiter: RateLimiter::new(Duration::from_millis(crawl.rate_limit_ms)),
            token: Mutex::new(None),
        })
    }

    async fn authenticate(&self) -> Result<String, ClientError> {
        let url = format!("{}/LOGIN", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| ClientError::AuthFailed {
                site: self.site.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ClientError::AuthFailed {
                site: self.site.clone(),
                reason: format!("login returned HTTP {}", response.status()),
            });
        }

        let login: LoginResponse =
            response.json().await.map_err(|e| ClientError::AuthFailed {
                site: self.site.clone(),
                reason: format!("malformed login response: {}", e),
            })?;
        Ok(login.token)
    }

    async fn token(&self) -> Result<String, ClientError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.authenticate().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn clear_token(&self) {
        *self.token.lock().await = None;
    }

    /// GET with rate limiting, retries, and one token refresh on 401.
    async fn get_raw(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let mut reauthed = false;
        let mut last_error = String::new();
        let mut attempt = 0;

        while attempt < self.crawl.max_retries {
            attempt += 1;
            self.limiter.wait().await;
            let token = self.token().await?;

            match self
                .http
                .get(&url)
                .query(query)
                .header("API-token", token)
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    self.clear_token().await;
                    if reauthed {
                        // A fresh token was already rejected once; the
                        // credentials themselves are bad.
                        return Err(ClientError::AuthFailed {
                            site: self.site.clone(),
                            reason: "token rejected after refresh".to_string(),
                        });
                    }
                    // One free retry with a fresh token; revocation is
                    // routine on these devices, not a transient fault.
                    reauthed = true;
                    attempt -= 1;
                    continue;
                }
                Ok(response) if response.status().is_success() => {
                    return Ok(response);
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            if attempt < self.crawl.max_retries {
                let delay = self.crawl.backoff_base_ms * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        Err(ClientError::RequestFailed {
            url,
            attempts: self.crawl.max_retries,
            last_error,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.get_raw(path, query).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::UnexpectedPayload {
                url,
                detail: e.to_string(),
            })
    }

    /// Fetch an attached media blob (e.g. a well image) as raw bytes.
    pub async fn fetch_media(
        &self,
        patient_ref: i64,
        case_name: &str,
        name: &str,
    ) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/media", self.base_url);
        let response = self
            .get_raw(
                "/media",
                &[
                    ("PatientRef", patient_ref.to_string()),
                    ("CaseName", case_name.to_string()),
                    ("Name", name.to_string()),
                ],
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::RequestFailed {
                url,
                attempts: 1,
                last_error: e.to_string(),
            })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl RemoteApi for SiteClient {
    async fn list_patients(&self) -> Result<Vec<RemotePatient>, ClientError> {
        let list: PatientList = self.get_json("/patients", &[]).await?;
        Ok(list.patients)
    }

    async fn list_cases(&self, patient_ref: i64) -> Result<Vec<String>, ClientError> {
        let list: CaseList = self
            .get_json("/cases", &[("PatientRef", patient_ref.to_string())])
            .await?;
        Ok(list.cases.into_iter().map(|c| c.case_name).collect())
    }

    async fn fetch_case_records(
        &self,
        patient_ref: i64,
        case_name: &str,
    ) -> Result<Vec<FetchedRecord>, ClientError> {
        let url = format!("{}/records", self.base_url);
        let body: Value = self
            .get_json(
                "/records",
                &[
                    ("PatientRef", patient_ref.to_string()),
                    ("CaseName", case_name.to_string()),
                ],
            )
            .await?;

        let entries = body
            .get("Records")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::UnexpectedPayload {
                url: url.clone(),
                detail: "missing Records array".to_string(),
            })?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let Value::Object(payload) = entry else {
                return Err(ClientError::UnexpectedPayload {
                    url: url.clone(),
                    detail: "non-object entry in Records".to_string(),
                });
            };
            records.push(FetchedRecord {
                patient_ref: Some(patient_ref),
                case_name: Some(case_name.to_string()),
                payload: payload.clone(),
            });
        }
        Ok(records)
    }
}
