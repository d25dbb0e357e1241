use async_trait::async_trait;
use chrono::NaiveDate;
use scoap_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CROSSREF_API_BASE: &str = "https://api.crossref.org";

#[derive(Debug, Error)]
pub enum DoiLookupError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unreadable registry response for {doi}: {message}")]
    Parse { doi: String, message: String },
}

/// Source of the date a DOI was registered with its registration agency.
#[async_trait]
pub trait DoiRegistry: Send + Sync {
    /// `Ok(None)` when the registry does not know the DOI or carries no creation date for it.
    async fn registration_date(&self, doi: &str) -> Result<Option<NaiveDate>, DoiLookupError>;
}

/// Crossref `works` lookup. Retries and backoff come from the wrapped [`HttpFetcher`].
pub struct CrossrefRegistry {
    http: HttpFetcher,
    base_url: String,
}

impl CrossrefRegistry {
    pub fn new(http: HttpFetcher) -> Self {
        Self::with_base_url(http, CROSSREF_API_BASE)
    }

    pub fn with_base_url(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn works_url(&self, doi: &str) -> String {
        format!("{}/works/{}", self.base_url, doi.trim())
    }
}

#[async_trait]
impl DoiRegistry for CrossrefRegistry {
    async fn registration_date(&self, doi: &str) -> Result<Option<NaiveDate>, DoiLookupError> {
        let response = match self.http.fetch_bytes(&self.works_url(doi)).await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => {
                debug!(doi, "crossref does not know this DOI");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        parse_registration_date(&response.body).map_err(|message| DoiLookupError::Parse {
            doi: doi.to_string(),
            message,
        })
    }
}

/// Reads `message.created.date-time` from a Crossref works response and keeps its date part.
pub fn parse_registration_date(body: &[u8]) -> Result<Option<NaiveDate>, String> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|err| err.to_string())?;
    let Some(stamp) = value
        .pointer("/message/created/date-time")
        .and_then(|v| v.as_str())
    else {
        return Ok(None);
    };
    let date_part = stamp.split('T').next().unwrap_or(stamp);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map(Some)
        .map_err(|err| format!("bad date-time {stamp:?}: {err}"))
}
