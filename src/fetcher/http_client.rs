use crate::config::ApiConfig;
use crate::error::{Result, SmartError};
use crate::fetcher::SiteReportSource;
use crate::fetcher::parsers::parse_output;
use crate::models::{DateWindow, Record, SiteId};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// reqwest-backed client for `GET /api/sitrep/site/{site}/`.
pub struct SmartApiClient {
    inner: reqwest::Client,
    base_url: Url,
    key: String,
}

impl SmartApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true);
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            inner: builder.build()?,
            base_url: parse_base_url(&config.base_url)?,
            key: config.key.clone(),
        })
    }

    /// Full request URL, key included. Never log this.
    pub fn report_url(&self, window: &DateWindow, site: &SiteId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|_| SmartError::config(format!("API base URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "sitrep", "site", site.as_str(), ""]);
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("date_start", &window.start.format("%Y-%m-%d").to_string())
            .append_pair("date_end", &window.end.format("%Y-%m-%d").to_string());
        Ok(url)
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| SmartError::config(format!("invalid API base URL `{raw}`: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(SmartError::config(format!("API base URL `{raw}` cannot take a path")));
    }
    Ok(url)
}

#[async_trait]
impl SiteReportSource for SmartApiClient {
    async fn fetch_site_report(&self, window: &DateWindow, site: &SiteId) -> Result<Vec<Record>> {
        let url = self.report_url(window, site)?;
        debug!("GET {} ({})", url.path(), window);

        let resp = self
            .inner
            .get(url)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if status != StatusCode::OK {
            return Err(SmartError::Api {
                status: status.as_u16(),
                body,
            });
        }

        parse_output(&body)
    }
}
