use crate::models::{DateWindow, PartitionKey, SiteId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SmartError>;

#[derive(Debug, Error)]
pub enum SmartError {
    /// Bad end date, window spec or missing settings. Raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed API response: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("fetch for site {site} over {window} failed twice, aborting run")]
    FetchExhausted {
        site: SiteId,
        window: DateWindow,
        #[source]
        source: Box<SmartError>,
    },

    #[error("load of {key} failed twice, aborting run")]
    LoadExhausted {
        key: PartitionKey,
        #[source]
        source: Box<SmartError>,
    },
}

impl SmartError {
    pub fn config(msg: impl Into<String>) -> Self {
        SmartError::Configuration(msg.into())
    }
}
