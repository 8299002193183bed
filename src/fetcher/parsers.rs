use crate::error::{Result, SmartError};
use crate::models::{Record, SitrepResponse};

/// Longest slice of a bad body echoed into the error.
const BODY_PREVIEW_LEN: usize = 300;

/// Extract the `OUTPUT` rows from a sitrep response body.
pub fn parse_output(body: &str) -> Result<Vec<Record>> {
    serde_json::from_str::<SitrepResponse>(body)
        .map(|resp| resp.output)
        .map_err(|e| SmartError::Decode(format!("{e} (body: {})", preview(body))))
}

fn preview(body: &str) -> &str {
    if body.len() <= BODY_PREVIEW_LEN {
        return body;
    }
    let mut end = BODY_PREVIEW_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
