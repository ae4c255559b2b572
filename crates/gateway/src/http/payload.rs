use axum::http::{HeaderMap, header};
use pgrole_contracts::{RawPayload, ValidationError};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Reads role fields from a JSON body, a form body, or the query string, in
/// that order of preference. An empty request yields an empty payload.
pub(super) fn decode_payload(
    headers: &HeaderMap,
    query: Option<&str>,
    body: &[u8],
) -> Result<RawPayload, ValidationError> {
    if !body.iter().all(u8::is_ascii_whitespace) {
        if is_form(headers) {
            return decode_pairs(body);
        }
        return RawPayload::from_json(body);
    }

    match query.map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => decode_pairs(query.as_bytes()),
        None => Ok(RawPayload::default()),
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

fn decode_pairs(raw: &[u8]) -> Result<RawPayload, ValidationError> {
    let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw)
        .map_err(|err| ValidationError::InvalidBody(err.to_string()))?;
    RawPayload::from_pairs(pairs)
}
