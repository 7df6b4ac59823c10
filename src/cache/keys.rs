//! Cache key derivation.
//!
//! A key is the hex SHA-256 of `method:path:query:body_hash`, where the query
//! is serialized with its parameters sorted by name and `body_hash` is a short
//! digest prefix of the request body for methods whose body carries meaning.

use std::{collections::BTreeMap, error::Error as _};

use axum::{
    body::Body,
    http::{Method, Request},
};
use http_body_util::LengthLimitError;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of hex characters of the body digest folded into the key.
pub const BODY_HASH_LEN: usize = 16;

/// Query parameters keyed by name, first value wins for repeated names.
pub type QueryParams = BTreeMap<String, String>;

/// Why a request body could not be folded into its key.
#[derive(Debug, Error)]
pub enum RequestBodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Read(#[source] axum::Error),
}

impl RequestBodyError {
    fn from_read(err: axum::Error, limit: usize) -> Self {
        let over_limit = err
            .source()
            .is_some_and(|source| source.is::<LengthLimitError>());
        if over_limit {
            Self::TooLarge { limit }
        } else {
            Self::Read(err)
        }
    }
}

/// Parse a raw query string into a name-sorted mapping.
///
/// Percent-encoding and `+` are decoded. When a name repeats, the first value
/// is kept.
pub fn parse_query(raw: Option<&str>) -> QueryParams {
    let mut params = QueryParams::new();
    let Some(raw) = raw else {
        return params;
    };

    for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        params
            .entry(name.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Whether the body of a request with this method participates in the key.
pub fn body_is_significant(method: &Method) -> bool {
    method == Method::POST || method == Method::PUT
}

/// Derive the cache key for a request.
///
/// `body` is only consulted for POST and PUT; an absent or empty body
/// contributes an empty segment.
pub fn generate_key(
    method: &Method,
    path: &str,
    query: &QueryParams,
    body: Option<&[u8]>,
) -> String {
    let query_string = query
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let body_hash = match body {
        Some(bytes) if body_is_significant(method) && !bytes.is_empty() => {
            let mut digest = sha256_hex(bytes);
            digest.truncate(BODY_HASH_LEN);
            digest
        }
        _ => String::new(),
    };

    let material = format!("{}:{path}:{query_string}:{body_hash}", method.as_str());
    sha256_hex(material.as_bytes())
}

/// Derive the key for an incoming request without consuming its body.
///
/// For POST and PUT the body is collected (up to `limit` bytes), hashed, and
/// the request is rebuilt around an identical in-memory body so downstream
/// extractors still see it.
pub async fn derive_request_key(
    request: Request<Body>,
    limit: usize,
) -> Result<(String, Request<Body>), RequestBodyError> {
    let query = parse_query(request.uri().query());
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    if !body_is_significant(&method) {
        let key = generate_key(&method, &path, &query, None);
        return Ok((key, request));
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|err| RequestBodyError::from_read(err, limit))?;
    let key = generate_key(&method, &path, &query, Some(&bytes));
    Ok((key, Request::from_parts(parts, Body::from(bytes))))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
