//! tiercache: an HTTP response cache for axum.
//!
//! Responses for paths matching configured rules are captured on a miss,
//! stored as metadata in memory plus a body file on disk, and served from
//! there on later requests.

pub mod cache;
pub mod config;
pub mod infra;
