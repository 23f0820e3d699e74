//! AWS API boundary
//!
//! Everything that talks to (or models talking to) AWS lives here:
//!
//! - [`auth`] - credential resolution from the environment or the shared
//!   credentials file
//! - [`http`] - HTTP plumbing and the typed [`http::ApiError`]
//! - [`client`] - per-service endpoints, GET and target-POST calls
//! - [`retry`] - retry-with-backoff for individual remote calls
//! - [`paging`] - generic pagination over listing calls
//! - [`arn`] - ARN parsing

pub mod arn;
pub mod auth;
pub mod client;
pub mod http;
pub mod paging;
pub mod retry;
