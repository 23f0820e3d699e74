//! AWS Client
//!
//! Main client for talking to the per-service AWS endpoints, combining
//! credentials and HTTP functionality.

use super::auth::AwsCredentials;
use super::http::AwsHttpClient;
use anyhow::Result;
use serde_json::Value;

/// Main AWS client: region, credentials, and endpoint construction.
///
/// Endpoints default to `https://{service}.{region}.amazonaws.com`; a single
/// base endpoint can be substituted (LocalStack, tests), in which case
/// services are addressed as `{base}/{service}/...`.
#[derive(Clone)]
pub struct AwsClient {
    pub credentials: AwsCredentials,
    pub http: AwsHttpClient,
    pub region: String,
    endpoint: Option<String>,
}

impl AwsClient {
    /// Create a client with credentials resolved from the environment.
    pub fn new(region: &str) -> Result<Self> {
        Self::build(region, None, AwsCredentials::resolve()?)
    }

    /// Create a client against a custom base endpoint.
    pub fn with_endpoint(region: &str, endpoint: &str, credentials: AwsCredentials) -> Result<Self> {
        Self::build(region, Some(endpoint), credentials)
    }

    fn build(region: &str, endpoint: Option<&str>, credentials: AwsCredentials) -> Result<Self> {
        Ok(Self {
            credentials,
            http: AwsHttpClient::new()?,
            region: region.to_string(),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
        })
    }

    /// Build the URL for a service-relative path (which must start with `/`
    /// and may carry a query string).
    pub fn service_url(&self, service: &str, path_and_query: &str) -> String {
        match &self.endpoint {
            Some(base) => format!("{base}/{service}{path_and_query}"),
            None => format!(
                "https://{service}.{}.amazonaws.com{path_and_query}",
                self.region
            ),
        }
    }

    /// GET a service-relative path (API Gateway, Lambda, S3).
    pub async fn get(&self, service: &str, path_and_query: &str) -> Result<Value> {
        self.http
            .get_json(&self.service_url(service, path_and_query), &self.credentials)
            .await
    }

    /// `X-Amz-Target` JSON POST to a service root (SQS, SNS, CloudFormation).
    pub async fn post_target(&self, service: &str, target: &str, payload: &Value) -> Result<Value> {
        self.http
            .post_target(
                &self.service_url(service, "/"),
                target,
                payload,
                &self.credentials,
            )
            .await
    }
}
