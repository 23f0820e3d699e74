//! HTTP plumbing for AWS API calls.

use super::auth::AwsCredentials;
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Sanitize response body for logging: truncate and strip non-printable
/// characters.
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        format!(
            "{}... [truncated, {} bytes total]",
            &body[..MAX_LOG_BODY_LENGTH],
            body.len()
        )
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// A non-success response from an AWS API, classified enough for the retry
/// and abort decisions the survey needs to make.
#[derive(Debug, Clone, Error)]
#[error("AWS API error: status {}, code {}: {}", .status, .code.as_deref().unwrap_or("-"), .message)]
pub struct ApiError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, code: Option<&str>, message: &str) -> Self {
        Self {
            status,
            code: code.map(str::to_string),
            message: message.to_string(),
        }
    }

    fn from_response(status: u16, header_code: Option<String>, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let code = header_code.or_else(|| parsed.as_ref().and_then(error_code_from_body));
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message").or_else(|| v.get("Message")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| sanitize_for_log(body));
        Self {
            status,
            code,
            message,
        }
    }

    /// Rate-limiting signals from any of the services.
    pub fn is_throttling(&self) -> bool {
        if self.status == 429 {
            return true;
        }
        self.code.as_deref().is_some_and(|code| {
            code.contains("Throttling")
                || code.contains("RequestThrottled")
                || code == "TooManyRequestsException"
                || code == "RequestLimitExceeded"
        })
    }

    /// Transient conditions worth a backoff-and-retry.
    pub fn is_retryable(&self) -> bool {
        self.is_throttling() || matches!(self.status, 500 | 502 | 503 | 504)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_expired_credentials(&self) -> bool {
        self.code.as_deref().is_some_and(|code| {
            code.starts_with("ExpiredToken")
                || code == "UnrecognizedClientException"
                || code == "InvalidClientTokenId"
        })
    }
}

/// AWS error codes arrive as `x-amzn-errortype` headers, `__type` fields
/// (possibly namespace-qualified with `#`), or nested `Error.Code` fields.
fn error_code_from_body(body: &Value) -> Option<String> {
    let raw = body
        .get("__type")
        .and_then(Value::as_str)
        .or_else(|| body.get("code").and_then(Value::as_str))
        .or_else(|| {
            body.get("Error")
                .and_then(|e| e.get("Code"))
                .and_then(Value::as_str)
        })?;
    Some(raw.rsplit('#').next().unwrap_or(raw).to_string())
}

/// Finds the [`ApiError`] in an error chain, through any added context.
pub fn as_api_error(error: &anyhow::Error) -> Option<&ApiError> {
    error.chain().find_map(|cause| cause.downcast_ref::<ApiError>())
}

/// HTTP client wrapper for AWS API calls
#[derive(Clone)]
pub struct AwsHttpClient {
    client: Client,
}

impl AwsHttpClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sls-dataflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Make a GET request to a JSON API endpoint.
    pub async fn get_json(&self, url: &str, credentials: &AwsCredentials) -> Result<Value> {
        tracing::debug!("GET {}", url);

        let request = credentials.apply(self.client.get(url));
        let response = request.send().await.context("Failed to send request")?;
        Self::read_json(response).await
    }

    /// Make an `X-Amz-Target` style JSON POST (SQS, SNS, CloudFormation).
    pub async fn post_target(
        &self,
        url: &str,
        target: &str,
        payload: &Value,
        credentials: &AwsCredentials,
    ) -> Result<Value> {
        tracing::debug!("POST {} {}", url, target);

        let request = credentials
            .apply(self.client.post(url))
            .header("x-amz-target", target)
            .header(reqwest::header::CONTENT_TYPE, "application/x-amz-json-1.0")
            .json(payload);
        let response = request.send().await.context("Failed to send request")?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let header_code = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty());

        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            // Only log sanitized/truncated error body to avoid leaking sensitive data
            tracing::debug!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(ApiError::from_response(status.as_u16(), header_code, &body).into());
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).context("Failed to parse response JSON")
    }
}

/// Format an error for display to the user, with actionable guidance where
/// the failure mode has one.
pub fn user_facing_error(error: &anyhow::Error) -> String {
    if let Some(api) = as_api_error(error) {
        if api.is_expired_credentials() {
            return "Did you forget to log into AWS? Please log into your AWS account and try again."
                .to_string();
        }
        if api.is_throttling() {
            return "AWS is not able to handle too many requests at the same time. Please try later."
                .to_string();
        }
        return match api.status {
            401 | 403 => "Permission denied. Check your IAM permissions.".to_string(),
            404 => "Resource not found.".to_string(),
            400 => "Invalid request. Check your parameters.".to_string(),
            500 | 502 | 503 | 504 => {
                "AWS service temporarily unavailable. Please try again.".to_string()
            }
            _ => format!("Request failed: {api}"),
        };
    }

    // Truncate and strip anything non-printable before showing it
    let error_str = error.to_string();
    let sanitized: String = error_str
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(120)
        .collect();
    if sanitized.len() < error_str.len() {
        format!("{sanitized}...")
    } else {
        sanitized
    }
}
