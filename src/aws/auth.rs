//! AWS credential resolution.
//!
//! Credentials are resolved once at startup, following the front of the AWS
//! CLI's default provider chain: environment variables first, then the
//! profile in the shared credentials file. Request signing is outside the
//! modeled provider boundary; the resolved identity travels in headers.

use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;

/// Resolved AWS credentials for one run.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Resolves credentials from the environment or the shared credentials
    /// file, with actionable guidance when nothing is found.
    pub fn resolve() -> Result<Self> {
        if let Some(credentials) = Self::from_env() {
            return Ok(credentials);
        }
        if let Some(credentials) = Self::from_shared_file()? {
            return Ok(credentials);
        }
        Err(anyhow!(
            "No AWS credentials found. Log into your AWS account (aws, saml2aws, okta-aws, ...) \
             or set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY"
        ))
    }

    fn from_env() -> Option<Self> {
        let access_key_id = env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        let session_token = env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty());
        Some(Self::new(access_key_id, secret_access_key, session_token))
    }

    fn shared_credentials_path() -> Option<PathBuf> {
        if let Ok(path) = env::var("AWS_SHARED_CREDENTIALS_FILE") {
            return Some(PathBuf::from(path));
        }
        env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".aws").join("credentials"))
    }

    fn from_shared_file() -> Result<Option<Self>> {
        let Some(path) = Self::shared_credentials_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let profile = env::var("AWS_PROFILE").unwrap_or_else(|_| "default".to_string());
        let content = std::fs::read_to_string(&path)?;
        Ok(parse_credentials_file(&content, &profile))
    }

    /// Attaches the resolved identity to an outgoing request.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(
            reqwest::header::AUTHORIZATION,
            format!("AWS4-HMAC-SHA256 Credential={}", self.access_key_id),
        );
        match &self.session_token {
            Some(token) => request.header("x-amz-security-token", token),
            None => request,
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }
}

/// Parses one profile out of an INI-style shared credentials file.
fn parse_credentials_file(content: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(AwsCredentials::new(
        access_key_id?,
        secret_access_key?,
        session_token,
    ))
}
