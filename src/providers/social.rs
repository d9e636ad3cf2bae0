//! Social identity lookup

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::SocialLinkProvider;

#[derive(Debug, Deserialize)]
struct SocialLookupResponse {
    #[serde(default)]
    linked: bool,
    #[serde(default)]
    platforms: Vec<String>,
}

/// Looks names up at `GET {base_url}/{name}`.
///
/// Expected body: `{"linked": bool, "platforms": ["twitter", ...]}`.
/// A 404 means the name has no linked identity.
pub struct HttpSocialProvider {
    client: Client,
    base_url: String,
}

impl HttpSocialProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("credit-oracle/0.1")
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SocialLinkProvider for HttpSocialProvider {
    async fn linked_platforms(&self, name: &str) -> Result<Vec<String>> {
        let url = format!("{}/{}", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("social lookup request failed")?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(Vec::new()),
            status if !status.is_success() => bail!("social lookup returned {}", status),
            _ => {}
        }

        let body: SocialLookupResponse = response
            .json()
            .await
            .context("failed to parse social lookup response")?;

        debug!(name, linked = body.linked, platforms = ?body.platforms, "social lookup");

        if !body.linked {
            return Ok(Vec::new());
        }
        if body.platforms.is_empty() {
            return Ok(vec!["unknown".to_string()]);
        }
        Ok(body.platforms)
    }
}

/// Used when no social lookup service is configured: nobody is linked.
pub struct NoSocialProvider;

#[async_trait]
impl SocialLinkProvider for NoSocialProvider {
    async fn linked_platforms(&self, _name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
