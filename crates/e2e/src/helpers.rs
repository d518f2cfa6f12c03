//! Helper API for simulating external events
//!
//! Inbound calls, SMS and email come from outside the product. Scenarios
//! trigger them through a test-harness service that fronts the telephony and
//! mail providers. Agent skill changes go through the same service.

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallHandle {
    pub call_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: String,
    #[serde(default)]
    pub from: String,
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// External collaborators a scenario depends on
#[async_trait]
pub trait HelperApi: Send + Sync {
    async fn simulate_inbound_call(&self, from: &str, to: &str, hold_ms: Option<u64>) -> E2eResult<CallHandle>;

    async fn send_sms(&self, from: &str, to: &str, body: &str) -> E2eResult<()>;

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> E2eResult<()>;

    /// Messages currently in a test inbox
    async fn inbox(&self, address: &str) -> E2eResult<Vec<EmailMessage>>;

    async fn set_agent_skill(&self, agent: &str, skill: &str, enabled: bool) -> E2eResult<()>;
}

/// [`HelperApi`] over the harness service's JSON endpoints
pub struct HttpHelperClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpHelperClient {
    pub fn new(base_url: &str) -> E2eResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| E2eError::Helper(format!("invalid helper API URL {:?}: {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with percent-encoded path segments appended
    fn endpoint(&self, segments: &[&str]) -> E2eResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| E2eError::Helper(format!("helper API URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Option<serde_json::Value>) -> E2eResult<reqwest::Response> {
        debug!(%method, %url, "helper API request");

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        Self::checked(&method, &url, response).await
    }

    async fn checked(method: &Method, url: &Url, response: reqwest::Response) -> E2eResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(E2eError::Helper(format!(
            "{} {} returned {}: {}",
            method,
            url.path(),
            status,
            text.trim()
        )))
    }
}

#[async_trait]
impl HelperApi for HttpHelperClient {
    async fn simulate_inbound_call(&self, from: &str, to: &str, hold_ms: Option<u64>) -> E2eResult<CallHandle> {
        let url = self.endpoint(&["calls"])?;
        let body = json!({ "from": from, "to": to, "hold_ms": hold_ms });
        let handle: CallHandle = self.send(Method::POST, url, Some(body)).await?.json().await?;
        info!(call_id = %handle.call_id, from, to, "inbound call placed");
        Ok(handle)
    }

    async fn send_sms(&self, from: &str, to: &str, body: &str) -> E2eResult<()> {
        let url = self.endpoint(&["sms"])?;
        self.send(Method::POST, url, Some(json!({ "from": from, "to": to, "body": body })))
            .await?;
        info!(from, to, "sms sent");
        Ok(())
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> E2eResult<()> {
        let url = self.endpoint(&["email"])?;
        self.send(Method::POST, url, Some(json!({ "to": to, "subject": subject, "body": body })))
            .await?;
        info!(to, subject, "email sent");
        Ok(())
    }

    async fn inbox(&self, address: &str) -> E2eResult<Vec<EmailMessage>> {
        let url = self.endpoint(&["inbox", address])?;
        debug!(%url, "helper API request");
        let response = self.client.get(url.clone()).send().await?;
        // Inbox not created until the first message lands
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(Self::checked(&Method::GET, &url, response).await?.json().await?)
    }

    async fn set_agent_skill(&self, agent: &str, skill: &str, enabled: bool) -> E2eResult<()> {
        let url = self.endpoint(&["agents", agent, "skills", skill])?;
        self.send(Method::PUT, url, Some(json!({ "enabled": enabled }))).await?;
        info!(agent, skill, enabled, "agent skill updated");
        Ok(())
    }
}
