//! Client for the operation-trigger endpoint.
//!
//! The trigger endpoint starts a server-side generation and returns
//! immediately — it does not stream results. Progress arrives over the
//! realtime connection; the operation id parsed from the trigger response
//! is what consumers filter `latest_for` on.

use anyhow::{bail, Context, Result};

/// HTTP client for starting generation operations.
#[derive(Debug, Clone)]
pub struct TriggerClient {
    http: reqwest::Client,
    server_url: String,
}

impl TriggerClient {
    /// Create a client for the given server base URL.
    #[must_use]
    pub fn new(server_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Start a generation for `user_id` and return the new operation id.
    ///
    /// The endpoint answers with a plain-text acknowledgement of the form
    /// `"Generation started for user: {id}, operation: {uuid}"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the server answers with a
    /// non-success status, or the response carries no operation id.
    pub async fn start_generation(&self, user_id: &str) -> Result<String> {
        let url = format!("{}/generate", self.server_url);
        let response = self
            .http
            .get(&url)
            .query(&[("userId", user_id)])
            .send()
            .await
            .with_context(|| format!("trigger request to {url} failed"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read trigger response body")?;
        if !status.is_success() {
            bail!("trigger endpoint returned {status}: {body}");
        }

        let operation_id = parse_operation_id(&body)
            .with_context(|| format!("no operation id in trigger response: {body:?}"))?;
        log::info!("[Trigger] Started operation {operation_id} for {user_id}");
        Ok(operation_id)
    }
}

/// Pull the operation id out of the trigger acknowledgement text.
fn parse_operation_id(body: &str) -> Option<String> {
    let (_, tail) = body.rsplit_once("operation:")?;
    let id = tail.trim().trim_end_matches(['.', '\n']);
    (!id.is_empty()).then(|| id.to_string())
}
