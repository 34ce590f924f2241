//! GitHub REST client for commit diffs.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, USER_AGENT};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, warn};

use crate::jobs::processor::HandlerError;
use crate::jobs::types::FetchDiffData;
use crate::pipeline::handlers::DiffProvider;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const DIFF_MEDIA_TYPE: &str = "application/vnd.github.diff";

#[derive(Debug, Clone)]
pub struct GithubDiffClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GithubDiffClient {
    /// Client against the public API. Without a token GitHub applies the
    /// unauthenticated rate limit.
    pub fn new(token: Option<String>) -> Self {
        Self::with_api_url(DEFAULT_API_URL, token)
    }

    pub fn with_api_url(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn commit_url(&self, request: &FetchDiffData) -> String {
        format!(
            "{}/repos/{}/{}/commits/{}",
            self.api_url, request.owner, request.repo, request.sha
        )
    }
}

/// Map a rate-limited response to the message format the retry policy
/// understands.
pub fn rate_limit_error(status: StatusCode, headers: &HeaderMap) -> Option<HandlerError> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if header("x-ratelimit-remaining") != Some("0") {
        return None;
    }

    let reset = header("x-ratelimit-reset")?;
    Some(
        HandlerError::new(format!("GitHub API rate limit exceeded. Resets at: {reset}"))
            .with_details(json!({ "status": status.as_u16(), "reset": reset })),
    )
}

#[async_trait]
impl DiffProvider for GithubDiffClient {
    async fn fetch_diff(&self, request: &FetchDiffData) -> Result<String, HandlerError> {
        let url = self.commit_url(request);
        let mut req = self
            .client
            .get(&url)
            .header(ACCEPT, DIFF_MEDIA_TYPE)
            .header(USER_AGENT, "commitpulse");

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HandlerError::new(format!("GitHub request failed: {e}")))?;

        let status = resp.status();
        if let Some(err) = rate_limit_error(status, resp.headers()) {
            warn!(owner = %request.owner, repo = %request.repo, error = %err, "GitHub rate limit hit");
            return Err(err);
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(
                HandlerError::new(format!("GitHub API returned {status} for {}", request.sha))
                    .with_details(json!({ "status": status.as_u16(), "body": body })),
            );
        }

        let diff = resp
            .text()
            .await
            .map_err(|e| HandlerError::new(format!("failed to read GitHub diff: {e}")))?;

        debug!(owner = %request.owner, repo = %request.repo, sha = %request.sha, bytes = diff.len(), "diff downloaded");
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::retry::RetryPolicy;
    use reqwest::header::HeaderValue;

    fn headers(remaining: &str, reset: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("x-ratelimit-remaining", HeaderValue::from_str(remaining).unwrap());
        h.insert("x-ratelimit-reset", HeaderValue::from_str(reset).unwrap());
        h
    }

    #[test]
    fn exhausted_limit_yields_reset_hint() {
        let err = rate_limit_error(StatusCode::FORBIDDEN, &headers("0", "1700000600")).unwrap();

        assert_eq!(
            err.message,
            "GitHub API rate limit exceeded. Resets at: 1700000600"
        );
        let reset = RetryPolicy::rate_limit_reset(&err.message).unwrap();
        assert_eq!(reset.timestamp(), 1_700_000_600);
    }

    #[test]
    fn forbidden_with_remaining_quota_is_not_rate_limited() {
        assert!(rate_limit_error(StatusCode::FORBIDDEN, &headers("12", "1700000600")).is_none());
        assert!(rate_limit_error(StatusCode::NOT_FOUND, &headers("0", "1700000600")).is_none());
    }

    #[test]
    fn commit_url_is_built_from_coordinates() {
        let client = GithubDiffClient::with_api_url("http://localhost:9999/", None);
        let url = client.commit_url(&FetchDiffData {
            owner: "octo".into(),
            repo: "hello".into(),
            sha: "abc1234".into(),
            installation_id: None,
        });
        assert_eq!(url, "http://localhost:9999/repos/octo/hello/commits/abc1234");
    }
}
