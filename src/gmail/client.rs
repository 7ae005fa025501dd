use std::sync::Arc;

use crate::ratelimit::RateLimiter;

use super::types::*;

pub const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

// Quota unit costs per Gmail API method.
pub const LIST_QUOTA_COST: i64 = 5;
pub const GET_QUOTA_COST: i64 = 5;
pub const BATCH_GET_QUOTA_COST: i64 = 5;
pub const LABELS_QUOTA_COST: i64 = 1;

/// Hard cap on maxResults for messages.list.
const LIST_PAGE_CAP: u32 = 500;

pub struct GmailClient {
    agent: ureq::Agent,
    access_token: String,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug)]
pub enum GmailError {
    Http(String),
    Parse(String),
    Api(String),
    /// HTTP 401: the access token is invalid or expired. Never retried
    /// here; the caller must re-authenticate.
    Unauthorized,
    /// HTTP 429 twice in a row for the same call.
    RateLimited(String),
}

impl std::fmt::Display for GmailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GmailError::Http(e) => write!(f, "HTTP error: {}", e),
            GmailError::Parse(e) => write!(f, "Parse error: {}", e),
            GmailError::Api(e) => write!(f, "API error: {}", e),
            GmailError::Unauthorized => {
                write!(f, "not authenticated (401): re-authentication required")
            }
            GmailError::RateLimited(e) => write!(f, "rate limited: {}", e),
        }
    }
}

impl GmailClient {
    pub fn new(access_token: &str, limiter: Arc<RateLimiter>) -> GmailClient {
        GmailClient {
            agent: ureq::AgentBuilder::new().build(),
            access_token: access_token.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            limiter,
        }
    }

    /// Override the API endpoint (tests point this at a mock server).
    pub fn with_base_url(mut self, base_url: &str) -> GmailClient {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Run one quota-gated request. A 429 waits out extra quota through the
    /// governor and retries exactly once; a second 429 propagates. 401 is
    /// converted into the re-authenticate signal and never retried.
    fn execute(&self, quota_cost: i64, request: ureq::Request) -> Result<String, GmailError> {
        self.limiter.acquire(quota_cost);

        match request.clone().call() {
            Ok(resp) => read_body(resp),
            Err(ureq::Error::Status(429, resp)) => {
                let detail = resp.into_string().unwrap_or_default();
                log_warn!(
                    "[Gmail] 429 rate limited, backing off and retrying once: {}",
                    truncate_str(&detail, 200)
                );
                self.limiter.acquire(quota_cost * 2);
                match request.call() {
                    Ok(resp) => read_body(resp),
                    Err(ureq::Error::Status(429, resp)) => {
                        let detail = resp.into_string().unwrap_or_default();
                        Err(GmailError::RateLimited(
                            truncate_str(&detail, 200).to_string(),
                        ))
                    }
                    Err(e) => Err(map_http_error(e)),
                }
            }
            Err(e) => Err(map_http_error(e)),
        }
    }

    fn get(&self, path: &str) -> ureq::Request {
        self.agent
            .get(&format!("{}{}", self.base_url, path))
            .set("Authorization", &format!("Bearer {}", self.access_token))
    }

    /// messages.list: one page of message IDs matching `query`.
    pub fn list_messages(
        &self,
        user_id: &str,
        query: Option<&str>,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<MessageListResponse, GmailError> {
        log_debug!(
            "[Gmail] messages.list user={} max={} query={:?} page_token={:?}",
            user_id,
            max_results,
            query,
            page_token
        );

        let mut request = self
            .get(&format!("/users/{}/messages", user_id))
            .query("maxResults", &max_results.min(LIST_PAGE_CAP).to_string());
        if let Some(q) = query {
            request = request.query("q", q);
        }
        if let Some(token) = page_token {
            request = request.query("pageToken", token);
        }

        let body = self.execute(LIST_QUOTA_COST, request)?;
        let parsed: MessageListResponse =
            serde_json::from_str(&body).map_err(|e| GmailError::Parse(e.to_string()))?;
        log_debug!(
            "[Gmail] messages.list returned {} ids (next page: {})",
            parsed.messages.len(),
            parsed.next_page_token.is_some()
        );
        Ok(parsed)
    }

    /// messages.batchGet: full content for up to one chunk of IDs in a
    /// single call. Chunking is the fetch pipeline's job, not the client's.
    pub fn batch_get_messages(
        &self,
        user_id: &str,
        ids: &[String],
        format: &str,
    ) -> Result<Vec<Message>, GmailError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        log_debug!(
            "[Gmail] messages.batchGet user={} ids={} format={}",
            user_id,
            ids.len(),
            format
        );

        let request = self
            .get(&format!("/users/{}/messages/batchGet", user_id))
            .query("format", format)
            .query("ids", &ids.join(","));

        let body = self.execute(BATCH_GET_QUOTA_COST, request)?;
        let parsed: BatchGetResponse =
            serde_json::from_str(&body).map_err(|e| GmailError::Parse(e.to_string()))?;
        Ok(parsed.messages)
    }

    /// messages.get: one full message.
    pub fn get_message(
        &self,
        user_id: &str,
        message_id: &str,
        format: &str,
    ) -> Result<Message, GmailError> {
        log_debug!("[Gmail] messages.get user={} id={}", user_id, message_id);

        let request = self
            .get(&format!("/users/{}/messages/{}", user_id, message_id))
            .query("format", format);

        let body = self.execute(GET_QUOTA_COST, request)?;
        serde_json::from_str(&body).map_err(|e| GmailError::Parse(e.to_string()))
    }

    /// labels.list: all labels for the account.
    pub fn list_labels(&self, user_id: &str) -> Result<Vec<Label>, GmailError> {
        log_debug!("[Gmail] labels.list user={}", user_id);

        let request = self.get(&format!("/users/{}/labels", user_id));
        let body = self.execute(LABELS_QUOTA_COST, request)?;
        let parsed: LabelListResponse =
            serde_json::from_str(&body).map_err(|e| GmailError::Parse(e.to_string()))?;
        Ok(parsed.labels)
    }

    /// labels.get: one label by id.
    pub fn get_label(&self, user_id: &str, label_id: &str) -> Result<Label, GmailError> {
        log_debug!("[Gmail] labels.get user={} id={}", user_id, label_id);

        let request = self.get(&format!("/users/{}/labels/{}", user_id, label_id));
        let body = self.execute(LABELS_QUOTA_COST, request)?;
        serde_json::from_str(&body).map_err(|e| GmailError::Parse(e.to_string()))
    }
}

fn read_body(resp: ureq::Response) -> Result<String, GmailError> {
    resp.into_string()
        .map_err(|e| GmailError::Parse(format!("failed to read response: {}", e)))
}

fn map_http_error(err: ureq::Error) -> GmailError {
    match err {
        ureq::Error::Status(401, _) => GmailError::Unauthorized,
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            log_error!("[Gmail] HTTP {} error: {}", code, truncate_str(&body, 200));
            // A structured error body is an API-level rejection; anything
            // else is transport-level.
            match serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(|m| m.to_string()))
            {
                Some(message) => GmailError::Api(format!("HTTP {}: {}", code, message)),
                None => GmailError::Http(format!(
                    "HTTP {} error: {}",
                    code,
                    if body.is_empty() {
                        "(empty response)".to_string()
                    } else {
                        truncate_str(&body, 200).to_string()
                    }
                )),
            }
        }
        e => {
            log_error!("[Gmail] Connection error: {}", e);
            GmailError::Http(e.to_string())
        }
    }
}

pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        // Find a valid UTF-8 boundary
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
