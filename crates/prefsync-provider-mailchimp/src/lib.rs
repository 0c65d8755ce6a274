// # Mailchimp Mailing-List Client
//
// This crate provides a Mailchimp Marketing API v3 implementation of
// `MailingListClient` for the prefsync system.
//
// ## Implementation Status
//
// - ✅ Makes exactly one HTTP request per call
// - ✅ Full error propagation to engine (engine handles retries and backoff)
// - ✅ HTTP timeout configured (30 seconds)
// - ✅ HTTP status preserved on every service error (400, 401/403, 404, 429, 5xx)
// - ✅ Dry-run mode for safe testing
// - ❌ NO retry logic (intentionally omitted - owned by SyncEngine)
// - ❌ NO backoff logic (intentionally omitted - owned by SyncEngine)
// - ❌ NO caching of member state
// - ❌ NO background tasks
//
// ## Trust Level: Untrusted (Mailing-List Client)
//
// **Allowed Capabilities**:
// - ✅ Perform HTTPS calls to the Mailchimp API only
// - ✅ Parse Mailchimp error responses
//
// **Forbidden Capabilities**:
// - ❌ Implement retry logic (owned by SyncEngine)
// - ❌ Access the preference store (owned by SyncEngine)
// - ❌ Hold credentials between calls (they arrive in each `ListTarget`)
//
// ## Security Requirements
//
// - API key NEVER appears in logs, errors, or Debug output
//
// ## API Reference
//
// - Base URL: `https://{server_prefix}.api.mailchimp.com/3.0`
// - Add or update member: PUT `/lists/{list_id}/members/{subscriber_hash}`
// - Add or remove member tags: POST `/lists/{list_id}/members/{subscriber_hash}/tags`
//
// The member endpoints accept the contact address in place of the
// subscriber hash.

use async_trait::async_trait;
use prefsync_core::traits::{ListTarget, MailingListClient, MemberUpsert};
use prefsync_core::{Error, Result, TagTransition};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

/// Name reported in errors and logs
const PROVIDER_NAME: &str = "mailchimp";

/// Default HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailchimp Marketing API client
///
/// # Trust Level: Untrusted
///
/// This client is isolated, stateless, and single-shot. Retries and backoff
/// are owned by `SyncEngine`.
///
/// # Dry-Run Mode
///
/// When `dry_run` is true, the client logs the request it would send and
/// reports success without contacting Mailchimp.
#[derive(Debug, Clone)]
pub struct MailchimpClient {
    /// HTTP client for API requests
    client: reqwest::Client,

    /// Base URL override (tests and proxies); `None` derives it from the server prefix
    base_url: Option<String>,

    /// Dry-run mode: log requests instead of sending them
    dry_run: bool,
}

impl MailchimpClient {
    /// Create a new Mailchimp client
    ///
    /// # Parameters
    ///
    /// - `dry_run`: If true, log requests instead of sending them
    pub fn new(dry_run: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        if dry_run {
            tracing::warn!("Mailchimp client running in DRY-RUN mode - no changes will be made");
        }

        Ok(Self {
            client,
            base_url: None,
            dry_run,
        })
    }

    /// Create a client that sends requests (production/live mode)
    pub fn new_live() -> Result<Self> {
        Self::new(false)
    }

    /// Create a client that only logs requests (dry-run mode)
    pub fn new_dry_run() -> Result<Self> {
        Self::new(true)
    }

    /// Send every request to `base_url` instead of the data-center host
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Whether requests are only logged
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// URL of a member resource, with `extra` path segments appended
    fn member_url(&self, target: &ListTarget, address: &str, extra: &[&str]) -> Result<Url> {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => format!("https://{}.api.mailchimp.com/3.0", target.server_prefix()),
        };

        let mut url = Url::parse(&base)
            .map_err(|e| Error::config(format!("Invalid Mailchimp base URL {}: {}", base, e)))?;

        url.path_segments_mut()
            .map_err(|_| Error::config(format!("Mailchimp base URL cannot have a path: {}", base)))?
            .pop_if_empty()
            .extend(["lists", target.list_id(), "members", address])
            .extend(extra);

        Ok(url)
    }

    /// Send a request, mapping failures to service errors
    async fn send(
        &self,
        method: reqwest::Method,
        url: Url,
        target: &ListTarget,
        body: &Value,
        operation: &str,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would send {} {} with payload: {}",
                method,
                url,
                body
            );
            return Ok(());
        }

        tracing::debug!("{} {}", method, url);

        let response = self
            .client
            .request(method, url)
            .basic_auth("prefsync", Some(target.api_key()))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                Error::transport(PROVIDER_NAME, format!("{} request failed: {}", operation, e.without_url()))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        Err(status_error(status, operation, &error_text))
    }
}

/// Map a non-success response to a service error carrying its status
fn status_error(status: StatusCode, operation: &str, body: &str) -> Error {
    // Mailchimp error bodies are problem documents with a "detail" field
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| json.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    let message = match status.as_u16() {
        401 | 403 => format!(
            "Authentication failed: invalid API key or insufficient permissions ({})",
            operation
        ),
        404 => format!("List or member not found ({}): {}", operation, detail),
        429 => format!("Rate limit exceeded ({}). Please retry later.", operation),
        500..=599 => format!("Mailchimp server error (transient, {}): {}", operation, detail),
        _ => format!("{} rejected: {}", operation, detail),
    };

    Error::service(PROVIDER_NAME, status.as_u16(), message)
}

#[async_trait]
impl MailingListClient for MailchimpClient {
    /// Create or replace a list member
    ///
    /// # API Call
    ///
    /// ```http
    /// PUT /lists/:list_id/members/:address
    /// {
    ///   "email_address": "user@example.com",
    ///   "status": "subscribed",
    ///   "status_if_new": "subscribed",
    ///   "tags": ["Marketing Emails"]
    /// }
    /// ```
    async fn upsert_member(
        &self,
        target: &ListTarget,
        address: &str,
        member: &MemberUpsert,
    ) -> Result<()> {
        tracing::info!(
            "Setting Mailchimp member {} to {} with tags {:?} [mode: {}]",
            address,
            member.status,
            member.tags,
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        let url = self.member_url(target, address, &[])?;
        let body = serde_json::json!({
            "email_address": address,
            "status": member.status.as_str(),
            "status_if_new": member.status.as_str(),
            "tags": member.tags,
        });

        self.send(reqwest::Method::PUT, url, target, &body, "upsert_member")
            .await
    }

    /// Set individual tags active or inactive
    ///
    /// # API Call
    ///
    /// ```http
    /// POST /lists/:list_id/members/:address/tags
    /// {
    ///   "tags": [{"name": "Marketing Emails", "status": "inactive"}]
    /// }
    /// ```
    async fn update_member_tags(
        &self,
        target: &ListTarget,
        address: &str,
        transitions: &[TagTransition],
    ) -> Result<()> {
        tracing::info!(
            "Updating {} Mailchimp tag(s) for {} [mode: {}]",
            transitions.len(),
            address,
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        let url = self.member_url(target, address, &["tags"])?;
        let body = serde_json::json!({ "tags": transitions });

        self.send(reqwest::Method::POST, url, target, &body, "update_member_tags")
            .await
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prefsync_core::{PreferenceKey, SubscriptionStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target() -> ListTarget {
        ListTarget::new("secret-key-us1", "us1", "abc123")
    }

    fn member() -> MemberUpsert {
        MemberUpsert {
            status: SubscriptionStatus::Subscribed,
            tags: vec!["Marketing Emails".to_string()],
        }
    }

    /// A request captured by [`serve_once`]
    struct CapturedRequest {
        head: String,
        body: Value,
    }

    /// Accept one connection, answer with `status` and `body`, and return the request
    async fn serve_once(
        status_line: &'static str,
        response_body: &'static str,
    ) -> (String, tokio::task::JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/3.0", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut buf = Vec::new();
            let header_end = loop {
                let mut chunk = [0u8; 4096];
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers were read");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);

            while buf.len() < header_end + content_length {
                let mut chunk = [0u8; 4096];
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                response_body.len(),
                response_body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(Value::Null);
            CapturedRequest { head, body }
        });

        (base_url, handle)
    }

    #[test]
    fn test_member_url_encodes_address() {
        let client = MailchimpClient::new_live().unwrap();
        let url = client
            .member_url(&target(), "first+last@example.com", &["tags"])
            .unwrap();

        assert_eq!(url.host_str(), Some("us1.api.mailchimp.com"));
        assert_eq!(
            url.path(),
            "/3.0/lists/abc123/members/first+last@example.com/tags"
        );

        let spaced = client.member_url(&target(), "a b/c@example.com", &[]).unwrap();
        assert_eq!(spaced.path(), "/3.0/lists/abc123/members/a%20b%2Fc@example.com");
    }

    #[test]
    fn test_base_url_override() {
        let client = MailchimpClient::new_live()
            .unwrap()
            .with_base_url("http://127.0.0.1:9/");
        let url = client.member_url(&target(), "u@example.com", &[]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9/lists/abc123/members/u@example.com");
    }

    #[test]
    fn test_status_mapping_preserves_status() {
        let cases = [
            (StatusCode::BAD_REQUEST, false),
            (StatusCode::UNAUTHORIZED, false),
            (StatusCode::NOT_FOUND, false),
            (StatusCode::TOO_MANY_REQUESTS, true),
            (StatusCode::INTERNAL_SERVER_ERROR, true),
            (StatusCode::SERVICE_UNAVAILABLE, true),
        ];

        for (status, retryable) in cases {
            let err = status_error(status, "upsert_member", "");
            assert_eq!(err.status(), Some(status.as_u16()));
            assert_eq!(err.is_retryable(), retryable, "{}", status);
        }
    }

    #[test]
    fn test_status_error_uses_problem_detail() {
        let body = r#"{"title":"Invalid Resource","status":400,"detail":"Please provide a valid email address."}"#;
        let err = status_error(StatusCode::BAD_REQUEST, "upsert_member", body);
        assert!(err.to_string().contains("Please provide a valid email address."));
    }

    #[test]
    fn test_provider_name() {
        let client = MailchimpClient::new_live().unwrap();
        assert_eq!(client.provider_name(), "mailchimp");
    }

    #[test]
    fn test_api_key_not_exposed_in_debug() {
        let client = MailchimpClient::new_live().unwrap();
        let debug_str = format!("{:?} {:?}", client, target());
        assert!(!debug_str.contains("secret-key-us1"));
        assert!(debug_str.contains("MailchimpClient"));
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        // Nothing listens on the discard port; a real send would fail
        let client = MailchimpClient::new_dry_run()
            .unwrap()
            .with_base_url("http://127.0.0.1:9/3.0");
        assert!(client.is_dry_run());

        client
            .upsert_member(&target(), "u@example.com", &member())
            .await
            .unwrap();
        client
            .update_member_tags(
                &target(),
                "u@example.com",
                &[TagTransition::deactivate(PreferenceKey::ProductUpdates)],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_request_shape() {
        let (base_url, server) = serve_once("200 OK", r#"{"id":"abc"}"#).await;
        let client = MailchimpClient::new_live().unwrap().with_base_url(base_url);

        client
            .upsert_member(&target(), "u@example.com", &member())
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(
            request.head.starts_with("PUT /3.0/lists/abc123/members/u@example.com "),
            "{}",
            request.head
        );
        assert!(request.head.to_ascii_lowercase().contains("authorization: basic "));
        assert_eq!(
            request.body,
            serde_json::json!({
                "email_address": "u@example.com",
                "status": "subscribed",
                "status_if_new": "subscribed",
                "tags": ["Marketing Emails"],
            })
        );
    }

    #[tokio::test]
    async fn test_tag_request_shape() {
        let (base_url, server) = serve_once("204 No Content", "").await;
        let client = MailchimpClient::new_live().unwrap().with_base_url(base_url);

        client
            .update_member_tags(
                &target(),
                "u@example.com",
                &[
                    TagTransition::deactivate(PreferenceKey::MarketingEmails),
                    TagTransition::activate(PreferenceKey::TodoNotifications),
                ],
            )
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request
            .head
            .starts_with("POST /3.0/lists/abc123/members/u@example.com/tags "));
        assert_eq!(
            request.body,
            serde_json::json!({
                "tags": [
                    {"name": "Marketing Emails", "status": "inactive"},
                    {"name": "Todo Notifications", "status": "active"},
                ]
            })
        );
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (base_url, server) = serve_once(
            "503 Service Unavailable",
            r#"{"detail":"Try again later"}"#,
        )
        .await;
        let client = MailchimpClient::new_live().unwrap().with_base_url(base_url);

        let err = client
            .upsert_member(&target(), "u@example.com", &member())
            .await
            .unwrap_err();
        server.await.unwrap();

        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
        assert!(!err.to_string().contains("secret-key-us1"));
    }

    #[tokio::test]
    async fn test_connection_failure_has_no_status() {
        // Bind then drop a listener to get a port with nothing behind it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = MailchimpClient::new_live()
            .unwrap()
            .with_base_url(format!("http://{}/3.0", addr));

        let err = client
            .upsert_member(&target(), "u@example.com", &member())
            .await
            .unwrap_err();

        assert_eq!(err.status(), None);
        assert!(!err.is_retryable());
    }
}
