//! Relationship client speaking to the remote REST API over HTTPS.

use async_trait::async_trait;
use blockwatch_core::{BlockwatchError, Credentials, ListMember, RelationshipClient, Result, Subject};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The candidate blocks the subject.
pub const BLOCKED_CODE: u32 = 136;
/// The presented token was rejected.
pub const INVALID_TOKEN_CODE: u32 = 32;
/// The presented token is invalid or expired.
pub const EXPIRED_TOKEN_CODE: u32 = 89;
/// The remote rate limit was exceeded.
pub const RATE_LIMITED_CODE: u32 = 88;

const LIST_PAGE_SIZE: u32 = 5000;

#[derive(Debug, Default, Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MembersPage {
    #[serde(default)]
    users: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct Member {
    id_str: String,
    screen_name: String,
}

fn error_codes(body: &str) -> Vec<u32> {
    serde_json::from_str::<ApiErrors>(body)
        .map(|e| e.errors.into_iter().map(|e| e.code).collect())
        .unwrap_or_default()
}

fn first_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrors>(body)
        .ok()
        .and_then(|e| e.errors.into_iter().next())
        .map(|e| e.message)
        .filter(|m| !m.is_empty())
}

/// Maps an unsuccessful response to the error taxonomy.
pub fn classify_failure(status: StatusCode, body: &str) -> BlockwatchError {
    let codes = error_codes(body);
    let msg = first_message(body).unwrap_or_else(|| status.to_string());

    if status == StatusCode::UNAUTHORIZED
        && (codes.is_empty()
            || codes.contains(&INVALID_TOKEN_CODE)
            || codes.contains(&EXPIRED_TOKEN_CODE))
    {
        return BlockwatchError::Unauthorized;
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || codes.contains(&RATE_LIMITED_CODE)
        || status.is_server_error()
    {
        return BlockwatchError::Transient { msg };
    }
    BlockwatchError::Permanent { msg }
}

/// Interprets the answer to a relationship probe.
///
/// Success means no block and the blocked error code means a block. Only a 401
/// naming a rejected token fails the subject; rate limiting and server errors are
/// transient. Any other client error concerns the candidate alone (deleted,
/// suspended or protected) and counts as not blocking.
pub fn classify_probe(status: StatusCode, body: &str) -> Result<bool> {
    if status.is_success() {
        return Ok(false);
    }
    let codes = error_codes(body);
    if codes.contains(&BLOCKED_CODE) {
        return Ok(true);
    }
    if status == StatusCode::UNAUTHORIZED
        && (codes.contains(&INVALID_TOKEN_CODE) || codes.contains(&EXPIRED_TOKEN_CODE))
    {
        return Err(BlockwatchError::Unauthorized);
    }

    let failure = classify_failure(status, body);
    if failure.is_transient() {
        return Err(failure);
    }
    if status.is_client_error() {
        debug!(status = %status, ?codes, "candidate unavailable, treated as not blocking");
        return Ok(false);
    }
    Err(failure)
}

fn transport_error(e: reqwest::Error) -> BlockwatchError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        BlockwatchError::Transient { msg: e.to_string() }
    } else {
        BlockwatchError::Permanent { msg: e.to_string() }
    }
}

/// HTTP implementation of [`RelationshipClient`].
///
/// List lookups present the application bearer token; relationship probes present
/// the subject's own access token.
pub struct HttpRelationshipClient {
    client: Client,
    base_url: String,
    app_token: Option<String>,
}

impl HttpRelationshipClient {
    /// Creates a client for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, app_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlockwatchError::InvalidConfig {
                reason: format!("building HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_token,
        })
    }

    async fn send(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<(StatusCode, String)> {
        let exchange = async {
            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();
            let body = response.text().await.map_err(transport_error)?;
            Ok::<_, BlockwatchError>((status, body))
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BlockwatchError::Cancelled),
            result = exchange => result,
        }
    }
}

#[async_trait]
impl RelationshipClient for HttpRelationshipClient {
    async fn list_candidates(
        &self,
        owner: &str,
        slug: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListMember>> {
        let url = format!("{}/lists/members.json", self.base_url);
        let count = LIST_PAGE_SIZE.to_string();
        let mut request = self
            .client
            .get(&url)
            .query(&[("owner_screen_name", owner), ("slug", slug), ("count", count.as_str())]);
        if let Some(token) = &self.app_token {
            request = request.bearer_auth(token);
        }

        let (status, body) = self.send(request, cancel).await?;
        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        let page: MembersPage = serde_json::from_str(&body).map_err(|e| BlockwatchError::Permanent {
            msg: format!("unexpected list members payload: {}", e),
        })?;
        debug!(owner, slug, members = page.users.len(), "list members fetched");
        Ok(page
            .users
            .into_iter()
            .map(|m| ListMember {
                external_id: m.id_str,
                screen_name: m.screen_name,
            })
            .collect())
    }

    async fn verify_relationship(
        &self,
        subject: &Subject,
        credentials: &Credentials,
        candidate_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let url = format!("{}/statuses/user_timeline.json", self.base_url);
        let request = self
            .client
            .get(&url)
            .query(&[("user_id", candidate_id), ("count", "1")])
            .bearer_auth(&credentials.access_token);

        let (status, body) = self.send(request, cancel).await?;
        let blocked = classify_probe(status, &body)?;
        trace!(subject = %subject.user_id, candidate = candidate_id, blocked, "relationship probed");
        Ok(blocked)
    }
}
