use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::stream::client::SessionSlot;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Destination id that routes a post to the home timeline.
pub const HOME_DESTINATION: &str = "home";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// REST client authenticated with the session of a chat connection.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    session: SessionSlot,
    request_timeout: Duration,
}

impl ApiClient {
    /// Creates a client with default timeouts.
    pub fn new(base_url: &str, session: SessionSlot) -> Result<Self, ApiError> {
        Self::with_options(base_url, session, ApiClientOptions::default())
    }

    /// Creates a client with custom timeouts.
    pub fn with_options(
        base_url: &str,
        session: SessionSlot,
        options: ApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end().trim_end_matches('/').to_string(),
            session,
            request_timeout: options.request_timeout,
        })
    }

    /// Returns the base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Publishes a post to the home timeline (`None` or `"home"`) or to the
    /// chat with the given id.
    ///
    /// A non-success status is logged and yields `Ok(None)`.
    pub async fn post(
        &self,
        content: &str,
        destination: Option<&str>,
    ) -> Result<Option<Value>, ApiError> {
        let token = self.token()?;
        let endpoint = self.endpoint(&post_path(destination));

        let response = self
            .http
            .post(&endpoint)
            .timeout(self.request_timeout)
            .header("token", token)
            .json(&PostRequest { content })
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            error!(
                event = "post_failed",
                status = status.as_u16(),
                body = %summarize_error_body(&body)
            );
            return Ok(None);
        }

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|err| ApiError::Parse(err.to_string()))
    }

    /// Fetches the chats the account is a member of.
    pub async fn chats(&self) -> Result<PagedResponse<Chat>, ApiError> {
        let token = self.token()?;
        let endpoint = self.endpoint("/chats?autoget=1");

        let response = self
            .http
            .get(&endpoint)
            .timeout(self.request_timeout)
            .header("token", token)
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_paged_response(status, &body)
    }

    fn token(&self) -> Result<String, ApiError> {
        let session = self.session.get().ok_or(ApiError::NotAuthenticated)?;
        Ok(session.token().expose_secret().clone())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Path of the endpoint a post to `destination` goes to.
pub fn post_path(destination: Option<&str>) -> String {
    match destination {
        None | Some(HOME_DESTINATION) => "/home/".to_string(),
        Some(id) => format!("/posts/{id}"),
    }
}

#[derive(Serialize)]
struct PostRequest<'a> {
    content: &'a str,
}

/// Group or direct chat.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    #[serde(rename = "_id")]
    pub id: String,
    pub allow_pinning: bool,
    pub created: i64,
    pub deleted: bool,
    pub icon: String,
    pub icon_color: String,
    pub last_active: i64,
    pub members: Vec<String>,
    pub nickname: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub kind: i64,
}

/// Page of results from an `autoget` listing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PagedResponse<T> {
    pub autoget: Vec<T>,
    #[serde(rename = "page#", default)]
    pub page: u32,
    #[serde(default)]
    pub pages: u32,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("no authenticated session")]
    NotAuthenticated,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: bool,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn parse_paged_response<T>(status: StatusCode, body: &str) -> Result<PagedResponse<T>, ApiError>
where
    T: for<'de> Deserialize<'de>,
{
    let envelope: ErrorEnvelope =
        serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))?;
    if envelope.error {
        return Err(ApiError::Status {
            status,
            body: envelope.kind.unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    serde_json::from_str(body).map_err(|err| ApiError::Parse(err.to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.kind) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
