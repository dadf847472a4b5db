//! Sync API Client - HTTP communication with the self-hosted server
//!
//! Handles all REST API calls to the sync server:
//! - Login (credentials -> access token)
//! - Book sources, shelf groups, bookshelf and RSS sources (list/save)
//! - Reading progress push
//!
//! Every response is wrapped in a `{isSuccess, errorMsg, data}` envelope.

use super::models::{
    BookRecord, BookSourceRecord, ReadingProgress, RssSourceRecord, Session, ShelfGroupRecord,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote operations the sync engine relies on
///
/// Every call except `login` is authorized by the session's token and
/// addressed to the session's server.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn login(
        &self,
        server_url: &str,
        req: &LoginRequest<'_>,
    ) -> Result<AuthResponse, SyncApiError>;

    async fn list_book_sources(&self, session: &Session) -> Result<Vec<BookSourceRecord>, SyncApiError>;
    async fn save_book_sources(
        &self,
        session: &Session,
        batch: &[BookSourceRecord],
    ) -> Result<bool, SyncApiError>;

    async fn list_shelf_groups(&self, session: &Session) -> Result<Vec<ShelfGroupRecord>, SyncApiError>;
    async fn save_shelf_group(
        &self,
        session: &Session,
        group: &ShelfGroupRecord,
    ) -> Result<bool, SyncApiError>;

    async fn list_bookshelf(&self, session: &Session) -> Result<Vec<BookRecord>, SyncApiError>;
    async fn save_book(&self, session: &Session, book: &BookRecord) -> Result<bool, SyncApiError>;

    async fn list_rss_sources(&self, session: &Session) -> Result<Vec<RssSourceRecord>, SyncApiError>;
    async fn save_rss_sources(
        &self,
        session: &Session,
        batch: &[RssSourceRecord],
    ) -> Result<bool, SyncApiError>;

    async fn save_progress(
        &self,
        session: &Session,
        progress: &ReadingProgress,
    ) -> Result<bool, SyncApiError>;
}

/// API client for the sync server
#[derive(Clone)]
pub struct SyncApiClient {
    client: Client,
}

impl SyncApiClient {
    /// Create new API client
    pub fn new(timeout: Duration) -> Result<Self, SyncApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
    ) -> Result<Vec<T>, SyncApiError> {
        let response = self.client
            .get(format!("{}/{}", session.server_url, path))
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        let envelope: ApiEnvelope<Vec<T>> = handle_response(response).await?;
        envelope.into_data().map(Option::unwrap_or_default)
    }

    async fn post_save<B: Serialize + ?Sized>(
        &self,
        session: &Session,
        path: &str,
        body: &B,
    ) -> Result<bool, SyncApiError> {
        let response = self.client
            .post(format!("{}/{}", session.server_url, path))
            .bearer_auth(&session.access_token)
            .json(body)
            .send()
            .await?;

        let envelope: ApiEnvelope<serde_json::Value> = handle_response(response).await?;
        if !envelope.is_success {
            log::warn!(
                "Server refused save to /{}: {}",
                path,
                envelope.error_msg.as_deref().unwrap_or("no reason given")
            );
        }
        Ok(envelope.is_success)
    }
}

#[async_trait]
impl RemoteApi for SyncApiClient {
    async fn login(
        &self,
        server_url: &str,
        req: &LoginRequest<'_>,
    ) -> Result<AuthResponse, SyncApiError> {
        let response = self.client
            .post(format!("{}/login", server_url))
            .json(req)
            .send()
            .await?;

        let envelope: ApiEnvelope<AuthResponse> = handle_response(response).await?;
        if !envelope.is_success {
            log::warn!(
                "Login rejected for {}: {}",
                req.username,
                envelope.error_msg.as_deref().unwrap_or("no reason given")
            );
            return Err(SyncApiError::InvalidCredentials);
        }

        envelope.data.ok_or(SyncApiError::InvalidResponse)
    }

    async fn list_book_sources(&self, session: &Session) -> Result<Vec<BookSourceRecord>, SyncApiError> {
        self.get_list(session, "book-sources").await
    }

    async fn save_book_sources(
        &self,
        session: &Session,
        batch: &[BookSourceRecord],
    ) -> Result<bool, SyncApiError> {
        self.post_save(session, "book-sources", batch).await
    }

    async fn list_shelf_groups(&self, session: &Session) -> Result<Vec<ShelfGroupRecord>, SyncApiError> {
        self.get_list(session, "groups").await
    }

    async fn save_shelf_group(
        &self,
        session: &Session,
        group: &ShelfGroupRecord,
    ) -> Result<bool, SyncApiError> {
        self.post_save(session, "groups", group).await
    }

    async fn list_bookshelf(&self, session: &Session) -> Result<Vec<BookRecord>, SyncApiError> {
        self.get_list(session, "bookshelf").await
    }

    async fn save_book(&self, session: &Session, book: &BookRecord) -> Result<bool, SyncApiError> {
        self.post_save(session, "bookshelf", book).await
    }

    async fn list_rss_sources(&self, session: &Session) -> Result<Vec<RssSourceRecord>, SyncApiError> {
        self.get_list(session, "rss-sources").await
    }

    async fn save_rss_sources(
        &self,
        session: &Session,
        batch: &[RssSourceRecord],
    ) -> Result<bool, SyncApiError> {
        self.post_save(session, "rss-sources", batch).await
    }

    async fn save_progress(
        &self,
        session: &Session,
        progress: &ReadingProgress,
    ) -> Result<bool, SyncApiError> {
        self.post_save(session, "progress", progress).await
    }
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub device_id: &'a str,
    pub device_name: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    /// Token lifetime in seconds
    pub expires_in: i64,
}

/// Response envelope used by every endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEnvelope<T> {
    is_success: bool,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Payload of a read call; a refused read is an error
    fn into_data(self) -> Result<Option<T>, SyncApiError> {
        if self.is_success {
            Ok(self.data)
        } else {
            Err(SyncApiError::Rejected(
                self.error_msg.unwrap_or_else(|| "request refused".to_string()),
            ))
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Request refused by server: {0}")]
    Rejected(String),
}

impl SyncApiError {
    /// Worth retrying: the request may not have reached the server
    pub fn is_transient(&self) -> bool {
        match self {
            SyncApiError::Request(e) => e.is_timeout() || e.is_connect(),
            SyncApiError::NetworkError(_)
            | SyncApiError::ServerError(_)
            | SyncApiError::RateLimitExceeded => true,
            _ => false,
        }
    }
}

/// Handle successful JSON response
async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::InvalidCredentials,
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        s if s.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(msg)
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::NetworkError(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client() -> SyncApiClient {
        SyncApiClient::new(Duration::from_secs(5)).unwrap()
    }

    fn session(server_url: String) -> Session {
        Session {
            access_token: "mock_access_token".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            server_url,
            username: "reader".to_string(),
            credential_digest: String::new(),
        }
    }

    #[tokio::test]
    async fn test_login_returns_token() {
        let mut server = Server::new_async().await;

        let mock = server.mock("POST", "/login")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "username": "reader",
                "deviceId": "device-1"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{
                "isSuccess": true,
                "errorMsg": null,
                "data": {"accessToken": "mock_access_token", "expiresIn": 3600}
            }"#)
            .create_async()
            .await;

        let req = LoginRequest {
            username: "reader",
            password: "secret",
            device_id: "device-1",
            device_name: "test",
        };
        let auth = client().login(&server.url(), &req).await.unwrap();

        assert_eq!(auth.access_token, "mock_access_token");
        assert_eq!(auth.expires_in, 3600);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_refused_is_invalid_credentials() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("POST", "/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"isSuccess": false, "errorMsg": "wrong password", "data": null}"#)
            .create_async()
            .await;

        let req = LoginRequest {
            username: "reader",
            password: "wrong",
            device_id: "device-1",
            device_name: "test",
        };
        let err = client().login(&server.url(), &req).await.unwrap_err();
        assert!(matches!(err, SyncApiError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_list_book_sources_sends_bearer_token() {
        let mut server = Server::new_async().await;

        let mock = server.mock("GET", "/book-sources")
            .match_header("authorization", "Bearer mock_access_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{
                "isSuccess": true,
                "data": [
                    {"bookSourceUrl": "https://a.example.com", "bookSourceName": "A", "lastUpdateTime": 10},
                    {"bookSourceUrl": "https://b.example.com", "lastUpdateTime": 20, "ruleToc": {}}
                ]
            }"#)
            .create_async()
            .await;

        let sources = client().list_book_sources(&session(server.url())).await.unwrap();

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].book_source_name, "A");
        assert!(sources[1].rules.contains_key("ruleToc"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_with_null_data_is_empty() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("GET", "/rss-sources")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"isSuccess": true, "errorMsg": null, "data": null}"#)
            .create_async()
            .await;

        let sources = client().list_rss_sources(&session(server.url())).await.unwrap();
        assert!(sources.is_empty());
    }

    #[tokio::test]
    async fn test_list_refused_is_error() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("GET", "/bookshelf")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"isSuccess": false, "errorMsg": "storage offline"}"#)
            .create_async()
            .await;

        let err = client().list_bookshelf(&session(server.url())).await.unwrap_err();
        match err {
            SyncApiError::Rejected(msg) => assert_eq!(msg, "storage offline"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_save_maps_envelope_to_bool() {
        let mut server = Server::new_async().await;

        let accepted = server.mock("POST", "/groups")
            .match_body(Matcher::PartialJson(serde_json::json!({"groupId": 3, "groupName": "Reading"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"isSuccess": true, "data": ""}"#)
            .create_async()
            .await;

        let refused = server.mock("POST", "/rss-sources")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"isSuccess": false, "errorMsg": "duplicate"}"#)
            .create_async()
            .await;

        let api = client();
        let session = session(server.url());

        let ok = api.save_shelf_group(&session, &ShelfGroupRecord::new(3, "Reading", 0)).await.unwrap();
        assert!(ok);

        let ok = api
            .save_rss_sources(&session, &[RssSourceRecord::new("https://feed", "Feed")])
            .await
            .unwrap();
        assert!(!ok);

        accepted.assert_async().await;
        refused.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let mut server = Server::new_async().await;

        let _unauthorized = server.mock("GET", "/groups")
            .with_status(401)
            .create_async()
            .await;
        let _rate_limited = server.mock("POST", "/progress")
            .with_status(429)
            .with_header("retry-after", "60")
            .create_async()
            .await;
        let _server_error = server.mock("GET", "/bookshelf")
            .with_status(500)
            .with_body("database locked")
            .create_async()
            .await;

        let api = client();
        let session = session(server.url());

        let err = api.list_shelf_groups(&session).await.unwrap_err();
        assert!(matches!(err, SyncApiError::Unauthorized));

        let progress = ReadingProgress {
            name: "Foo".to_string(),
            author: "Bar".to_string(),
            dur_chapter_index: 1,
            dur_chapter_pos: 0,
            dur_chapter_title: None,
            dur_chapter_time: 0,
        };
        let err = api.save_progress(&session, &progress).await.unwrap_err();
        assert!(matches!(err, SyncApiError::RateLimitExceeded));
        assert!(err.is_transient());

        let err = api.list_bookshelf(&session).await.unwrap_err();
        match err {
            SyncApiError::ServerError(msg) => assert_eq!(msg, "database locked"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("GET", "/book-sources")
            .with_status(200)
            .with_body("<html>proxy error</html>")
            .create_async()
            .await;

        let err = client().list_book_sources(&session(server.url())).await.unwrap_err();
        assert!(matches!(err, SyncApiError::InvalidResponse));
        assert!(!err.is_transient());
    }
}
