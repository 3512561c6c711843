//! Identity and realtime-token source.
//!
//! The auth service owns the user's identity; the coordinator only reacts to
//! it. [`HttpTokenSource`] reads the logged-in user and a realtime token from
//! the API using the browser session cookie. [`TokenPoller`] re-reads both on
//! an interval and drives the coordinator: a present identity is (re)connected,
//! an absent one is logged out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::COOKIE;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::RealtimeCoordinator;
use crate::error::TokenSourceError;
use crate::identity::{AuthToken, Identity};

const ME_PATH: &str = "/api/auth/me";
const TOKEN_PATH: &str = "/api/chat/token";

/// An authenticated identity with its realtime token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: Identity,
    pub token: AuthToken,
}

#[async_trait]
pub trait IdentityTokenSource: Send + Sync {
    /// `Ok(None)` means nobody is logged in.
    async fn fetch(&self) -> Result<Option<Credentials>, TokenSourceError>;
}

#[derive(Deserialize)]
struct MeResponse {
    user: Option<AuthUser>,
}

#[derive(Deserialize)]
struct AuthUser {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "fullName", default)]
    full_name: String,
    #[serde(rename = "profilePic", default)]
    profile_pic: String,
}

impl From<AuthUser> for Identity {
    fn from(user: AuthUser) -> Self {
        Identity::new(user.id, user.full_name, user.profile_pic)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Reads credentials from the HTTP API with a session cookie.
pub struct HttpTokenSource {
    client: reqwest::Client,
    base_url: String,
    cookie: Option<String>,
}

impl HttpTokenSource {
    pub fn new(
        base_url: &str,
        cookie_name: &str,
        session_cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TokenSourceError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TokenSourceError::InvalidUrl(base_url));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            cookie: session_cookie.map(|value| format!("{cookie_name}={value}")),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, TokenSourceError> {
        let mut request = self.client.get(format!("{}{path}", self.base_url));
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }
        Ok(request.send().await?)
    }

    async fn fetch_identity(&self) -> Result<Option<Identity>, TokenSourceError> {
        let resp = self.get(ME_PATH).await?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                return Err(invalid(ME_PATH, format!("status {status}")));
            }
            _ => {}
        }
        let body: MeResponse = resp
            .json()
            .await
            .map_err(|e| invalid(ME_PATH, e.to_string()))?;
        Ok(body.user.map(Identity::from))
    }

    async fn fetch_token(&self) -> Result<AuthToken, TokenSourceError> {
        let resp = self.get(TOKEN_PATH).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(invalid(TOKEN_PATH, format!("status {status}")));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| invalid(TOKEN_PATH, e.to_string()))?;
        if body.token.is_empty() {
            return Err(invalid(TOKEN_PATH, "empty token".to_string()));
        }
        Ok(AuthToken::new(body.token))
    }
}

#[async_trait]
impl IdentityTokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<Option<Credentials>, TokenSourceError> {
        let Some(identity) = self.fetch_identity().await? else {
            return Ok(None);
        };
        let token = self.fetch_token().await?;
        Ok(Some(Credentials { identity, token }))
    }
}

fn invalid(endpoint: &str, reason: String) -> TokenSourceError {
    TokenSourceError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason,
    }
}

/// What one poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Connected { identity_id: String },
    LoggedOut,
    /// Nobody logged in and no session to tear down.
    Idle,
    /// Source or connect failed; the current session is left alone.
    Failed(String),
}

/// Feeds credentials from a source into the coordinator.
pub struct TokenPoller {
    source: Arc<dyn IdentityTokenSource>,
    coordinator: Arc<RealtimeCoordinator>,
    interval: Duration,
}

impl TokenPoller {
    pub fn new(
        source: Arc<dyn IdentityTokenSource>,
        coordinator: Arc<RealtimeCoordinator>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            coordinator,
            interval,
        }
    }

    pub async fn poll_once(&self) -> PollOutcome {
        match self.source.fetch().await {
            Ok(Some(credentials)) => {
                match self
                    .coordinator
                    .connect(&credentials.identity, &credentials.token)
                    .await
                {
                    Ok(session) => PollOutcome::Connected {
                        identity_id: session.identity.id,
                    },
                    Err(e) => {
                        warn!(error = %e, code = e.error_code(), "realtime connect failed");
                        PollOutcome::Failed(e.to_string())
                    }
                }
            }
            Ok(None) => {
                if self.coordinator.logout().await {
                    info!("identity gone, session closed");
                    PollOutcome::LoggedOut
                } else {
                    PollOutcome::Idle
                }
            }
            Err(e) => {
                warn!(error = %e, "credential fetch failed");
                PollOutcome::Failed(e.to_string())
            }
        }
    }

    /// Poll immediately, then every interval, until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = self.poll_once().await;
                        debug!(?outcome, "credential poll");
                    }
                }
            }
            debug!("token poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::link::memory::MemoryLink;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> HttpTokenSource {
        HttpTokenSource::new(&server.uri(), "jwt", Some("abc"), Duration::from_secs(5)).unwrap()
    }

    // =========================================================================
    // HttpTokenSource
    // =========================================================================

    #[tokio::test]
    async fn fetches_identity_and_token_with_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("cookie", "jwt=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user": {
                    "_id": "u1",
                    "fullName": "Ada Lovelace",
                    "profilePic": "data:image/png;base64,AAAA"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/chat/token"))
            .and(header("cookie", "jwt=abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "rt-1" })),
            )
            .mount(&server)
            .await;

        let credentials = source(&server).fetch().await.unwrap().unwrap();
        assert_eq!(credentials.identity.id, "u1");
        assert_eq!(credentials.identity.display_name, "Ada Lovelace");
        // raw avatar is passed through; sanitizing happens at connect time
        assert!(credentials.identity.avatar_ref.starts_with("data:image"));
        assert_eq!(credentials.token.as_str(), "rt-1");
    }

    #[tokio::test]
    async fn unauthorized_means_logged_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        assert_eq!(source(&server).fetch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_user_means_logged_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "user": null })),
            )
            .mount(&server)
            .await;

        assert_eq!(source(&server).fetch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn token_endpoint_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user": { "_id": "u1", "fullName": "Ada" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/chat/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = source(&server).fetch().await.unwrap_err();
        match err {
            TokenSourceError::InvalidResponse { endpoint, .. } => {
                assert_eq!(endpoint, "/api/chat/token")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = HttpTokenSource::new("ftp://example.com", "jwt", None, Duration::from_secs(1));
        assert!(matches!(err, Err(TokenSourceError::InvalidUrl(_))));
    }

    // =========================================================================
    // TokenPoller
    // =========================================================================

    struct ScriptedSource(Mutex<VecDeque<Option<Credentials>>>);

    #[async_trait]
    impl IdentityTokenSource for ScriptedSource {
        async fn fetch(&self) -> Result<Option<Credentials>, TokenSourceError> {
            Ok(self.0.lock().unwrap().pop_front().flatten())
        }
    }

    fn credentials(id: &str) -> Option<Credentials> {
        Some(Credentials {
            identity: Identity::new(id, format!("User {id}"), ""),
            token: AuthToken::new(format!("tok-{id}")),
        })
    }

    #[tokio::test]
    async fn poller_follows_identity_changes() {
        let link = Arc::new(MemoryLink::new());
        let coordinator = RealtimeCoordinator::init(link.clone(), CoordinatorConfig::default());
        let script = ScriptedSource(Mutex::new(VecDeque::from([
            credentials("u1"),
            credentials("u1"),
            credentials("u3"),
            None,
            None,
        ])));
        let poller = TokenPoller::new(Arc::new(script), coordinator.clone(), Duration::from_secs(60));

        assert_eq!(
            poller.poll_once().await,
            PollOutcome::Connected {
                identity_id: "u1".into()
            }
        );
        poller.poll_once().await;
        assert_eq!(link.connect_calls(), 1);

        poller.poll_once().await;
        assert_eq!(coordinator.current_session().unwrap().identity.id, "u3");

        assert_eq!(poller.poll_once().await, PollOutcome::LoggedOut);
        assert_eq!(poller.poll_once().await, PollOutcome::Idle);
        assert!(coordinator.current_session().is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn connect_failure_is_reported_not_fatal() {
        let link = Arc::new(MemoryLink::new());
        link.fail_next_connect(crate::error::LinkError::Auth("expired".into()));
        let coordinator = RealtimeCoordinator::init(link.clone(), CoordinatorConfig::default());
        let script = ScriptedSource(Mutex::new(VecDeque::from([credentials("u1"), credentials("u1")])));
        let poller = TokenPoller::new(Arc::new(script), coordinator.clone(), Duration::from_secs(60));

        assert!(matches!(poller.poll_once().await, PollOutcome::Failed(_)));
        assert!(matches!(poller.poll_once().await, PollOutcome::Connected { .. }));
        coordinator.shutdown().await;
    }
}
