//! Session credential acquisition
//!
//! Resilient client for the token endpoint that exchanges a call/room id and
//! identity for a time-bounded media credential. Failures are classified into
//! retryable and non-retryable kinds; retryable ones are retried with
//! exponential backoff before escalating to the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Hard timeout applied to each token request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Token acquisition errors
#[derive(Error, Debug)]
pub enum TokenError {
    /// No network connectivity; never retried
    #[error("no network connectivity")]
    NoNetwork,

    /// The request exceeded the 15 second timeout; retryable
    #[error("token request timed out")]
    Timeout,

    /// 401/403 from the endpoint; never retried
    #[error("authentication rejected (status {0})")]
    Auth(u16),

    /// 404 from the endpoint; never retried
    #[error("room or endpoint not found")]
    NotFound,

    /// 5xx from the endpoint; retryable
    #[error("server error (status {0})")]
    Server(u16),

    /// Transport-level network/fetch failure; retryable
    #[error("network failure: {0}")]
    Network(String),

    /// Anything else; never retried
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl TokenError {
    /// Whether the retry loop should make another attempt for this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Server(_) | Self::Network(_))
    }

    /// Classify an HTTP status code per the endpoint contract
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth(status),
            404 => Self::NotFound,
            s if s >= 500 => Self::Server(s),
            s => Self::Unknown(format!("unexpected status {s}")),
        }
    }
}

/// Request body sent to the token endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    /// Media room, named after the call id
    pub room_name: String,
    /// Identity joining the room
    pub participant_name: String,
    /// Whether this party initiated the call
    pub is_initiator: bool,
}

/// Credential needed to join the media room
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    /// Time-bounded media token
    pub token: String,
    /// Media server to present the token to
    pub server_url: String,
}

/// The authenticated endpoint that issues session credentials
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Pre-flight connectivity check; a `false` here fails the whole
    /// acquisition immediately with [`TokenError::NoNetwork`]
    async fn has_connectivity(&self) -> bool {
        true
    }

    /// Issue one token request (no retries at this layer)
    async fn request(&self, request: &TokenRequest) -> Result<SessionCredential, TokenError>;
}

/// HTTP implementation of the token endpoint
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenEndpoint {
    /// Create a client for the endpoint at `url`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Unknown`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TokenError::Unknown(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn classify(error: reqwest::Error) -> TokenError {
        if error.is_timeout() {
            TokenError::Timeout
        } else if error.is_connect() || error.is_request() {
            TokenError::Network(error.to_string())
        } else {
            TokenError::Unknown(error.to_string())
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request(&self, request: &TokenRequest) -> Result<SessionCredential, TokenError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::from_status(status.as_u16()));
        }
        response
            .json::<SessionCredential>()
            .await
            .map_err(|e| TokenError::Unknown(format!("malformed token response: {e}")))
    }
}

/// Retry configuration for the token client
#[derive(Debug, Clone)]
pub struct TokenClientConfig {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Base delay for retry backoff
    pub base_delay: Duration,
}

impl Default for TokenClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Token client with retry/backoff around a [`TokenEndpoint`]
///
/// Holds no state across invocations beyond its configuration; the retry
/// counter lives on the in-flight call.
pub struct TokenClient<E: TokenEndpoint> {
    endpoint: E,
    config: TokenClientConfig,
}

impl<E: TokenEndpoint> TokenClient<E> {
    /// Wrap an endpoint with the default retry policy
    #[must_use]
    pub fn new(endpoint: E) -> Self {
        Self::with_config(endpoint, TokenClientConfig::default())
    }

    /// Wrap an endpoint with a custom retry policy
    #[must_use]
    pub fn with_config(endpoint: E, config: TokenClientConfig) -> Self {
        Self { endpoint, config }
    }

    /// Obtain a session credential for `call_id` as `identity`.
    ///
    /// Retryable failures (`Timeout`, `Server`, `Network`) are retried up to
    /// `max_retries` additional attempts with delays of
    /// `base_delay * 2^retry`; the last retryable error is surfaced after
    /// exhaustion. Non-retryable failures escalate immediately.
    ///
    /// # Errors
    ///
    /// Returns the classified [`TokenError`].
    pub async fn request_token(
        &self,
        call_id: &str,
        identity: &str,
        is_initiator: bool,
    ) -> Result<SessionCredential, TokenError> {
        if !self.endpoint.has_connectivity().await {
            tracing::warn!(call_id, "token request aborted: no connectivity");
            return Err(TokenError::NoNetwork);
        }

        let request = TokenRequest {
            room_name: call_id.to_string(),
            participant_name: identity.to_string(),
            is_initiator,
        };

        let mut retries = 0u32;
        loop {
            match self.endpoint.request(&request).await {
                Ok(credential) => {
                    tracing::info!(call_id, identity, retries, "session credential acquired");
                    return Ok(credential);
                }
                Err(error) if error.is_retryable() && retries < self.config.max_retries => {
                    let delay = self.config.base_delay * 2u32.pow(retries);
                    tracing::warn!(
                        call_id,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "token request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(error) => {
                    tracing::warn!(call_id, retries, error = %error, "token request failed");
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Endpoint replaying a scripted sequence of responses
    struct ScriptedEndpoint {
        online: bool,
        responses: Mutex<VecDeque<Result<SessionCredential, TokenError>>>,
    }

    impl ScriptedEndpoint {
        fn new(responses: Vec<Result<SessionCredential, TokenError>>) -> Self {
            Self {
                online: true,
                responses: Mutex::new(responses.into()),
            }
        }

        fn offline() -> Self {
            Self {
                online: false,
                responses: Mutex::new(VecDeque::new()),
            }
        }

        fn remaining(&self) -> usize {
            self.responses.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn has_connectivity(&self) -> bool {
            self.online
        }

        async fn request(&self, _request: &TokenRequest) -> Result<SessionCredential, TokenError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TokenError::Unknown("script exhausted".to_string())))
        }
    }

    fn credential() -> SessionCredential {
        SessionCredential {
            token: "jwt".to_string(),
            server_url: "wss://media.example.com".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_server_errors_then_success() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(TokenError::Server(500)),
            Err(TokenError::Server(500)),
            Err(TokenError::Server(500)),
            Ok(credential()),
        ]);
        let client = TokenClient::new(endpoint);

        let start = Instant::now();
        let result = client.request_token("alice_bob", "alice", true).await;

        assert_eq!(result.unwrap(), credential());
        // Delays of 1s, 2s, 4s between the four attempts
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_fails_immediately() {
        let endpoint = ScriptedEndpoint::new(vec![Err(TokenError::Auth(401)), Ok(credential())]);
        let client = TokenClient::new(endpoint);

        let start = Instant::now();
        let result = client.request_token("alice_bob", "alice", false).await;

        assert!(matches!(result, Err(TokenError::Auth(401))));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(client.endpoint.remaining(), 1, "no retry was attempted");
    }

    #[tokio::test]
    async fn test_no_network_preflight() {
        let client = TokenClient::new(ScriptedEndpoint::offline());
        let result = client.request_token("alice_bob", "alice", true).await;
        assert!(matches!(result, Err(TokenError::NoNetwork)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surfaces_last_error() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(TokenError::Timeout),
            Err(TokenError::Network("reset".to_string())),
            Err(TokenError::Timeout),
            Err(TokenError::Server(503)),
            Ok(credential()),
        ]);
        let client = TokenClient::new(endpoint);

        let result = client.request_token("alice_bob", "alice", true).await;
        assert!(matches!(result, Err(TokenError::Server(503))));
        assert_eq!(client.endpoint.remaining(), 1, "exactly four attempts made");
    }

    #[tokio::test]
    async fn test_not_found_fails_immediately() {
        let endpoint = ScriptedEndpoint::new(vec![Err(TokenError::NotFound)]);
        let client = TokenClient::new(endpoint);
        let result = client.request_token("alice_bob", "alice", true).await;
        assert!(matches!(result, Err(TokenError::NotFound)));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(TokenError::from_status(401), TokenError::Auth(401)));
        assert!(matches!(TokenError::from_status(403), TokenError::Auth(403)));
        assert!(matches!(TokenError::from_status(404), TokenError::NotFound));
        assert!(matches!(
            TokenError::from_status(500),
            TokenError::Server(500)
        ));
        assert!(matches!(
            TokenError::from_status(503),
            TokenError::Server(503)
        ));
        assert!(matches!(
            TokenError::from_status(418),
            TokenError::Unknown(_)
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(TokenError::Timeout.is_retryable());
        assert!(TokenError::Server(500).is_retryable());
        assert!(TokenError::Network("x".to_string()).is_retryable());
        assert!(!TokenError::NoNetwork.is_retryable());
        assert!(!TokenError::Auth(401).is_retryable());
        assert!(!TokenError::NotFound.is_retryable());
        assert!(!TokenError::Unknown("x".to_string()).is_retryable());
    }

    #[test]
    fn test_request_wire_format() {
        let request = TokenRequest {
            room_name: "alice_bob".to_string(),
            participant_name: "alice".to_string(),
            is_initiator: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"roomName\":\"alice_bob\""));
        assert!(json.contains("\"participantName\":\"alice\""));

        let credential: SessionCredential = serde_json::from_str(
            r#"{"token":"jwt","serverUrl":"wss://media.example.com"}"#,
        )
        .unwrap();
        assert_eq!(credential.server_url, "wss://media.example.com");
    }
}
