//! Membership gateway over the chat platform's REST primitives.
//!
//! Wraps the member/role/DM/kick operations the reconciler needs. The
//! platform is treated as unreliable: a member may not exist (a normal wait
//! state, not an error), any call may fail transiently, and notifications
//! are best-effort. Each operation is independently fallible so a failure in
//! one step never aborts sibling steps unnecessarily.
//!
//! The realtime gateway/websocket connection is deliberately not part of
//! this component; everything here is plain REST with bounded timeouts.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Method, Request, StatusCode};
use http_body_util::Full;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::net::{self, HttpsClient};

/// Default bound on every outbound gateway call.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default REST API base for the hosting chat platform.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by membership gateway operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    /// Transport-level failure.
    #[error("gateway network error: {0}")]
    Network(String),

    /// The bounded timeout elapsed before the call completed.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// The platform rejected the bot credential.
    #[error("gateway authentication failed: {0}")]
    Auth(String),

    /// The platform answered with an unexpected status.
    #[error("gateway API error: status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error body, when one was readable.
        message: String,
    },

    /// The response body was not the expected JSON shape.
    #[error("gateway response decode failed: {0}")]
    Decode(String),
}

// =============================================================================
// Data Model
// =============================================================================

/// A resolved community member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Platform member identifier.
    pub id: String,
    /// Best available display name (nick, global name, or username).
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    user: WireUser,
    #[serde(default)]
    nick: Option<String>,
}

impl WireMember {
    fn into_member(self) -> Member {
        let display_name = self
            .nick
            .or(self.user.global_name)
            .unwrap_or_else(|| self.user.username.clone());
        Member {
            id: self.user.id,
            display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
}

// =============================================================================
// MembershipGateway Trait
// =============================================================================

/// Member/role operations the reconciler performs against the community.
#[async_trait]
pub trait MembershipGateway: Send + Sync {
    /// Resolves a member by platform identifier.
    ///
    /// `Ok(None)` means the member has not joined the community yet; callers
    /// treat this as a wait state, never a failure.
    async fn find_member(&self, member_id: &str) -> Result<Option<Member>, GatewayError>;

    /// Adds a role to a member.
    async fn grant_role(&self, member_id: &str, role_id: &str) -> Result<(), GatewayError>;

    /// Removes a role from a member.
    ///
    /// Role-not-present (and member-already-gone) is success, not failure.
    async fn revoke_role(&self, member_id: &str, role_id: &str) -> Result<(), GatewayError>;

    /// Sends a direct message, best-effort.
    ///
    /// Returns `Ok(false)` when the member blocks notifications; callers
    /// must not abort the surrounding transition on either `Ok(false)` or
    /// `Err`.
    async fn notify(&self, member_id: &str, message: &str) -> Result<bool, GatewayError>;

    /// Removes (kicks) a member from the community with an audit reason.
    async fn remove_member(&self, member_id: &str, reason: &str) -> Result<(), GatewayError>;

    /// Verifies the bot credential and returns the bot's username.
    ///
    /// Feeds the health surface's login status; failure here is reported,
    /// not fatal.
    async fn identity_check(&self) -> Result<String, GatewayError>;
}

// =============================================================================
// Discord REST Implementation
// =============================================================================

/// [`MembershipGateway`] over the Discord REST API.
pub struct DiscordGateway {
    api_base: String,
    bot_token: SecretString,
    guild_id: String,
    timeout: Duration,
    client: HttpsClient,
}

impl DiscordGateway {
    /// Creates a gateway for the given guild and bot credential.
    #[must_use]
    pub fn new(guild_id: impl Into<String>, bot_token: SecretString) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token,
            guild_id: guild_id.into(),
            timeout: DEFAULT_GATEWAY_TIMEOUT,
            client: net::https_client(),
        }
    }

    /// Overrides the REST API base URL.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Overrides the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        audit_reason: Option<&str>,
    ) -> Result<(StatusCode, Bytes), GatewayError> {
        let uri = format!("{}{path}", self.api_base.trim_end_matches('/'));

        let body_bytes = match &body {
            Some(value) => {
                serde_json::to_vec(value).map_err(|e| GatewayError::Decode(e.to_string()))?
            },
            None => Vec::new(),
        };

        let mut request = Request::builder()
            .method(method)
            .uri(&uri)
            .header(
                "Authorization",
                format!("Bot {}", self.bot_token.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .header("User-Agent", "trialgate-daemon/0.1");

        if let Some(reason) = audit_reason {
            if let Ok(value) = HeaderValue::from_str(reason) {
                request = request.header("X-Audit-Log-Reason", value);
            }
        }

        let request = request
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Auth(
                "bot credential rejected by the platform".to_string(),
            ));
        }

        let bytes = tokio::time::timeout(self.timeout, net::collect_body(response.into_body()))
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
            .map_err(GatewayError::Network)?;

        Ok((status, bytes))
    }
}

fn api_error(status: StatusCode, bytes: &Bytes) -> GatewayError {
    let message = String::from_utf8(bytes.to_vec())
        .unwrap_or_else(|_| format!("HTTP {status}"));
    GatewayError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl MembershipGateway for DiscordGateway {
    async fn find_member(&self, member_id: &str) -> Result<Option<Member>, GatewayError> {
        let path = format!("/guilds/{}/members/{member_id}", self.guild_id);
        let (status, bytes) = self.send(Method::GET, &path, None, None).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        let wire: WireMember =
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(Some(wire.into_member()))
    }

    async fn grant_role(&self, member_id: &str, role_id: &str) -> Result<(), GatewayError> {
        let path = format!(
            "/guilds/{}/members/{member_id}/roles/{role_id}",
            self.guild_id
        );
        let (status, bytes) = self.send(Method::PUT, &path, None, None).await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        debug!(member_id, role_id, "granted role");
        Ok(())
    }

    async fn revoke_role(&self, member_id: &str, role_id: &str) -> Result<(), GatewayError> {
        let path = format!(
            "/guilds/{}/members/{member_id}/roles/{role_id}",
            self.guild_id
        );
        let (status, bytes) = self.send(Method::DELETE, &path, None, None).await?;
        // Role (or member) already absent counts as done.
        if status == StatusCode::NOT_FOUND {
            debug!(member_id, role_id, "role already absent on revoke");
            return Ok(());
        }
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        Ok(())
    }

    async fn notify(&self, member_id: &str, message: &str) -> Result<bool, GatewayError> {
        // DMs need a channel first; both calls are best-effort for callers.
        let open_body = serde_json::json!({ "recipient_id": member_id });
        let (status, bytes) = self
            .send(Method::POST, "/users/@me/channels", Some(open_body), None)
            .await?;
        if status == StatusCode::FORBIDDEN {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        let channel: WireChannel =
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))?;

        let msg_body = serde_json::json!({ "content": message });
        let path = format!("/channels/{}/messages", channel.id);
        let (status, bytes) = self.send(Method::POST, &path, Some(msg_body), None).await?;
        if status == StatusCode::FORBIDDEN {
            // Member blocks DMs from the community.
            warn!(member_id, "notification blocked by member settings");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        Ok(true)
    }

    async fn remove_member(&self, member_id: &str, reason: &str) -> Result<(), GatewayError> {
        let path = format!("/guilds/{}/members/{member_id}", self.guild_id);
        let (status, bytes) = self
            .send(Method::DELETE, &path, None, Some(reason))
            .await?;
        // Already gone is resolved, not an error.
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        Ok(())
    }

    async fn identity_check(&self) -> Result<String, GatewayError> {
        let (status, bytes) = self.send(Method::GET, "/users/@me", None, None).await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        let user: WireUser =
            serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(user.username)
    }
}
