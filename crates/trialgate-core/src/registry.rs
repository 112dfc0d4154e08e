//! Typed client for the approval-registry wire contract.
//!
//! The registry is a spreadsheet-backed web app consulted through a fixed
//! query/command contract:
//!
//! - `GET {url}?action=getApproved&bot_secret=…` and
//!   `GET {url}?action=getExpired&bot_secret=…` return
//!   `{"success": bool, "data": [Candidate…], "error"?: str}`
//! - `POST {url}` with `{"action":"updateStatus","rowId":…,"newStatus":…,
//!   "expireAt"?:…}` returns `{"success": bool}`
//!
//! The registry is the eventual source of truth for every trial. This client
//! owns the timeout policy for outbound calls: every request is bounded (10s
//! default) and never hangs; fetch failures surface as [`RegistryError`] so
//! callers can distinguish empty-due-to-error from empty-due-to-no-data in
//! their observability while treating both as empty for control flow.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::net::{self, HttpsClient};

/// Default bound on every outbound registry call.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Redirect hops followed before a call is abandoned.
const MAX_REDIRECT_HOPS: usize = 3;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// Transport-level failure (connect error, TLS failure, broken body).
    #[error("registry network error: {0}")]
    Network(String),

    /// The bounded timeout elapsed before the call completed.
    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered but reported failure in its envelope.
    #[error("registry backend error: {0}")]
    Backend(String),

    /// The backend answered with an unexpected HTTP status.
    #[error("registry HTTP error: status {status}")]
    Http {
        /// The HTTP status code received.
        status: u16,
    },

    /// The response body was not the expected JSON shape.
    #[error("registry response decode failed: {0}")]
    Decode(String),

    /// The backend reported a status string outside the known set.
    #[error("unknown registry status value: {0:?}")]
    UnknownStatus(String),
}

// =============================================================================
// Data Model
// =============================================================================

/// Closed set of registration states tracked in the registry.
///
/// Wire values outside this set are rejected with
/// [`RegistryError::UnknownStatus`] rather than silently mis-handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateStatus {
    /// Submitted, not yet reviewed.
    Pending,
    /// Approved by an admin, trial not yet started.
    Approved,
    /// Trial running; the registry tracks its expiry timestamp.
    Active,
    /// Trial over; the member is (or is being) removed.
    Expired,
}

impl CandidateStatus {
    /// The exact string the registry backend stores for this status.
    #[must_use]
    pub const fn as_wire_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Active => "Trial Access Active",
            Self::Expired => "expired",
        }
    }

    /// Parses a registry status string.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownStatus`] for anything outside the
    /// closed set.
    pub fn from_wire_str(raw: &str) -> Result<Self, RegistryError> {
        match raw.trim() {
            "Pending" => Ok(Self::Pending),
            "Approved" => Ok(Self::Approved),
            "Trial Access Active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            other => Err(RegistryError::UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// A registry row eligible for a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The registry's unique, immutable identifier for this row.
    pub row_id: u64,
    /// The chat-platform member identifier tied to the registration.
    pub member_external_id: String,
    /// Display name captured at registration time.
    pub display_name: String,
    /// Current registry status.
    pub status: CandidateStatus,
    /// When the registration was submitted, if the backend recorded it.
    pub requested_at: Option<DateTime<Utc>>,
}

/// Raw candidate row as the backend serializes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    row_id: u64,
    member_external_id: String,
    #[serde(default)]
    display_name: String,
    status: String,
    #[serde(default)]
    requested_at: Option<String>,
}

impl WireCandidate {
    fn into_candidate(self) -> Result<Candidate, RegistryError> {
        let status = CandidateStatus::from_wire_str(&self.status)?;
        let requested_at = self
            .requested_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Candidate {
            row_id: self.row_id,
            member_external_id: self.member_external_id,
            display_name: self.display_name,
            status,
            requested_at,
        })
    }
}

/// Fetch envelope shared by `getApproved` and `getExpired`.
#[derive(Debug, Deserialize)]
struct FetchEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<Vec<WireCandidate>>,
    #[serde(default)]
    error: Option<String>,
}

/// Envelope for `updateStatus` and registration submission.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteEnvelope {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    drive_link: Option<String>,
}

/// A registration submission forwarded to the registry backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationForm {
    /// Platform account identifier (registry column A).
    pub connext_id: String,
    /// Optional referral identifier.
    #[serde(default)]
    pub referral_id: String,
    /// Nickname.
    pub nickname: String,
    /// Given name.
    pub name: String,
    /// Family name.
    pub surname: String,
    /// Province or country of residence.
    pub province_country: String,
    /// Contact phone number.
    pub phone_number: String,
    /// Chat-platform member identifier, if the registrant linked one.
    #[serde(default)]
    pub discord_id: String,
    /// Chat-platform username, if linked.
    #[serde(default)]
    pub discord_username: String,
}

impl RegistrationForm {
    /// Checks the fields the backend requires to accept a submission.
    #[must_use]
    pub fn missing_required_field(&self) -> bool {
        [
            &self.connext_id,
            &self.nickname,
            &self.name,
            &self.surname,
            &self.province_country,
            &self.phone_number,
        ]
        .iter()
        .any(|field| field.trim().is_empty())
    }
}

/// Backend acknowledgement of a registration submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReceipt {
    /// Link to the uploaded evidence document, when the backend returns one.
    pub drive_link: Option<String>,
}

// =============================================================================
// RegistryClient Trait
// =============================================================================

/// Typed request/response wrapper around the approval-state backend.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetches candidates approved but not yet promoted to an active trial.
    async fn fetch_approved(&self) -> Result<Vec<Candidate>, RegistryError>;

    /// Fetches candidates whose externally-tracked expiry has passed and who
    /// are still marked active.
    async fn fetch_expired(&self) -> Result<Vec<Candidate>, RegistryError>;

    /// Writes a new status (and optional expiry timestamp) for a row.
    ///
    /// Idempotent on the backend side; returns the backend's success flag.
    async fn update_status(
        &self,
        row_id: u64,
        new_status: CandidateStatus,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RegistryError>;

    /// Forwards a registration submission to the backend.
    async fn submit_registration(
        &self,
        form: &RegistrationForm,
    ) -> Result<RegistrationReceipt, RegistryError>;

    /// Looks up the registration status for a username; the payload shape is
    /// owned by the backend and passed through untouched.
    async fn lookup_status(&self, username: &str) -> Result<serde_json::Value, RegistryError>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// HTTP implementation of [`RegistryClient`].
pub struct HttpRegistryClient {
    base_url: String,
    secret: SecretString,
    timeout: Duration,
    client: HttpsClient,
}

impl HttpRegistryClient {
    /// Creates a client for the given backend URL and shared secret.
    #[must_use]
    pub fn new(base_url: impl Into<String>, secret: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            secret,
            timeout: DEFAULT_REGISTRY_TIMEOUT,
            client: net::https_client(),
        }
    }

    /// Overrides the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn action_url(&self, action: &str) -> String {
        format!(
            "{}?action={action}&bot_secret={}",
            self.base_url.trim_end_matches('/'),
            self.secret.expose_secret()
        )
    }

    async fn send(
        &self,
        method: Method,
        uri: String,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes, RegistryError> {
        let body_bytes = match &body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| RegistryError::Decode(e.to_string()))?,
            None => Vec::new(),
        };

        // Spreadsheet-script backends answer through a redirect to a
        // one-time content URL; follow a bounded number of hops, always
        // downgrading to GET as browsers do for 302.
        let mut method = method;
        let mut uri = uri;
        let mut body_bytes = body_bytes;
        for _ in 0..=MAX_REDIRECT_HOPS {
            let request = Request::builder()
                .method(method.clone())
                .uri(&uri)
                .header("Content-Type", "application/json")
                .header("User-Agent", "trialgate-daemon/0.1")
                .body(Full::new(Bytes::from(body_bytes.clone())))
                .map_err(|e| RegistryError::Network(e.to_string()))?;

            let response = tokio::time::timeout(self.timeout, self.client.request(request))
                .await
                .map_err(|_| RegistryError::Timeout(self.timeout))?
                .map_err(|e| RegistryError::Network(e.to_string()))?;

            let status = response.status();
            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(http::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(RegistryError::Http {
                        status: status.as_u16(),
                    });
                };
                uri = location.to_string();
                method = Method::GET;
                body_bytes = Vec::new();
                continue;
            }

            if status != StatusCode::OK {
                return Err(RegistryError::Http {
                    status: status.as_u16(),
                });
            }

            return tokio::time::timeout(self.timeout, net::collect_body(response.into_body()))
                .await
                .map_err(|_| RegistryError::Timeout(self.timeout))?
                .map_err(RegistryError::Network);
        }

        Err(RegistryError::Network(format!(
            "too many redirects (> {MAX_REDIRECT_HOPS})"
        )))
    }

    async fn fetch_action(&self, action: &str) -> Result<Vec<Candidate>, RegistryError> {
        let bytes = self
            .send(Method::GET, self.action_url(action), None)
            .await?;
        let envelope: FetchEnvelope =
            serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode(e.to_string()))?;
        if !envelope.success {
            return Err(RegistryError::Backend(
                envelope.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        Ok(decode_candidates(envelope.data.unwrap_or_default()))
    }
}

/// Converts wire rows, dropping (with a warning) any row whose status string
/// is outside the closed set. A malformed row never poisons the batch.
fn decode_candidates(rows: Vec<WireCandidate>) -> Vec<Candidate> {
    rows.into_iter()
        .filter_map(|row| {
            let row_id = row.row_id;
            match row.into_candidate() {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    warn!(row_id, %err, "dropping registry row with unrecognized status");
                    None
                },
            }
        })
        .collect()
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_approved(&self) -> Result<Vec<Candidate>, RegistryError> {
        self.fetch_action("getApproved").await
    }

    async fn fetch_expired(&self) -> Result<Vec<Candidate>, RegistryError> {
        self.fetch_action("getExpired").await
    }

    async fn update_status(
        &self,
        row_id: u64,
        new_status: CandidateStatus,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RegistryError> {
        let body = serde_json::json!({
            "action": "updateStatus",
            "bot_secret": self.secret.expose_secret(),
            "rowId": row_id,
            "newStatus": new_status.as_wire_str(),
            "expireAt": expires_at.map(|dt| dt.to_rfc3339()),
        });

        debug!(row_id, status = %new_status, "writing registry status");

        let bytes = self
            .send(Method::POST, self.base_url.clone(), Some(body))
            .await?;
        let envelope: WriteEnvelope =
            serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(envelope.success)
    }

    async fn submit_registration(
        &self,
        form: &RegistrationForm,
    ) -> Result<RegistrationReceipt, RegistryError> {
        let mut body = serde_json::to_value(form)
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        if let Some(map) = body.as_object_mut() {
            map.insert(
                "submittedAt".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }

        let bytes = self
            .send(Method::POST, self.base_url.clone(), Some(body))
            .await?;
        let envelope: WriteEnvelope =
            serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode(e.to_string()))?;
        if !envelope.success {
            return Err(RegistryError::Backend(
                envelope.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        Ok(RegistrationReceipt {
            drive_link: envelope.drive_link,
        })
    }

    async fn lookup_status(&self, username: &str) -> Result<serde_json::Value, RegistryError> {
        let uri = format!(
            "{}?username={username}&bot_secret={}",
            self.base_url.trim_end_matches('/'),
            self.secret.expose_secret()
        );
        let bytes = self.send(Method::GET, uri, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode(e.to_string()))
    }
}
