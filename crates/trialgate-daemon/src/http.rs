//! HTTP surface: health, admin triggers, registration forwarding, metrics.
//!
//! Admins get structured JSON error payloads; registrants get a generic
//! localized failure message so backend details never leak through the
//! form. All routes share one axum router served from the daemon's main
//! task set.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use anyhow::Context;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use trialgate_core::gateway::MembershipGateway;
use trialgate_core::registry::{RegistrationForm, RegistryClient};

use crate::metrics::SharedMetricsRegistry;
use crate::reconciler::{PassOutcome, Reconciler};

/// Generic localized failure message shown to registrants.
const REGISTER_FAILURE_MESSAGE: &str =
    "เกิดข้อผิดพลาดในการลงทะเบียน กรุณาลองใหม่อีกครั้ง";

/// Localized message for incomplete registration submissions.
const REGISTER_INCOMPLETE_MESSAGE: &str = "กรุณากรอกข้อมูลให้ครบถ้วน";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    /// The reconciliation core; admin triggers re-enter its pipeline.
    pub reconciler: Arc<Reconciler>,
    /// Registry client used by the registration-forwarding routes.
    pub registry: Arc<dyn RegistryClient>,
    /// Prometheus registry for `/metrics`.
    pub metrics: SharedMetricsRegistry,
    /// Login status string surfaced by `/health`.
    pub login_status: Arc<RwLock<String>>,
    /// Daemon start time, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    fn login_status(&self) -> String {
        self.login_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Runs the bot credential check and records the outcome for `/health`.
///
/// Returns `true` on success so callers know when to stop retrying. On
/// failure the previous status string is left in place.
pub async fn refresh_login_status(
    gateway: &dyn MembershipGateway,
    login_status: &RwLock<String>,
) -> bool {
    match gateway.identity_check().await {
        Ok(username) => {
            info!(%username, "bot credential verified");
            *login_status
                .write()
                .unwrap_or_else(PoisonError::into_inner) = format!("connected as {username}");
            true
        },
        Err(err) => {
            warn!(%err, "bot credential check failed");
            false
        },
    }
}

/// Builds the daemon's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/trigger-check", post(trigger_check))
        .route("/force-approve", post(force_approve))
        .route("/register", post(register))
        .route("/status", get(status_lookup))
        .with_state(state)
}

/// Binds and serves the HTTP surface until the task is cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn run_http_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP surface")?;
    info!(addr = %addr, "HTTP surface listening");
    axum::serve(listener, app).await.context("HTTP server error")?;
    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "trialgate",
        "loginStatus": state.login_status(),
        "activeTrials": state.reconciler.active_trials(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {err}"),
            )
                .into_response()
        },
    }
}

fn outcome_value(outcome: PassOutcome) -> Value {
    match outcome {
        PassOutcome::Completed { processed } => json!(processed),
        PassOutcome::SkippedInProgress => json!("skipped, in progress"),
    }
}

/// Forces an out-of-cycle run of both reconciliation passes.
///
/// The re-entrancy guards still apply: a pass already in flight reports
/// "skipped, in progress" instead of running concurrently.
async fn trigger_check(State(state): State<AppState>) -> Json<Value> {
    info!("admin trigger: forced reconciliation");
    let approval = state.reconciler.run_approval_pass().await;
    let expiry = state.reconciler.run_expiry_pass().await;

    let skipped = approval == PassOutcome::SkippedInProgress
        || expiry == PassOutcome::SkippedInProgress;
    let message = if skipped {
        "reconciliation triggered, some passes skipped (already in progress)"
    } else {
        "reconciliation passes completed"
    };

    Json(json!({
        "success": true,
        "message": message,
        "details": {
            "approved": outcome_value(approval),
            "expired": outcome_value(expiry),
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceApproveRequest {
    member_id: String,
}

/// Manually grants trial access to one member, bypassing the registry.
async fn force_approve(
    State(state): State<AppState>,
    Json(request): Json<ForceApproveRequest>,
) -> (StatusCode, Json<Value>) {
    if request.member_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "memberId required" })),
        );
    }

    info!(member_id = %request.member_id, "admin trigger: force approve");
    match state.reconciler.force_approve(&request.member_id).await {
        Ok(member) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!(
                    "trial access granted to {} (expiry untracked in registry)",
                    member.display_name
                ),
            })),
        ),
        Err(err @ crate::reconciler::ReconcileError::MemberNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": err.to_string() })),
        ),
        Err(err) => {
            warn!(%err, "force approve failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "success": false, "message": err.to_string() })),
            )
        },
    }
}

/// Accepts a registration submission and forwards it to the registry.
async fn register(
    State(state): State<AppState>,
    Json(form): Json<RegistrationForm>,
) -> (StatusCode, Json<Value>) {
    if form.missing_required_field() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": REGISTER_INCOMPLETE_MESSAGE })),
        );
    }

    match state.registry.submit_registration(&form).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "ลงทะเบียนสำเร็จ รอการอนุมัติจากแอดมิน",
                "driveLink": receipt.drive_link,
            })),
        ),
        Err(err) => {
            error!(%err, "registration forwarding failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": REGISTER_FAILURE_MESSAGE })),
            )
        },
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    username: Option<String>,
}

/// Looks up a registration's status; the payload shape is the backend's.
async fn status_lookup(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> (StatusCode, Json<Value>) {
    let Some(username) = query.username.filter(|u| !u.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Username required" })),
        );
    };

    match state.registry.lookup_status(&username).await {
        Ok(payload) => (StatusCode::OK, Json(payload)),
        Err(err) => {
            warn!(%err, "status lookup failed");
            (
                StatusCode::OK,
                Json(json!({ "found": false, "error": "Failed to fetch status" })),
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::DateTime;
    use trialgate_core::gateway::{GatewayError, Member, MembershipGateway};
    use trialgate_core::registry::{
        Candidate, CandidateStatus, RegistrationReceipt, RegistryError,
    };

    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::reconciler::ReconcilerConfig;

    struct StubRegistry {
        submit_fails: bool,
        lookup_fails: bool,
    }

    #[async_trait]
    impl RegistryClient for StubRegistry {
        async fn fetch_approved(&self) -> Result<Vec<Candidate>, RegistryError> {
            Ok(Vec::new())
        }

        async fn fetch_expired(&self) -> Result<Vec<Candidate>, RegistryError> {
            Ok(Vec::new())
        }

        async fn update_status(
            &self,
            _row_id: u64,
            _new_status: CandidateStatus,
            _expires_at: Option<DateTime<Utc>>,
        ) -> Result<bool, RegistryError> {
            Ok(true)
        }

        async fn submit_registration(
            &self,
            _form: &RegistrationForm,
        ) -> Result<RegistrationReceipt, RegistryError> {
            if self.submit_fails {
                Err(RegistryError::Network("down".to_string()))
            } else {
                Ok(RegistrationReceipt {
                    drive_link: Some("https://drive.example/slip".to_string()),
                })
            }
        }

        async fn lookup_status(&self, username: &str) -> Result<Value, RegistryError> {
            if self.lookup_fails {
                Err(RegistryError::Timeout(std::time::Duration::from_secs(10)))
            } else {
                Ok(json!({ "found": true, "username": username }))
            }
        }
    }

    struct StubGateway {
        member: Option<Member>,
        identity_fails: bool,
    }

    #[async_trait]
    impl MembershipGateway for StubGateway {
        async fn find_member(&self, _member_id: &str) -> Result<Option<Member>, GatewayError> {
            Ok(self.member.clone())
        }

        async fn grant_role(&self, _member_id: &str, _role_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn revoke_role(&self, _member_id: &str, _role_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn notify(&self, _member_id: &str, _message: &str) -> Result<bool, GatewayError> {
            Ok(true)
        }

        async fn remove_member(&self, _member_id: &str, _reason: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn identity_check(&self) -> Result<String, GatewayError> {
            if self.identity_fails {
                Err(GatewayError::Auth("credential rejected".to_string()))
            } else {
                Ok("trialgate-test".to_string())
            }
        }
    }

    fn state_with(registry: StubRegistry, gateway: StubGateway) -> AppState {
        let registry: Arc<dyn RegistryClient> = Arc::new(registry);
        let gateway: Arc<dyn MembershipGateway> = Arc::new(gateway);
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let config = ReconcilerConfig {
            pending_role_id: "role-pending".to_string(),
            trial_role_id: "role-trial".to_string(),
            trial_duration_minutes: 3,
            poll_interval: std::time::Duration::from_secs(30),
            expiry_every_ticks: 2,
        };
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            gateway,
            config,
            metrics.daemon_metrics(),
        ));
        AppState {
            reconciler,
            registry,
            metrics,
            login_status: Arc::new(RwLock::new("connected as trialgate-test".to_string())),
            started_at: Instant::now(),
        }
    }

    fn default_state() -> AppState {
        state_with(
            StubRegistry {
                submit_fails: false,
                lookup_fails: false,
            },
            StubGateway {
                member: Some(Member {
                    id: "U5".to_string(),
                    display_name: "Nan".to_string(),
                }),
                identity_fails: false,
            },
        )
    }

    fn valid_form() -> RegistrationForm {
        RegistrationForm {
            connext_id: "CX-1".to_string(),
            referral_id: String::new(),
            nickname: "Som".to_string(),
            name: "Somchai".to_string(),
            surname: "Jaidee".to_string(),
            province_country: "Bangkok".to_string(),
            phone_number: "0812345678".to_string(),
            discord_id: "U5".to_string(),
            discord_username: "somchai".to_string(),
        }
    }

    #[tokio::test]
    async fn login_status_refresh_records_success() {
        let status = RwLock::new("disconnected".to_string());
        let gateway = StubGateway {
            member: None,
            identity_fails: false,
        };
        assert!(refresh_login_status(&gateway, &status).await);
        assert_eq!(*status.read().unwrap(), "connected as trialgate-test");
    }

    #[tokio::test]
    async fn login_status_refresh_failure_keeps_prior_status() {
        let status = RwLock::new("disconnected".to_string());
        let gateway = StubGateway {
            member: None,
            identity_fails: true,
        };
        assert!(!refresh_login_status(&gateway, &status).await);
        assert_eq!(*status.read().unwrap(), "disconnected");
    }

    #[tokio::test]
    async fn health_reports_expected_shape() {
        let Json(body) = health(State(default_state())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "trialgate");
        assert_eq!(body["loginStatus"], "connected as trialgate-test");
        assert_eq!(body["activeTrials"], 0);
        assert!(body["uptime"].is_number());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn trigger_check_reports_pass_counts() {
        let Json(body) = trigger_check(State(default_state())).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["details"]["approved"], 0);
        assert_eq!(body["details"]["expired"], 0);
    }

    #[tokio::test]
    async fn force_approve_grants_known_member() {
        let (status, Json(body)) = force_approve(
            State(default_state()),
            Json(ForceApproveRequest {
                member_id: "U5".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn force_approve_unknown_member_is_404() {
        let state = state_with(
            StubRegistry {
                submit_fails: false,
                lookup_fails: false,
            },
            StubGateway {
                member: None,
                identity_fails: false,
            },
        );
        let (status, Json(body)) = force_approve(
            State(state),
            Json(ForceApproveRequest {
                member_id: "ghost".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn force_approve_requires_member_id() {
        let (status, _) = force_approve(
            State(default_state()),
            Json(ForceApproveRequest {
                member_id: "  ".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_rejects_incomplete_form() {
        let mut form = valid_form();
        form.nickname = String::new();
        let (status, Json(body)) = register(State(default_state()), Json(form)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], REGISTER_INCOMPLETE_MESSAGE);
    }

    #[tokio::test]
    async fn register_forwards_and_returns_receipt() {
        let (status, Json(body)) = register(State(default_state()), Json(valid_form())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["driveLink"], "https://drive.example/slip");
    }

    #[tokio::test]
    async fn register_failure_shows_generic_message() {
        let state = state_with(
            StubRegistry {
                submit_fails: true,
                lookup_fails: false,
            },
            StubGateway {
                member: None,
                identity_fails: false,
            },
        );
        let (status, Json(body)) = register(State(state), Json(valid_form())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], REGISTER_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn status_requires_username() {
        let (status, Json(body)) =
            status_lookup(State(default_state()), Query(StatusQuery { username: None })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Username required");
    }

    #[tokio::test]
    async fn status_lookup_failure_is_soft() {
        let state = state_with(
            StubRegistry {
                submit_fails: false,
                lookup_fails: true,
            },
            StubGateway {
                member: None,
                identity_fails: false,
            },
        );
        let (status, Json(body)) = status_lookup(
            State(state),
            Query(StatusQuery {
                username: Some("somchai".to_string()),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["found"], false);
    }
}
