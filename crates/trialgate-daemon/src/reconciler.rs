//! The trial-lifecycle reconciliation loop.
//!
//! On a fixed interval the reconciler pulls candidates from the approval
//! registry, applies state transitions through the membership gateway, and
//! records the outcome in the registry and the in-memory trial ledger. The
//! registry is the eventual source of truth: the ledger and dedup guard are
//! derived views that may be lost on restart, and the expiry poll against
//! the registry's own expiry view (not any in-process timer) is the
//! correctness-bearing expiry mechanism.
//!
//! # Transition ordering
//!
//! - **Approved -> Active**: claim the row in the dedup guard before any
//!   side effect; resolve the member (absent is a wait state that releases
//!   the claim); grant the trial role; revoke the pending role (absence
//!   tolerated); notify best-effort; write the registry status last and
//!   release the claim if the write fails, so the row retries next cycle.
//! - **Active -> Expired**: write the registry status FIRST, then notify
//!   and kick. A failed kick is never rolled back; a failed write defers
//!   the kick to the next pass ("update-before-kick").
//!
//! Per-row errors are caught at the row level so one bad row never aborts
//! the batch. A per-kind re-entrancy guard keeps an admin-forced pass from
//! running concurrently with a scheduled one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use trialgate_core::config::BotConfig;
use trialgate_core::gateway::{GatewayError, Member, MembershipGateway};
use trialgate_core::registry::{Candidate, CandidateStatus, RegistryClient, RegistryError};
use trialgate_core::trial::{DedupGuard, TrialLedger, TrialRecord};

use crate::metrics::DaemonMetrics;

/// Default number of poll ticks between expiry passes. Expiry is polled
/// more coarsely than approvals, matching the registration workflow's
/// cadence.
pub const DEFAULT_EXPIRY_EVERY_TICKS: u64 = 2;

/// Audit reason attached to expiry kicks.
pub const EXPIRY_KICK_REASON: &str = "Trial duration expired";

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by reconciliation operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// The member is not present in the community.
    #[error("member {0} not found in community")]
    MemberNotFound(String),

    /// Membership gateway failure.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Registry client failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Role held while awaiting approval.
    pub pending_role_id: String,
    /// Role granted for the trial.
    pub trial_role_id: String,
    /// Trial duration in minutes, fixed per deployment.
    pub trial_duration_minutes: u64,
    /// Interval between poll ticks.
    pub poll_interval: Duration,
    /// Expiry pass runs once every this many ticks.
    pub expiry_every_ticks: u64,
}

impl ReconcilerConfig {
    /// Derives the reconciler configuration from the daemon's startup
    /// config.
    #[must_use]
    pub fn from_bot_config(config: &BotConfig) -> Self {
        Self {
            pending_role_id: config.pending_role_id.clone(),
            trial_role_id: config.trial_role_id.clone(),
            trial_duration_minutes: config.trial_duration_minutes,
            poll_interval: config.poll_interval,
            expiry_every_ticks: DEFAULT_EXPIRY_EVERY_TICKS,
        }
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the trial duration in minutes.
    #[must_use]
    pub const fn with_trial_duration_minutes(mut self, minutes: u64) -> Self {
        self.trial_duration_minutes = minutes;
        self
    }
}

// =============================================================================
// Pass Outcomes
// =============================================================================

/// Which reconciliation pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Approved -> Active promotion pass.
    Approval,
    /// Active -> Expired removal pass.
    Expiry,
}

impl PassKind {
    /// Metric/log label for the pass kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Expiry => "expiry",
        }
    }
}

/// Result of requesting a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The pass ran; `processed` rows completed their transition.
    Completed {
        /// Rows whose transition completed this pass.
        processed: usize,
    },
    /// A pass of the same kind was already in flight; nothing ran.
    SkippedInProgress,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Mutable reconciliation state: the trial ledger plus the dedup guard.
///
/// Owned by the reconciler and locked only for short, non-awaiting
/// sections; never an ambient global.
#[derive(Debug, Default)]
struct ReconcileState {
    ledger: TrialLedger,
    dedup: DedupGuard,
}

/// The scheduler that composes the registry client, membership gateway,
/// trial ledger, and dedup guard into the poll-and-apply cycle.
pub struct Reconciler {
    registry: Arc<dyn RegistryClient>,
    gateway: Arc<dyn MembershipGateway>,
    config: ReconcilerConfig,
    state: Mutex<ReconcileState>,
    approval_in_flight: AtomicBool,
    expiry_in_flight: AtomicBool,
    shutdown: Arc<AtomicBool>,
    metrics: DaemonMetrics,
}

impl Reconciler {
    /// Creates a reconciler over the given collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        gateway: Arc<dyn MembershipGateway>,
        config: ReconcilerConfig,
        metrics: DaemonMetrics,
    ) -> Self {
        Self {
            registry,
            gateway,
            config,
            state: Mutex::new(ReconcileState::default()),
            approval_in_flight: AtomicBool::new(false),
            expiry_in_flight: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    /// Returns a handle for requesting shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Number of currently tracked trials.
    #[must_use]
    pub fn active_trials(&self) -> usize {
        self.lock_state().ledger.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReconcileState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs the scheduled poll loop until shutdown is requested.
    ///
    /// The approval pass runs every tick (including an initial pass at
    /// startup); the expiry pass runs every
    /// [`ReconcilerConfig::expiry_every_ticks`] ticks, offset so the first
    /// one lands one interval after startup.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            trial_duration_minutes = self.config.trial_duration_minutes,
            "reconciler started"
        );

        let every = self.config.expiry_every_ticks.max(1);
        let mut tick: u64 = 0;
        while !self.shutdown.load(Ordering::Relaxed) {
            if self.run_approval_pass().await == PassOutcome::SkippedInProgress {
                warn!("scheduled approval pass skipped, previous still in flight");
            }

            if (tick + 1) % every == 0
                && self.run_expiry_pass().await == PassOutcome::SkippedInProgress
            {
                warn!("scheduled expiry pass skipped, previous still in flight");
            }

            tick = tick.wrapping_add(1);
            tokio::time::sleep(self.config.poll_interval).await;
        }

        info!("reconciler stopped");
    }

    // -------------------------------------------------------------------------
    // Approval pass
    // -------------------------------------------------------------------------

    /// Runs one Approved -> Active pass, unless one is already in flight.
    pub async fn run_approval_pass(&self) -> PassOutcome {
        if self
            .approval_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PassOutcome::SkippedInProgress;
        }

        let processed = self.approval_pass_inner().await;
        self.approval_in_flight.store(false, Ordering::Release);
        self.metrics.pass_completed(PassKind::Approval.as_str());
        PassOutcome::Completed { processed }
    }

    async fn approval_pass_inner(&self) -> usize {
        let candidates = match self.registry.fetch_approved().await {
            Ok(candidates) => candidates,
            Err(err) => {
                // Empty-due-to-error behaves like empty-due-to-no-data for
                // control flow; the log and counter keep them apart.
                warn!(%err, "approved fetch failed, treating as empty batch");
                self.metrics.fetch_failed(PassKind::Approval.as_str());
                return 0;
            },
        };

        if candidates.is_empty() {
            debug!("no approved registrations pending");
            return 0;
        }

        info!(count = candidates.len(), "processing approved registrations");

        let mut granted = 0;
        for candidate in candidates {
            // Claim the row before any side effect so an overlapping
            // trigger cannot re-enter it.
            if !self.lock_state().dedup.mark(candidate.row_id) {
                debug!(row_id = candidate.row_id, "row already claimed, skipping");
                continue;
            }

            match self.process_approval(&candidate).await {
                Ok(true) => granted += 1,
                Ok(false) => {},
                Err(err) => {
                    warn!(
                        row_id = candidate.row_id,
                        member_id = %candidate.member_external_id,
                        %err,
                        "approval processing failed, row will retry next cycle"
                    );
                    self.lock_state().dedup.unmark(candidate.row_id);
                },
            }
        }
        granted
    }

    /// Promotes one approved candidate.
    ///
    /// Returns `Ok(true)` when the trial was granted and recorded,
    /// `Ok(false)` for wait states and deferred writes (claim already
    /// released), `Err` for transient failures (caller releases the claim).
    async fn process_approval(&self, candidate: &Candidate) -> Result<bool, ReconcileError> {
        let member = self
            .gateway
            .find_member(&candidate.member_external_id)
            .await?;

        let Some(member) = member else {
            // Not a failure: the registrant has not joined the community
            // yet. Release the claim so a later cycle picks them up.
            debug!(
                row_id = candidate.row_id,
                member_id = %candidate.member_external_id,
                "member not in community yet, waiting"
            );
            self.lock_state().dedup.unmark(candidate.row_id);
            return Ok(false);
        };

        self.gateway
            .grant_role(&member.id, &self.config.trial_role_id)
            .await?;

        // Pending role may already be gone; that is satisfied state, not
        // failure.
        if let Err(err) = self
            .gateway
            .revoke_role(&member.id, &self.config.pending_role_id)
            .await
        {
            warn!(member_id = %member.id, %err, "pending role revoke failed, continuing");
        }

        let record = TrialRecord::new(
            member.id.clone(),
            candidate.row_id,
            Utc::now(),
            self.config.trial_duration_minutes,
        );

        let name = display_name(candidate, &member);
        let message = welcome_message(name, self.config.trial_duration_minutes);
        match self.gateway.notify(&member.id, &message).await {
            Ok(true) => debug!(member_id = %member.id, "welcome notification sent"),
            Ok(false) => warn!(member_id = %member.id, "welcome notification blocked"),
            Err(err) => warn!(member_id = %member.id, %err, "welcome notification failed"),
        }

        match self
            .registry
            .update_status(
                candidate.row_id,
                CandidateStatus::Active,
                Some(record.expires_at),
            )
            .await
        {
            Ok(true) => {
                let expires_at = record.expires_at;
                let superseded = {
                    let mut state = self.lock_state();
                    let superseded = state.ledger.begin(record);
                    self.metrics.set_active_trials(state.ledger.len());
                    superseded
                };
                if let Some(prior) = superseded {
                    info!(
                        member_id = %member.id,
                        prior_row_id = prior.row_id,
                        "new trial supersedes prior trial for member"
                    );
                }
                info!(
                    row_id = candidate.row_id,
                    member_id = %member.id,
                    %expires_at,
                    "trial granted"
                );
                self.metrics.trial_granted();
                Ok(true)
            },
            Ok(false) => {
                // The member holds the role but the registry does not know;
                // release the claim so the write retries next cycle. The
                // duplicate-notification window this opens is accepted.
                error!(
                    row_id = candidate.row_id,
                    member_id = %member.id,
                    "registry rejected status write after role grant, row will retry"
                );
                self.metrics.write_failed();
                self.lock_state().dedup.unmark(candidate.row_id);
                Ok(false)
            },
            Err(err) => {
                error!(
                    row_id = candidate.row_id,
                    member_id = %member.id,
                    %err,
                    "registry status write failed after role grant, row will retry"
                );
                self.metrics.write_failed();
                self.lock_state().dedup.unmark(candidate.row_id);
                Ok(false)
            },
        }
    }

    // -------------------------------------------------------------------------
    // Expiry pass
    // -------------------------------------------------------------------------

    /// Runs one Active -> Expired pass, unless one is already in flight.
    pub async fn run_expiry_pass(&self) -> PassOutcome {
        if self
            .expiry_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PassOutcome::SkippedInProgress;
        }

        let processed = self.expiry_pass_inner().await;
        self.expiry_in_flight.store(false, Ordering::Release);
        self.metrics.pass_completed(PassKind::Expiry.as_str());
        PassOutcome::Completed { processed }
    }

    async fn expiry_pass_inner(&self) -> usize {
        let candidates = match self.registry.fetch_expired().await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(%err, "expired fetch failed, treating as empty batch");
                self.metrics.fetch_failed(PassKind::Expiry.as_str());
                return 0;
            },
        };

        {
            let mut state = self.lock_state();
            state.ledger.refresh_statuses(Utc::now());
        }

        if candidates.is_empty() {
            return 0;
        }

        info!(count = candidates.len(), "processing expired trials");

        let mut processed = 0;
        for candidate in candidates {
            match self.process_expiry(&candidate).await {
                Ok(true) => processed += 1,
                Ok(false) => {},
                Err(err) => {
                    warn!(
                        row_id = candidate.row_id,
                        member_id = %candidate.member_external_id,
                        %err,
                        "expiry processing failed for row"
                    );
                },
            }
        }
        processed
    }

    /// Retires one expired candidate.
    ///
    /// Returns `Ok(true)` once the registry row is marked expired (whether
    /// or not the member was still present to kick), `Ok(false)` when the
    /// status write failed and the whole step is deferred to the next pass.
    async fn process_expiry(&self, candidate: &Candidate) -> Result<bool, ReconcileError> {
        // Update-before-kick: marking the row first prevents repeated
        // kicking if the kick fails and the row is re-fetched.
        let written = self
            .registry
            .update_status(candidate.row_id, CandidateStatus::Expired, None)
            .await;
        match written {
            Ok(true) => {},
            Ok(false) => {
                error!(
                    row_id = candidate.row_id,
                    "registry rejected expiry write, kick deferred to next pass"
                );
                self.metrics.write_failed();
                return Ok(false);
            },
            Err(err) => {
                error!(
                    row_id = candidate.row_id,
                    %err,
                    "expiry status write failed, kick deferred to next pass"
                );
                self.metrics.write_failed();
                return Ok(false);
            },
        }

        match self.gateway.find_member(&candidate.member_external_id).await {
            Ok(Some(member)) => {
                let message = expiry_message(display_name(candidate, &member));
                if let Err(err) = self.gateway.notify(&member.id, &message).await {
                    warn!(member_id = %member.id, %err, "expiry notification failed");
                }
                match self.gateway.remove_member(&member.id, EXPIRY_KICK_REASON).await {
                    Ok(()) => {
                        info!(
                            row_id = candidate.row_id,
                            member_id = %member.id,
                            "member removed, trial expired"
                        );
                        self.metrics.member_removed();
                    },
                    Err(err) => {
                        // The registry already says expired; the row is not
                        // rolled back. The next pass will not re-fetch it.
                        warn!(
                            row_id = candidate.row_id,
                            member_id = %member.id,
                            %err,
                            "member removal failed, registry already marked expired"
                        );
                    },
                }
            },
            Ok(None) => {
                info!(
                    row_id = candidate.row_id,
                    member_id = %candidate.member_external_id,
                    "member already absent, marked expired in registry"
                );
            },
            Err(err) => {
                warn!(
                    row_id = candidate.row_id,
                    member_id = %candidate.member_external_id,
                    %err,
                    "member lookup failed, registry already marked expired"
                );
            },
        }

        {
            let mut state = self.lock_state();
            // An expiry for a superseded row must not drop tracking of the
            // member's newer trial.
            let is_current = state
                .ledger
                .get(&candidate.member_external_id)
                .is_some_and(|record| record.row_id == candidate.row_id);
            if is_current {
                state.ledger.remove(&candidate.member_external_id);
            }
            // The row is terminal; release the claim so the identifier can
            // be reused if the registrant is re-approved later.
            state.dedup.unmark(candidate.row_id);
            self.metrics.set_active_trials(state.ledger.len());
        }

        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Admin overrides
    // -------------------------------------------------------------------------

    /// Force-approves a member by identifier, bypassing the registry lookup.
    ///
    /// Performs role grant + pending revoke + notify only. Nothing is
    /// written back to the registry, so the member's expiry is untracked;
    /// this is a documented operational exception for manual overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::MemberNotFound`] if the member is not in
    /// the community, or a gateway error if the grant fails.
    pub async fn force_approve(&self, member_id: &str) -> Result<Member, ReconcileError> {
        let member = self
            .gateway
            .find_member(member_id)
            .await?
            .ok_or_else(|| ReconcileError::MemberNotFound(member_id.to_string()))?;

        self.gateway
            .grant_role(&member.id, &self.config.trial_role_id)
            .await?;

        if let Err(err) = self
            .gateway
            .revoke_role(&member.id, &self.config.pending_role_id)
            .await
        {
            warn!(member_id = %member.id, %err, "pending role revoke failed, continuing");
        }

        let message = welcome_message(&member.display_name, self.config.trial_duration_minutes);
        if let Err(err) = self.gateway.notify(&member.id, &message).await {
            warn!(member_id = %member.id, %err, "welcome notification failed");
        }

        info!(
            member_id = %member.id,
            "member force-approved, expiry untracked in registry"
        );
        Ok(member)
    }
}

fn display_name<'a>(candidate: &'a Candidate, member: &'a Member) -> &'a str {
    if candidate.display_name.trim().is_empty() {
        &member.display_name
    } else {
        &candidate.display_name
    }
}

// =============================================================================
// Notification text
// =============================================================================

/// Human-readable trial duration.
#[must_use]
pub fn duration_text(minutes: u64) -> String {
    if minutes >= 1440 {
        format!("{} วัน", minutes / 1440)
    } else if minutes >= 60 {
        format!("{} ชั่วโมง", minutes / 60)
    } else {
        format!("{minutes} นาที")
    }
}

/// Welcome notification sent when a trial starts.
#[must_use]
pub fn welcome_message(display_name: &str, duration_minutes: u64) -> String {
    format!(
        "⏱️ ยินดีต้อนรับสู่ Trial Access!\n\nสวัสดีคุณ {display_name}!\n\n\
         คุณได้รับ Trial Access เรียบร้อยแล้ว\n\
         ระยะเวลาทดลองใช้งาน: {}\n\
         เมื่อหมดเวลาทดลองใช้งาน คุณจะถูกนำออกจาก Server โดยอัตโนมัติ",
        duration_text(duration_minutes)
    )
}

/// Notification sent just before an expired member is removed.
#[must_use]
pub fn expiry_message(display_name: &str) -> String {
    format!(
        "⛔ หมดเวลาทดลองใช้งาน\n\nคุณ {display_name}\n\n\
         สิทธิ์ Trial Access ของคุณหมดอายุแล้ว \
         หากต้องการใช้งานต่อ กรุณาติดต่อทีมงานเพื่อสมัครสมาชิก"
    )
}
