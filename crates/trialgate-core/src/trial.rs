//! Trial ledger and dedup guard.
//!
//! Both structures are in-memory, derived views: the registry row remains
//! the durable record for every trial, and nothing here is expected to
//! survive a restart. They are owned by the reconciliation loop and passed
//! into helper operations explicitly, never held as ambient globals.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Window before expiry in which an active trial is flagged
/// [`TrialStatus::ExpiringSoon`].
pub const EXPIRING_SOON_WINDOW_MINUTES: i64 = 60;

/// Lifecycle state of a tracked trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Role granted; registry write-back not yet confirmed.
    Granted,
    /// Trial running.
    Active,
    /// Trial running, inside the expiry window.
    ExpiringSoon,
    /// Expiry confirmed by the registry; removal in progress.
    Expired,
    /// Superseded by a newer trial for the same member.
    Revoked,
}

/// A time-boxed access grant tied to one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialRecord {
    /// Platform member identifier.
    pub member_id: String,
    /// Registry row backing this trial.
    pub row_id: u64,
    /// When the trial role was granted.
    pub started_at: DateTime<Utc>,
    /// Always `started_at + trial duration`; the duration is fixed per
    /// deployment, never per member.
    pub expires_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: TrialStatus,
}

impl TrialRecord {
    /// Creates a record for a trial starting at `started_at`.
    #[must_use]
    pub fn new(
        member_id: impl Into<String>,
        row_id: u64,
        started_at: DateTime<Utc>,
        duration_minutes: u64,
    ) -> Self {
        // Out-of-range durations saturate at the end of the representable
        // range instead of panicking; the config layer bounds configured
        // values far below this.
        let expires_at = i64::try_from(duration_minutes)
            .ok()
            .and_then(Duration::try_minutes)
            .and_then(|duration| started_at.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            member_id: member_id.into(),
            row_id,
            started_at,
            expires_at,
            status: TrialStatus::Active,
        }
    }
}

/// In-memory table of active trials keyed by member identity.
///
/// Invariant: at most one record per member; inserting for an already
/// tracked member supersedes the prior trial.
#[derive(Debug, Default)]
pub struct TrialLedger {
    trials: HashMap<String, TrialRecord>,
}

impl TrialLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a trial, superseding any prior trial for the same member.
    ///
    /// Returns the superseded record, marked [`TrialStatus::Revoked`].
    pub fn begin(&mut self, record: TrialRecord) -> Option<TrialRecord> {
        let prior = self.trials.insert(record.member_id.clone(), record);
        prior.map(|mut superseded| {
            superseded.status = TrialStatus::Revoked;
            superseded
        })
    }

    /// Looks up the trial for a member.
    #[must_use]
    pub fn get(&self, member_id: &str) -> Option<&TrialRecord> {
        self.trials.get(member_id)
    }

    /// Removes a member's trial once its expiry is confirmed processed.
    pub fn remove(&mut self, member_id: &str) -> Option<TrialRecord> {
        self.trials.remove(member_id)
    }

    /// Number of tracked trials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Re-derives per-trial statuses from the clock.
    ///
    /// Purely cosmetic for observability; the registry's expiry view is the
    /// correctness-bearing mechanism.
    pub fn refresh_statuses(&mut self, now: DateTime<Utc>) {
        let soon = Duration::minutes(EXPIRING_SOON_WINDOW_MINUTES);
        for record in self.trials.values_mut() {
            record.status = if now >= record.expires_at {
                TrialStatus::Expired
            } else if now + soon >= record.expires_at {
                TrialStatus::ExpiringSoon
            } else {
                TrialStatus::Active
            };
        }
    }

    /// Iterates over tracked trials.
    pub fn iter(&self) -> impl Iterator<Item = &TrialRecord> {
        self.trials.values()
    }
}

/// Run-scoped set preventing a registry row from being processed twice
/// across overlapping poll cycles.
///
/// Ordering contract: a row is marked BEFORE any side effect, and unmarked
/// whenever processing stops short of a confirmed registry write, so a
/// later cycle retries it. A successfully processed row stays marked, which
/// short-circuits re-fetched rows until the registry status propagates.
#[derive(Debug, Default)]
pub struct DedupGuard {
    rows: HashSet<u64>,
}

impl DedupGuard {
    /// Creates an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a row as in-flight/processed.
    ///
    /// Returns `false` if the row was already marked (caller must skip it).
    pub fn mark(&mut self, row_id: u64) -> bool {
        self.rows.insert(row_id)
    }

    /// Un-marks a row so a later cycle retries it. Idempotent.
    pub fn unmark(&mut self, row_id: u64) {
        self.rows.remove(&row_id);
    }

    /// Whether a row is currently marked.
    #[must_use]
    pub fn contains(&self, row_id: u64) -> bool {
        self.rows.contains(&row_id)
    }

    /// Number of marked rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
