//! Prometheus metrics for daemon observability.
//!
//! Exported in text format at `GET /metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `trialgate_reconcile_passes_total` | Counter | `kind` |
//! | `trialgate_trials_granted_total` | Counter | |
//! | `trialgate_members_removed_total` | Counter | |
//! | `trialgate_registry_fetch_failures_total` | Counter | `kind` |
//! | `trialgate_registry_write_failures_total` | Counter | |
//! | `trialgate_active_trials` | Gauge | |

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Reconciliation metrics backed by a Prometheus registry.
///
/// `Clone`, `Send`, and `Sync`; all counters use interior mutability.
#[derive(Clone)]
pub struct DaemonMetrics {
    /// Reconciliation passes completed, labeled by pass kind
    /// (`approval`/`expiry`).
    passes_total: IntCounterVec,

    /// Trials granted (Approved -> Active transitions completed).
    trials_granted_total: IntCounter,

    /// Members removed on expiry.
    members_removed_total: IntCounter,

    /// Registry fetch failures, labeled by pass kind.
    fetch_failures_total: IntCounterVec,

    /// Registry status writes that failed after a side effect applied.
    write_failures_total: IntCounter,

    /// Currently tracked active trials.
    active_trials: IntGauge,
}

impl DaemonMetrics {
    /// Creates the metrics and registers them with the given registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let passes_total = IntCounterVec::new(
            Opts::new(
                "trialgate_reconcile_passes_total",
                "Reconciliation passes completed, by kind",
            ),
            &["kind"],
        )?;
        let trials_granted_total = IntCounter::new(
            "trialgate_trials_granted_total",
            "Trials granted (approved candidates promoted to active)",
        )?;
        let members_removed_total = IntCounter::new(
            "trialgate_members_removed_total",
            "Members removed after trial expiry",
        )?;
        let fetch_failures_total = IntCounterVec::new(
            Opts::new(
                "trialgate_registry_fetch_failures_total",
                "Registry fetches that failed, by pass kind",
            ),
            &["kind"],
        )?;
        let write_failures_total = IntCounter::new(
            "trialgate_registry_write_failures_total",
            "Registry status writes that failed",
        )?;
        let active_trials = IntGauge::new(
            "trialgate_active_trials",
            "Currently tracked active trials",
        )?;

        registry.register(Box::new(passes_total.clone()))?;
        registry.register(Box::new(trials_granted_total.clone()))?;
        registry.register(Box::new(members_removed_total.clone()))?;
        registry.register(Box::new(fetch_failures_total.clone()))?;
        registry.register(Box::new(write_failures_total.clone()))?;
        registry.register(Box::new(active_trials.clone()))?;

        Ok(Self {
            passes_total,
            trials_granted_total,
            members_removed_total,
            fetch_failures_total,
            write_failures_total,
            active_trials,
        })
    }

    /// Records a completed reconciliation pass.
    pub fn pass_completed(&self, kind: &str) {
        self.passes_total.with_label_values(&[kind]).inc();
    }

    /// Records a granted trial.
    pub fn trial_granted(&self) {
        self.trials_granted_total.inc();
    }

    /// Records a member removal.
    pub fn member_removed(&self) {
        self.members_removed_total.inc();
    }

    /// Records a failed registry fetch.
    pub fn fetch_failed(&self, kind: &str) {
        self.fetch_failures_total.with_label_values(&[kind]).inc();
    }

    /// Records a failed registry status write.
    pub fn write_failed(&self) {
        self.write_failures_total.inc();
    }

    /// Updates the active-trials gauge.
    #[allow(clippy::cast_possible_wrap)] // ledger size is far below i64::MAX
    pub fn set_active_trials(&self, count: usize) {
        self.active_trials.set(count as i64);
    }
}

/// Metrics registry plus the daemon metrics registered against it.
pub struct MetricsRegistry {
    registry: Registry,
    daemon: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a fresh registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let daemon = DaemonMetrics::new(&registry)?;
        Ok(Self { registry, daemon })
    }

    /// The daemon metrics handle.
    #[must_use]
    pub fn daemon_metrics(&self) -> DaemonMetrics {
        self.daemon.clone()
    }

    /// Encodes all registered metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Shared handle for the metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> Result<SharedMetricsRegistry, MetricsError> {
    Ok(Arc::new(MetricsRegistry::new()?))
}
