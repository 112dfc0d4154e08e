//! trialgate-daemon - Membership Gating Daemon Library
//!
//! Long-running daemon that polls the approval registry, grants and revokes
//! time-boxed trial roles in the community, and serves a small HTTP surface
//! for health, admin triggers, and registration forwarding.
//!
//! # Modules
//!
//! - [`reconciler`]: The poll-and-apply reconciliation loop (the core)
//! - [`http`]: axum surface: health, trigger, force-approve, register,
//!   status, metrics
//! - [`metrics`]: Prometheus metrics for daemon observability

pub mod http;
pub mod metrics;
pub mod reconciler;
