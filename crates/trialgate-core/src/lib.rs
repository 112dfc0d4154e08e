//! trialgate-core - Trial Membership Reconciliation Library
//!
//! This library provides the building blocks for the trialgate daemon: a
//! membership-gating service that reconciles an external spreadsheet-backed
//! approval registry against live chat-community membership.
//!
//! # Architecture
//!
//! The external registry is the source of truth. Everything held in memory
//! (the trial ledger, the dedup guard) is a derived view that may be lost on
//! restart; correctness never depends on it surviving. Expiry is enforced by
//! polling the registry's own expiry view, not by in-process timers, because
//! timers die silently with the process.
//!
//! # Modules
//!
//! - [`config`]: Environment-driven startup configuration
//! - [`registry`]: Typed client for the approval-registry wire contract
//! - [`gateway`]: Membership gateway over the chat platform's REST primitives
//! - [`trial`]: Trial ledger, dedup guard, and the per-member trial state

pub mod config;
pub mod gateway;
mod net;
pub mod registry;
pub mod trial;
