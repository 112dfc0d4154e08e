//! Environment-driven startup configuration.
//!
//! All deployment knobs arrive through the environment. Required values that
//! are missing or unparseable produce a [`ConfigError`] and the daemon
//! refuses to start; there are no silent fallbacks for credentials or
//! identifiers.

use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

/// Default trial duration in minutes (7 days).
pub const DEFAULT_TRIAL_DURATION_MINUTES: u64 = 10_080;

/// Upper bound on the configurable trial duration (10 years). Keeps expiry
/// arithmetic inside chrono's representable range.
pub const MAX_TRIAL_DURATION_MINUTES: u64 = 10 * 365 * 24 * 60;

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 10_000;

/// Default reconciliation poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Errors raised while assembling the startup configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is absent or empty.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable is present but unparseable.
    #[error("invalid value for {var}: {reason}")]
    Invalid {
        /// The offending variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Startup configuration for the trialgate daemon.
///
/// Secrets are held as [`SecretString`] so they never appear in `Debug`
/// output or logs; they are exposed only at the call site that builds the
/// outbound request.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Chat platform bot credential.
    pub bot_token: SecretString,

    /// Community (guild) identifier the daemon operates on.
    pub guild_id: String,

    /// Role held by members awaiting approval.
    pub pending_role_id: String,

    /// Role granted for the duration of a trial.
    pub trial_role_id: String,

    /// Base URL of the approval-registry backend.
    pub registry_url: String,

    /// Shared secret carried on every registry call.
    pub registry_secret: SecretString,

    /// Trial duration in minutes. Fixed per deployment, not per member.
    pub trial_duration_minutes: u64,

    /// HTTP listen port for the health/admin surface.
    pub port: u16,

    /// Interval between reconciliation passes.
    pub poll_interval: Duration,
}

impl BotConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// fails to parse. The daemon must treat this as fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration through an injected lookup function.
    ///
    /// This is the testable core of [`Self::from_env`]: tests supply a map
    /// lookup instead of mutating the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on missing required variables or unparseable
    /// values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| -> Result<String, ConfigError> {
            match lookup(var) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(ConfigError::Missing(var)),
            }
        };

        let bot_token = SecretString::from(required("DISCORD_BOT_TOKEN")?);
        let guild_id = required("DISCORD_GUILD_ID")?;
        let pending_role_id = required("DISCORD_PENDING_ROLE_ID")?;
        let trial_role_id = required("DISCORD_TRIAL_ROLE_ID")?;
        let registry_url = required("REGISTRY_URL")?;
        let registry_secret = SecretString::from(required("REGISTRY_BOT_SECRET")?);

        let trial_duration_minutes = parse_or_default(
            lookup("TRIAL_DURATION_MINUTES"),
            "TRIAL_DURATION_MINUTES",
            DEFAULT_TRIAL_DURATION_MINUTES,
        )?;
        if trial_duration_minutes == 0 {
            return Err(ConfigError::Invalid {
                var: "TRIAL_DURATION_MINUTES",
                reason: "must be greater than zero".to_string(),
            });
        }
        if trial_duration_minutes > MAX_TRIAL_DURATION_MINUTES {
            return Err(ConfigError::Invalid {
                var: "TRIAL_DURATION_MINUTES",
                reason: format!("must be at most {MAX_TRIAL_DURATION_MINUTES}"),
            });
        }

        let port: u16 = parse_or_default(lookup("PORT"), "PORT", DEFAULT_PORT)?;

        let poll_interval_secs: u64 = parse_or_default(
            lookup("POLL_INTERVAL_SECS"),
            "POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
        )?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            bot_token,
            guild_id,
            pending_role_id,
            trial_role_id,
            registry_url,
            registry_secret,
            trial_duration_minutes,
            port,
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }
}

fn parse_or_default<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("{e}"),
            })
        },
        _ => Ok(default),
    }
}
