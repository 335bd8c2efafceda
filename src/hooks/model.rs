//! Webhook failure state and its transitions.
//!
//! A hook moves between three observable states:
//!
//! ```text
//!   Enabled ──backoff()──▶ BackingOff ──(deadline passes)──▶ Enabled
//!      │                        │
//!      └──failed() x4──▶ Disabled ◀──failed() x4──┘
//!
//!   enable() returns any state to Enabled.
//! ```
//!
//! The transitions are pure; persistence and locking live in
//! [`super::failure_state`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// More than this many recorded failures disables a hook permanently.
pub const FAILURE_THRESHOLD: u32 = 3;
/// Upper bound for both `recent_failures` and `backoff_count`.
pub const MAX_FAILURES: u32 = 100;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(10 * 60);
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);
pub const BACKOFF_GROWTH_FACTOR: f64 = 2.0;

/// How a delivery attempt went, from the hook's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCategory {
    /// 2xx or 3xx: the receiver is healthy.
    Ok,
    /// 5xx or a transport failure: likely transient, back off.
    Error,
    /// Any other status: the receiver rejected us, count a failure.
    Failed,
}

impl ResponseCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=399 => Self::Ok,
            500..=599 => Self::Error,
            _ => Self::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ResponseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid response category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HookStatus {
    Enabled,
    BackingOff { until: DateTime<Utc> },
    Disabled,
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("enabled"),
            Self::BackingOff { until } => write!(f, "backing off until {}", until.to_rfc3339()),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebHook {
    pub id: i64,
    pub project_id: i64,
    pub url: String,
    pub recent_failures: u32,
    pub backoff_count: u32,
    pub disabled_until: Option<DateTime<Utc>>,
}

impl WebHook {
    pub fn status(&self, now: DateTime<Utc>) -> HookStatus {
        if self.permanently_disabled() {
            return HookStatus::Disabled;
        }
        match self.disabled_until {
            Some(until) if until > now => HookStatus::BackingOff { until },
            _ => HookStatus::Enabled,
        }
    }

    pub fn executable(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == HookStatus::Enabled
    }

    pub fn permanently_disabled(&self) -> bool {
        self.recent_failures > FAILURE_THRESHOLD
    }

    /// Clear all failure state. Returns false when there was nothing to clear.
    pub fn enable(&mut self) -> bool {
        if self.recent_failures == 0 && self.backoff_count == 0 && self.disabled_until.is_none() {
            return false;
        }
        self.recent_failures = 0;
        self.backoff_count = 0;
        self.disabled_until = None;
        true
    }

    /// Disable the hook until `now + next_backoff()`.
    pub fn backoff(&mut self, now: DateTime<Utc>) {
        let delay = chrono::Duration::from_std(self.next_backoff()).unwrap_or(chrono::Duration::MAX);
        self.disabled_until = Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.backoff_count = (self.backoff_count + 1).min(MAX_FAILURES);
    }

    /// Count one rejected delivery. Returns false once the counter is capped.
    pub fn failed(&mut self) -> bool {
        if self.recent_failures >= MAX_FAILURES {
            return false;
        }
        self.recent_failures += 1;
        self.disabled_until = None;
        true
    }

    /// `INITIAL_BACKOFF * 2^backoff_count`, clamped to `[INITIAL_BACKOFF, MAX_BACKOFF]`.
    pub fn next_backoff(&self) -> Duration {
        let factor = BACKOFF_GROWTH_FACTOR.powi(self.backoff_count.min(64) as i32);
        let secs = INITIAL_BACKOFF.as_secs_f64() * factor;
        let clamped = secs.clamp(INITIAL_BACKOFF.as_secs_f64(), MAX_BACKOFF.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    /// Apply the transition selected by a delivery outcome.
    pub fn apply(&mut self, category: ResponseCategory, now: DateTime<Utc>) {
        match category {
            ResponseCategory::Ok => {
                self.enable();
            }
            ResponseCategory::Error => self.backoff(now),
            ResponseCategory::Failed => {
                self.failed();
            }
        }
    }
}
