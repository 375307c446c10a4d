//! Per-user usage quotas over a rolling window.
//!
//! Two ledgers share one window state machine: messages/tokens and files.
//! Checks never increment counters; the send and upload paths do that with
//! single upsert statements. Every check runs in one transaction so the
//! read-modify-write of a transition cannot interleave with another check.

use std::fmt;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use tracing::{debug, info};

use palaver_shared::constants::{OVER_LIMIT_PERIOD_HOURS, QUOTA_WINDOW_HOURS};
use palaver_shared::entitlements::entitlements_for;
use palaver_shared::{Role, UserId};
use palaver_store::{truncate_micros, Database};

use crate::error::ServerError;

/// Which threshold put the user over the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitReason {
    Tokens,
    Messages,
    Files,
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tokens => "tokens",
            Self::Messages => "messages",
            Self::Files => "files",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub is_over_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LimitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
    pub messages_counter: i64,
    pub tokens_counter: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesRateLimitResult {
    pub is_over_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<LimitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
    pub files_counter: i64,
}

// ---------------------------------------------------------------------------
// Window state machine
// ---------------------------------------------------------------------------

/// The persisted window fields shared by both ledgers.
#[derive(Debug, Clone, Copy)]
struct Window {
    is_over_limit: bool,
    period_end: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// One counter against its limit. Slices of these are in priority order.
#[derive(Debug, Clone, Copy)]
struct Usage {
    reason: LimitReason,
    counter: i64,
    max: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Window went stale or the over-limit period expired. Zero the record.
    Reset,
    /// Still inside an over-limit period.
    Blocked(LimitReason),
    /// A threshold is crossed for the first time. Open an over-limit period.
    Exceeded {
        reason: LimitReason,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    Under,
}

fn first_exceeded(usage: &[Usage]) -> Option<LimitReason> {
    usage.iter().find(|u| u.counter >= u.max).map(|u| u.reason)
}

fn evaluate(window: Window, usage: &[Usage], now: DateTime<Utc>) -> Result<Decision, ServerError> {
    if now - window.updated_at > Duration::hours(QUOTA_WINDOW_HOURS) {
        return Ok(Decision::Reset);
    }

    if window.is_over_limit {
        // A flag without a period end can never expire on its own.
        return match window.period_end {
            Some(end) if now < end => first_exceeded(usage).map(Decision::Blocked).ok_or_else(|| {
                ServerError::InvariantViolation(
                    "quota is over limit but no threshold is exceeded".to_string(),
                )
            }),
            _ => Ok(Decision::Reset),
        };
    }

    match first_exceeded(usage) {
        Some(reason) => {
            let period_start = now.duration_trunc(Duration::minutes(1)).unwrap_or(now);
            Ok(Decision::Exceeded {
                reason,
                period_start,
                period_end: period_start + Duration::hours(OVER_LIMIT_PERIOD_HOURS),
            })
        }
        None => Ok(Decision::Under),
    }
}

/// Explicit role, or the one stored on the user row.
pub(crate) fn resolve_role(
    db: &Database,
    user_id: UserId,
    role: Option<Role>,
) -> Result<Role, ServerError> {
    match role {
        Some(role) => Ok(role),
        None => db.get_user(user_id).map(|u| u.role).map_err(|e| {
            if e.is_not_found() {
                ServerError::NotFound("User not found".to_string())
            } else {
                ServerError::store("resolve user role")(e)
            }
        }),
    }
}

// ---------------------------------------------------------------------------
// Messages / tokens
// ---------------------------------------------------------------------------

pub fn check_rate_limit(
    db: &Database,
    user_id: UserId,
    role: Option<Role>,
) -> Result<RateLimitResult, ServerError> {
    check_rate_limit_at(db, user_id, role, Utc::now())
}

pub fn check_rate_limit_at(
    db: &Database,
    user_id: UserId,
    role: Option<Role>,
    now: DateTime<Utc>,
) -> Result<RateLimitResult, ServerError> {
    let now = truncate_micros(now);

    db.atomically(|db| {
        let limits = entitlements_for(resolve_role(db, user_id, role)?);
        let record = db
            .ensure_messages_quota(user_id, now)
            .map_err(ServerError::store("load messages quota"))?;

        let window = Window {
            is_over_limit: record.is_over_limit,
            period_end: record.period_end,
            updated_at: record.updated_at,
        };
        let usage = [
            Usage {
                reason: LimitReason::Tokens,
                counter: record.tokens_counter,
                max: limits.max_tokens,
            },
            Usage {
                reason: LimitReason::Messages,
                counter: record.messages_counter,
                max: limits.max_messages,
            },
        ];

        let mut result = RateLimitResult {
            is_over_limit: false,
            reason: None,
            period_start: None,
            period_end: None,
            messages_counter: record.messages_counter,
            tokens_counter: record.tokens_counter,
        };

        match evaluate(window, &usage, now)? {
            Decision::Reset => {
                db.reset_messages_quota(user_id, now)
                    .map_err(ServerError::store("reset messages quota"))?;
                debug!(user = %user_id, "Messages quota window reset");
            }
            Decision::Blocked(reason) => {
                result.is_over_limit = true;
                result.reason = Some(reason);
                result.period_start = record.period_start;
                result.period_end = record.period_end;
            }
            Decision::Exceeded {
                reason,
                period_start,
                period_end,
            } => {
                db.mark_messages_over_limit(user_id, period_start, period_end)
                    .map_err(ServerError::store("mark messages quota over limit"))?;
                info!(user = %user_id, %reason, until = %period_end, "Messages quota exceeded");
                result.is_over_limit = true;
                result.reason = Some(reason);
                result.period_start = Some(period_start);
                result.period_end = Some(period_end);
            }
            Decision::Under => {}
        }

        Ok(result)
    })
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

pub fn check_files_rate_limit(
    db: &Database,
    user_id: UserId,
    role: Option<Role>,
) -> Result<FilesRateLimitResult, ServerError> {
    check_files_rate_limit_at(db, user_id, role, Utc::now())
}

pub fn check_files_rate_limit_at(
    db: &Database,
    user_id: UserId,
    role: Option<Role>,
    now: DateTime<Utc>,
) -> Result<FilesRateLimitResult, ServerError> {
    let now = truncate_micros(now);

    db.atomically(|db| {
        let limits = entitlements_for(resolve_role(db, user_id, role)?);
        let record = db
            .ensure_files_quota(user_id, now)
            .map_err(ServerError::store("load files quota"))?;

        let window = Window {
            is_over_limit: record.is_over_limit,
            period_end: record.period_end,
            updated_at: record.updated_at,
        };
        let usage = [Usage {
            reason: LimitReason::Files,
            counter: record.files_counter,
            max: limits.max_files,
        }];

        let mut result = FilesRateLimitResult {
            is_over_limit: false,
            reason: None,
            period_start: None,
            period_end: None,
            files_counter: record.files_counter,
        };

        match evaluate(window, &usage, now)? {
            Decision::Reset => {
                db.reset_files_quota(user_id, now)
                    .map_err(ServerError::store("reset files quota"))?;
                debug!(user = %user_id, "Files quota window reset");
            }
            Decision::Blocked(reason) => {
                result.is_over_limit = true;
                result.reason = Some(reason);
                result.period_start = record.period_start;
                result.period_end = record.period_end;
            }
            Decision::Exceeded {
                reason,
                period_start,
                period_end,
            } => {
                db.mark_files_over_limit(user_id, period_start, period_end)
                    .map_err(ServerError::store("mark files quota over limit"))?;
                info!(user = %user_id, until = %period_end, "Files quota exceeded");
                result.is_over_limit = true;
                result.reason = Some(reason);
                result.period_start = Some(period_start);
                result.period_end = Some(period_end);
            }
            Decision::Under => {}
        }

        Ok(result)
    })
}
