//! Condition tracking shared by every reconciler.
//!
//! Reconcilers re-derive their intended conditions from scratch on each pass.
//! `set_condition` only moves `last_transition_time` when the status value
//! itself changes, so repeated passes leave status byte-identical.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SUCCEEDED: &str = "Succeeded";
pub const STAGING: &str = "Staging";
pub const READY: &str = "Ready";

/// Reason recorded on conditions initialised before anything is known.
pub const REASON_NOT_READY: &str = "NotReady";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Lenient parse used for statuses reported by external systems.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "true" => ConditionStatus::True,
            "false" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }

    pub fn from_bool(b: bool) -> Self { if b { ConditionStatus::True } else { ConditionStatus::False } }

    pub fn is_known(&self) -> bool { !matches!(self, ConditionStatus::Unknown) }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Status of `type_`, `Unknown` when absent.
pub fn get_status(conditions: &[Condition], type_: &str) -> ConditionStatus {
    find_condition(conditions, type_).map(|c| c.status).unwrap_or_default()
}

pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    set_condition_at(conditions, type_, status, reason, message, Utc::now())
}

/// Same as [`set_condition`] with an explicit clock. Returns whether anything changed.
pub fn set_condition_at(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status {
            if existing.reason == reason && existing.message == message {
                return false;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            return true;
        }
        *existing = Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        };
        return true;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now,
    });
    true
}

/// Return the status of `type_`, recording it as `Unknown` first if absent.
pub fn ensure_condition(conditions: &mut Vec<Condition>, type_: &str) -> ConditionStatus {
    match find_condition(conditions, type_) {
        Some(c) => c.status,
        None => {
            set_condition(conditions, type_, ConditionStatus::Unknown, REASON_NOT_READY, "");
            ConditionStatus::Unknown
        }
    }
}
