use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle and activity codes emitted by entity tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Launching,
    Active,
    Error,
    Failed,
    Stopped,
    ActionSent,
    ActionReceived,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Launching => "launching",
            StatusCode::Active => "active",
            StatusCode::Error => "error",
            StatusCode::Failed => "failed",
            StatusCode::Stopped => "stopped",
            StatusCode::ActionSent => "action_sent",
            StatusCode::ActionReceived => "action_received",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    pub entity_num: u64,
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSample {
    pub entity_num: u64,
    pub route: String,
    pub duration_ms: f64,
    /// HTTP-equivalent result code; 0 when no response was received
    pub status: u16,
}

impl TimingSample {
    pub fn new(entity_num: u64, route: impl Into<String>, duration: Duration, status: u16) -> Self {
        Self {
            entity_num,
            route: route.into(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            status,
        }
    }
}

/// Message carried from entity tasks to the status reporter.
#[derive(Debug, Clone)]
pub enum Report {
    Status(UserStatus),
    Timing(TimingSample),
}

impl Report {
    pub fn status(entity_num: u64, code: StatusCode, details: impl Into<String>) -> Self {
        Report::Status(UserStatus {
            entity_num,
            code,
            error: None,
            details: details.into(),
        })
    }

    pub fn error(entity_num: u64, code: StatusCode, error: impl fmt::Display) -> Self {
        Report::Status(UserStatus {
            entity_num,
            code,
            error: Some(error.to_string()),
            details: String::new(),
        })
    }
}
