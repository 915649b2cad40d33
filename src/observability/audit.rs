//! Structured lifecycle audit events for procbox
//!
//! Every event is one JSON object on the `procbox::audit` log target, tagged
//! with the handle's correlation id so a whole execution can be followed
//! through a shared log.

use crate::config::types::{LimitKind, TerminationReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log target audit records are written to
pub const AUDIT_TARGET: &str = "procbox::audit";

/// Lifecycle events we track
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ProcessCreated {
        executable: String,
        backend: String,
    },
    ProcessStarted {
        backend: String,
        pid: Option<u32>,
    },
    LaunchFailed {
        message: String,
    },
    LimitApplied {
        kind: LimitKind,
        value: u64,
        live: bool,
    },
    LimitRejected {
        kind: LimitKind,
    },
    InputDiscarded {
        items: usize,
    },
    ForcedExit {
        started: bool,
    },
    Terminated {
        reason: TerminationReason,
    },
    Closed,
}

impl LifecycleEvent {
    fn level(&self) -> log::Level {
        match self {
            LifecycleEvent::LaunchFailed { .. } => log::Level::Warn,
            LifecycleEvent::ForcedExit { .. }
            | LifecycleEvent::ProcessStarted { .. }
            | LifecycleEvent::Terminated { .. } => log::Level::Info,
            _ => log::Level::Debug,
        }
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub handle_id: String,
    pub host_pid: u32,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

impl AuditRecord {
    pub fn new(handle_id: &str, event: LifecycleEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            handle_id: handle_id.to_string(),
            host_pid: std::process::id(),
            event,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"handle_id":"{}","error":"unserializable audit event: {}"}}"#,
                self.handle_id, e
            )
        })
    }
}

/// Emit an audit event for `handle_id`
pub fn emit(handle_id: &str, event: LifecycleEvent) {
    let level = event.level();
    if !log::log_enabled!(target: AUDIT_TARGET, level) {
        return;
    }
    let record = AuditRecord::new(handle_id, event);
    log::log!(target: AUDIT_TARGET, level, "{}", record.to_json());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization_is_flat() {
        let record = AuditRecord::new(
            "h-1",
            LifecycleEvent::Terminated {
                reason: TerminationReason::Exited { code: 0 },
            },
        );
        let value: serde_json::Value = serde_json::from_str(&record.to_json()).unwrap();
        assert_eq!(value["event"], "terminated");
        assert_eq!(value["handle_id"], "h-1");
        assert_eq!(value["reason"]["exited"]["code"], 0);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_limit_event_names_kind() {
        let record = AuditRecord::new(
            "h-2",
            LifecycleEvent::LimitApplied {
                kind: LimitKind::TimeLimit,
                value: 100_000,
                live: false,
            },
        );
        let json = record.to_json();
        assert!(json.contains(r#""kind":"time_limit""#));
        assert!(json.contains(r#""event":"limit_applied""#));
    }

    #[test]
    fn test_emit_without_logger_is_noop() {
        emit("h-3", LifecycleEvent::Closed);
    }
}
