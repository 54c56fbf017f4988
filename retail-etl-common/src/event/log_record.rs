use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::EventSeverity;

// It is used by strum to convert the enum to a string
// but the compiler complains that it is unused
#[allow(unused_imports)]
use std::str::FromStr;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogRecord {
    pub run_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub message: Option<String>,
}

impl EventLogRecord {
    pub fn new(
        event_type: EventType,
        run_id: Option<Uuid>,
        task_id: Option<Uuid>,
        message: Option<String>,
    ) -> Self {
        Self {
            run_id,
            task_id,
            timestamp: Utc::now(),
            event_type,
            message,
        }
    }

    /// Writes the record to the tracing subscriber at the severity of its
    /// event type.
    pub fn emit(&self) {
        let run_id = self.run_id.map(|id| id.to_string()).unwrap_or_default();
        let task_id = self.task_id.map(|id| id.to_string()).unwrap_or_default();
        let message = self.message.as_deref().unwrap_or("");

        match self.event_type.severity() {
            EventSeverity::Debug => {
                debug!(event = %self.event_type, %run_id, %task_id, "{message}")
            }
            EventSeverity::Info => {
                info!(event = %self.event_type, %run_id, %task_id, "{message}")
            }
            EventSeverity::Warn => {
                warn!(event = %self.event_type, %run_id, %task_id, "{message}")
            }
            EventSeverity::Error => {
                error!(event = %self.event_type, %run_id, %task_id, "{message}")
            }
        }
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum EventType {
    // Run lifecycle
    RunScheduled,
    RunStart,
    RunSuccess,
    RunFailure,
    RunSkipped,

    // Task lifecycle
    TaskStart,
    TaskSuccess,
    TaskFailure,
    TaskUpstreamFailed,
    TaskCancelled,

    // Engine/system events
    EngineEvent,
}

impl EventType {
    pub fn severity(&self) -> EventSeverity {
        match self {
            EventType::EngineEvent => EventSeverity::Debug,
            EventType::RunSkipped | EventType::TaskUpstreamFailed | EventType::TaskCancelled => {
                EventSeverity::Warn
            }
            EventType::RunFailure | EventType::TaskFailure => EventSeverity::Error,
            _ => EventSeverity::Info,
        }
    }
}
