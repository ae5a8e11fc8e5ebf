use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Security-relevant kernel events worth keeping alongside ordinary logs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum AuditEventType {
    ToolRegistered,
    ToolRemoved,
    PolicyDenial,
    EventRegistered,
    EventFired,
    LogAppendFailure,
    ConfigurationChange,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub agent_id: Option<String>,
    pub resource: String,
    pub action: String,
    pub status: String,
    pub details: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        agent_id: Option<String>,
        resource: String,
        action: String,
        status: String,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            agent_id,
            resource,
            action,
            status,
            details,
        }
    }
}

/// In-memory audit trail. Events also go to the tracing pipeline; the ring
/// is bounded so a long-lived kernel cannot grow without limit.
#[derive(Clone)]
pub struct AuditLogger {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    capacity: usize,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    pub async fn log_event(&self, event: AuditEvent) {
        info!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            agent_id = ?event.agent_id,
            resource = %event.resource,
            action = %event.action,
            status = %event.status,
            "kernel audit event"
        );

        let mut events = self.events.lock().await;
        if events.len() == self.capacity {
            events.remove(0);
        }
        events.push(event);
    }

    pub async fn log_policy_denial(
        &self,
        agent_id: Option<String>,
        tool: &str,
        reason: &str,
    ) {
        let event = AuditEvent::new(
            AuditEventType::PolicyDenial,
            agent_id,
            tool.to_string(),
            "sandboxed-execute".to_string(),
            "denied".to_string(),
            Some(serde_json::json!({ "reason": reason })),
        );
        self.log_event(event).await;
    }

    pub async fn log_tool_registration(&self, tool: &str, removed: bool) {
        let event = AuditEvent::new(
            if removed {
                AuditEventType::ToolRemoved
            } else {
                AuditEventType::ToolRegistered
            },
            None,
            tool.to_string(),
            "register".to_string(),
            "ok".to_string(),
            None,
        );
        self.log_event(event).await;
    }

    /// Snapshot of the retained events, oldest first.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_is_bounded() {
        let logger = AuditLogger::with_capacity(2);
        for i in 0..3 {
            logger
                .log_event(AuditEvent::new(
                    AuditEventType::PolicyDenial,
                    None,
                    format!("tool-{i}"),
                    "sandboxed-execute".to_string(),
                    "denied".to_string(),
                    None,
                ))
                .await;
        }

        let events = logger.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].resource, "tool-1");
        assert_eq!(events[1].resource, "tool-2");
    }

    #[tokio::test]
    async fn policy_denial_helper_records_reason() {
        let logger = AuditLogger::new();
        logger
            .log_policy_denial(Some("agent-7".into()), "shell", "not in allow-list")
            .await;

        let events = logger.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::PolicyDenial);
        assert_eq!(events[0].resource, "shell");
        assert_eq!(
            events[0].details.as_ref().unwrap()["reason"],
            "not in allow-list"
        );
    }
}
