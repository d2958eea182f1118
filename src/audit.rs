// Security event emission

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::key::KeyType;
use crate::models::session::InvalidationReason;

/// A structured security event. Never carries key material, tokens or plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    KeyGenerated {
        key_id: Uuid,
        owner_id: Uuid,
        key_type: KeyType,
    },
    KeyDeactivated {
        key_id: Uuid,
    },
    SessionCreated {
        session_id: Uuid,
        user_id: Uuid,
        ip: String,
    },
    SessionRotated {
        session_id: Uuid,
        user_id: Uuid,
    },
    SessionInvalidated {
        session_id: Uuid,
        user_id: Uuid,
        reason: InvalidationReason,
    },
    RefreshTokenReuse {
        session_id: Uuid,
        user_id: Uuid,
    },
    RateLimitDenied {
        identifier: String,
        limit: u32,
        current: u64,
    },
    RequestRejected {
        ip: String,
        reason: String,
    },
}

/// Receives audit events. Implementations must not block the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes each event as a structured `tracing` record on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let payload = sonic_rs::to_string(&event).unwrap_or_default();
        match event {
            AuditEvent::RateLimitDenied { .. }
            | AuditEvent::RequestRejected { .. }
            | AuditEvent::RefreshTokenReuse { .. } => {
                warn!(target: "audit", event = %payload, "Security event");
            }
            _ => {
                info!(target: "audit", event = %payload, "Security event");
            }
        }
    }
}

/// Forwards events to a channel drained by an external collaborator.
///
/// A full or closed channel drops the event; auditing never back-pressures a request.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Creates a sink and the receiving end for the collaborator.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "Dropping audit event");
        }
    }
}

/// Cloneable handle to the configured sink.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, event: AuditEvent) {
        self.sink.record(event);
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_events() {
        let (sink, mut rx) = ChannelAuditSink::new(8);
        let log = AuditLog::new(Arc::new(sink));
        let key_id = Uuid::new_v4();

        log.record(AuditEvent::KeyDeactivated { key_id });

        assert_eq!(rx.recv().await, Some(AuditEvent::KeyDeactivated { key_id }));
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, _rx) = ChannelAuditSink::new(1);
        let key_id = Uuid::new_v4();
        sink.record(AuditEvent::KeyDeactivated { key_id });
        sink.record(AuditEvent::KeyDeactivated { key_id });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = sonic_rs::to_string(&AuditEvent::RateLimitDenied {
            identifier: "203.0.113.5".into(),
            limit: 5,
            current: 6,
        })
        .unwrap();
        assert!(json.contains("\"event\":\"rate_limit_denied\""));
    }
}
