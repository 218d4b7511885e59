/*!
 * Audit Trail
 *
 * Every vault operation and every service call emits exactly one
 * [`AuditEvent`]. Events carry identifiers, versions, outcomes and error
 * kinds. They never carry key material, wrapped or raw.
 */

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, TksError, TksResult};
use crate::model::KeyIdentifier;

/// Audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    GetSharedSecret,
    ShowKey,
    Unwrap,
    Wrap,
    Derive,
    TransportWrap,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditOperation::GetSharedSecret => "get_shared_secret",
            AuditOperation::ShowKey => "show_key",
            AuditOperation::Unwrap => "unwrap",
            AuditOperation::Wrap => "wrap",
            AuditOperation::Derive => "derive",
            AuditOperation::TransportWrap => "transport_wrap",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub key_id: Option<KeyIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    pub connector_id: Option<String>,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl AuditEvent {
    pub fn new(operation: AuditOperation) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            operation,
            key_id: None,
            key_version: None,
            connector_id: None,
            outcome: AuditOutcome::Success,
            error_kind: None,
        }
    }

    pub fn key(mut self, key_id: &KeyIdentifier, version: Option<u32>) -> Self {
        self.key_id = Some(key_id.clone());
        self.key_version = version;
        self
    }

    pub fn connector(mut self, connector_id: Option<&str>) -> Self {
        self.connector_id = connector_id.map(str::to_string);
        self
    }

    /// Record the outcome of `result`
    pub fn outcome<T>(mut self, result: &TksResult<T>) -> Self {
        match result {
            Ok(_) => {
                self.outcome = AuditOutcome::Success;
                self.error_kind = None;
            }
            Err(e) => self = self.failed(e),
        }
        self
    }

    pub fn failed(mut self, error: &TksError) -> Self {
        self.outcome = AuditOutcome::Failure;
        self.error_kind = Some(error.kind());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AuditOutcome::Success
    }
}

/// Destination for audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Keeps events in memory, for tests and inspection
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_for(&self, operation: AuditOperation) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.operation == operation)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        match self.events.lock() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Writes each event as one JSON line to the `tks::audit` log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => match event.outcome {
                AuditOutcome::Success => log::info!(target: "tks::audit", "{}", line),
                AuditOutcome::Failure => log::warn!(target: "tks::audit", "{}", line),
            },
            Err(e) => log::error!(
                target: "tks::audit",
                "Failed to serialize audit event {}: {}",
                event.event_id,
                e
            ),
        }
    }
}
