//! Ledger events and operator alerts.
//!
//! Services report state changes as [`LedgerEvent`]s through an [`EventSink`].
//! Alerts (exhausted materialization or replication, integrity anomalies,
//! orphaned artifacts) are the operator-visible subset; see [`LedgerEvent::is_alert`].
//!
//! `emit()` never blocks and never fails: the channel sink uses `try_send`
//! and counts what it drops.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::fingerprint::ContentAddress;
use crate::types::{ArtifactLocation, Classification, PrincipalRef, RecordId, ResolutionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Registered {
        record_id: RecordId,
        content_address: Option<ContentAddress>,
        classification: Classification,
        status: ResolutionStatus,
    },

    /// Repeat upload of the same bytes by the same principal.
    Deduplicated {
        record_id: RecordId,
        registered_by: PrincipalRef,
    },

    PublicReplicated {
        record_id: RecordId,
    },

    /// Public copy failed to write; the record stays resolved and is retried.
    ReplicationRetry {
        record_id: RecordId,
        attempts: u32,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },

    /// Replication attempts exhausted. The record remains resolved and
    /// verifiable through the restricted registry until an operator re-queues it.
    ReplicationStalled {
        record_id: RecordId,
        attempts: u32,
        error: String,
    },

    Resolved {
        record_id: RecordId,
        content_address: ContentAddress,
    },

    ResolutionRetry {
        record_id: RecordId,
        attempts: u32,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },

    /// Attempt ceiling reached; the record needs an operator.
    MaterializationFailed {
        record_id: RecordId,
        attempts: u32,
        error: String,
    },

    /// A record points at something that does not check out.
    IntegrityAlert {
        record_id: Option<RecordId>,
        content_address: Option<ContentAddress>,
        detail: String,
    },

    Reclassified {
        record_id: RecordId,
        from: Classification,
        to: Classification,
    },

    Requeued {
        record_id: RecordId,
    },

    /// Compensation could not delete an artifact; the sweeper will retry.
    ArtifactOrphaned {
        location: ArtifactLocation,
        error: String,
    },
}

impl LedgerEvent {
    pub fn event_type_str(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Deduplicated { .. } => "deduplicated",
            Self::PublicReplicated { .. } => "public_replicated",
            Self::ReplicationRetry { .. } => "replication_retry",
            Self::ReplicationStalled { .. } => "replication_stalled",
            Self::Resolved { .. } => "resolved",
            Self::ResolutionRetry { .. } => "resolution_retry",
            Self::MaterializationFailed { .. } => "materialization_failed",
            Self::IntegrityAlert { .. } => "integrity_alert",
            Self::Reclassified { .. } => "reclassified",
            Self::Requeued { .. } => "requeued",
            Self::ArtifactOrphaned { .. } => "artifact_orphaned",
        }
    }

    /// Operator-visible alert.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            Self::MaterializationFailed { .. }
                | Self::ReplicationStalled { .. }
                | Self::IntegrityAlert { .. }
                | Self::ArtifactOrphaned { .. }
        )
    }
}

/// Destination for ledger events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LedgerEvent);
}

// ---------------------------------------------------------------------------
// TracingEventSink
// ---------------------------------------------------------------------------

/// Logs events: alerts at `error!`, everything else at `debug!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LedgerEvent) {
        let event_type = event.event_type_str();
        let detail = serde_json::to_string(&event).unwrap_or_default();
        if event.is_alert() {
            tracing::error!(event_type, detail = %detail, "ledger alert");
        } else {
            tracing::debug!(event_type, detail = %detail, "ledger event");
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelEventSink
// ---------------------------------------------------------------------------

/// Forwards events over a bounded channel. Full or closed channel drops the
/// event and bumps the drop counter.
pub struct ChannelEventSink {
    sender: mpsc::Sender<LedgerEvent>,
    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
}

impl ChannelEventSink {
    /// Create a sink and the receiver draining it.
    pub fn new(buffer_size: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let sink = Self {
            sender,
            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        };
        (sink, EventReceiver { receiver })
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            emitted: self.events_emitted.load(Ordering::Relaxed),
            dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: LedgerEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.events_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub emitted: u64,
    pub dropped: u64,
}

/// Receiving half of a [`ChannelEventSink`].
pub struct EventReceiver {
    receiver: mpsc::Receiver<LedgerEvent>,
}

impl EventReceiver {
    /// Wait for the next event. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<LedgerEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LedgerEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drain whatever is buffered right now.
    pub fn drain(&mut self) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}
