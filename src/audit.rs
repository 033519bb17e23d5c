//! Structured audit events for connection attempts.
//!
//! Events carry identifiers and outcomes only; no secret material is ever
//! included. Timestamps are supplied by the sink (the tracing subscriber
//! stamps each record).

use std::fmt;

use tracing::info;

/// Transport chosen for a connection attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    /// The target's own address was dialled.
    Direct,
    /// A tunnel through a mediating host was used.
    Mediated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Mediated => f.write_str("mediated"),
        }
    }
}

/// Outcome of a connection attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuditOutcome {
    /// An endpoint was handed to the caller.
    Connected,
    /// The attempt was refused or failed.
    Refused {
        /// Short reason, safe for log aggregation.
        reason: String,
    },
}

/// A single audit record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditEvent {
    /// Target instance identifier.
    pub target_id: String,
    /// Transport the resolver chose, when resolution got that far.
    pub transport: Option<TransportKind>,
    /// Mediating host identifier for mediated transports.
    pub bastion_id: Option<String>,
    /// Outcome of the attempt.
    pub outcome: AuditOutcome,
}

/// Destination for audit records.
pub trait AuditSink {
    /// Records a single event.
    fn record(&self, event: &AuditEvent);
}

/// Sink that forwards audit records to the `mist::audit` tracing target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let transport = event
            .transport
            .map_or_else(|| String::from("unresolved"), |kind| kind.to_string());
        match &event.outcome {
            AuditOutcome::Connected => info!(
                target: "mist::audit",
                target_id = %event.target_id,
                transport = %transport,
                bastion_id = event.bastion_id.as_deref().unwrap_or(""),
                outcome = "connected",
            ),
            AuditOutcome::Refused { reason } => info!(
                target: "mist::audit",
                target_id = %event.target_id,
                transport = %transport,
                bastion_id = event.bastion_id.as_deref().unwrap_or(""),
                outcome = "refused",
                reason = %reason,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_renders_lowercase() {
        assert_eq!(TransportKind::Direct.to_string(), "direct");
        assert_eq!(TransportKind::Mediated.to_string(), "mediated");
    }
}
