//! Status events emitted by the pipeline for a front end or log collaborator.
use crate::model::Classification;
use std::fmt;
use tracing::{error, info, warn};

/// How a front end should present an event (the interactive variant colours
/// them gray, green and red).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Neutral,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    CycleStarted,
    /// Listing failed or returned nothing; the cycle ends here.
    NoReceipts { url: String, reason: Option<String> },
    ReceiptPrinted { full_number: String, classification: Classification },
    ReceiptUnchanged { full_number: String },
    ReceiptFailed { full_number: String, receipt_id: String, error: String },
    ImageSkipped { full_number: String, detail: String },
    RecordsSwept { removed: usize, retention_days: u32 },
    CycleFinished { printed: usize, unchanged: usize, failed: usize },
    Halted { error: String },
    Restarted,
}

impl StatusEvent {
    pub fn severity(&self) -> Severity {
        match self {
            StatusEvent::CycleStarted
            | StatusEvent::ReceiptUnchanged { .. }
            | StatusEvent::RecordsSwept { .. }
            | StatusEvent::CycleFinished { .. } => Severity::Neutral,
            StatusEvent::ReceiptPrinted { .. } | StatusEvent::Restarted => Severity::Success,
            StatusEvent::ImageSkipped { .. } => Severity::Warning,
            StatusEvent::NoReceipts { reason, .. } => {
                if reason.is_some() {
                    Severity::Error
                } else {
                    Severity::Neutral
                }
            }
            StatusEvent::ReceiptFailed { .. } | StatusEvent::Halted { .. } => Severity::Error,
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::CycleStarted => write!(f, "cycle started"),
            StatusEvent::NoReceipts { url, reason: None } => {
                write!(f, "no receipts found (url: {})", url)
            }
            StatusEvent::NoReceipts { url, reason: Some(reason) } => {
                write!(f, "could not list receipts from {}: {}", url, reason)
            }
            StatusEvent::ReceiptPrinted { full_number, classification } => {
                write!(f, "receipt {} printed ({})", full_number, classification.as_str())
            }
            StatusEvent::ReceiptUnchanged { full_number } => {
                write!(f, "receipt {} already printed and unchanged", full_number)
            }
            StatusEvent::ReceiptFailed { full_number, receipt_id, error } => {
                write!(f, "receipt {} (id {}) failed: {}", full_number, receipt_id, error)
            }
            StatusEvent::ImageSkipped { full_number, detail } => {
                write!(f, "receipt {}: image skipped: {}", full_number, detail)
            }
            StatusEvent::RecordsSwept { removed, retention_days } => write!(
                f,
                "removed {} receipts older than {} days",
                removed, retention_days
            ),
            StatusEvent::CycleFinished { printed, unchanged, failed } => write!(
                f,
                "cycle finished: {} printed, {} unchanged, {} failed",
                printed, unchanged, failed
            ),
            StatusEvent::Halted { error } => write!(f, "process halted: {}", error),
            StatusEvent::Restarted => write!(f, "process restarted"),
        }
    }
}

/// Receiver of status events. Implementations must not block.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

/// Default sink: forwards every event to `tracing` at a matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&self, event: StatusEvent) {
        match event.severity() {
            Severity::Neutral | Severity::Success => info!(status = %event, "status"),
            Severity::Warning => warn!(status = %event, "status"),
            Severity::Error => error!(status = %event, "status"),
        }
    }
}
