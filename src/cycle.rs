//! Cycle orchestration: list, then per receipt check, fetch, interpret, print
//! and persist, then sweep.
//!
//! Failures stay inside the smallest unit that keeps the batch moving. A
//! receipt that fails is reported and skipped. A listing failure ends the
//! cycle early without stopping the daemon. Only storage failures abort a
//! cycle, and they move the [`Runner`] into [`RunnerState::Halted`].
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::CatalogClient;
use crate::dedup;
use crate::events::{StatusEvent, StatusSink};
use crate::markup::{InterpretError, Interpreter, ParseError};
use crate::model::{Classification, ReceiptSummary};
use crate::printer::{print_job, DeviceError, Printer};
use crate::store::{ReceiptStore, StoreError};
use crate::sweeper;
use crate::transport::FetchError;

/// Where a cycle currently is. Used for tracing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listing,
    Checking,
    Fetching,
    Interpreting,
    Printing,
    Persisting,
    Sweeping,
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("listing entry has no receipt number or id")]
    MissingIdentity,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed receipt: {0}")]
    Malformed(#[from] ParseError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<InterpretError> for ReceiptError {
    fn from(err: InterpretError) -> Self {
        match err {
            InterpretError::Malformed(e) => ReceiptError::Malformed(e),
            InterpretError::Store(e) => ReceiptError::Store(e),
        }
    }
}

/// Errors that abort a whole cycle. Storage is required for deduplication,
/// so losing it halts the runner.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Printed(Classification),
    Unchanged,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub listing_failed: bool,
    pub listed: usize,
    pub printed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<String>,
    pub swept: Vec<String>,
}

/// One polling iteration's worth of collaborators.
#[derive(Clone)]
pub struct Pipeline {
    catalog: CatalogClient,
    interpreter: Interpreter,
    store: ReceiptStore,
    printer: Arc<dyn Printer>,
    events: Arc<dyn StatusSink>,
    retention_days: u32,
}

impl Pipeline {
    pub fn new(
        catalog: CatalogClient,
        store: ReceiptStore,
        printer: Arc<dyn Printer>,
        events: Arc<dyn StatusSink>,
        retention_days: u32,
    ) -> Self {
        let interpreter = Interpreter::new(catalog.clone(), store.clone());
        Self {
            catalog,
            interpreter,
            store,
            printer,
            events,
            retention_days,
        }
    }

    /// Run one cycle. The liveness marker exists for the duration of the call.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        self.store.mark_running().await?;
        let result = self.cycle().await;
        let cleared = self.store.clear_running().await;
        let report = result?;
        cleared?;
        Ok(report)
    }

    #[instrument(skip_all)]
    async fn cycle(&self) -> Result<CycleReport, CycleError> {
        self.events.emit(StatusEvent::CycleStarted);
        let mut report = CycleReport::default();

        enter(Phase::Listing);
        let list_url = self
            .catalog
            .list_url()
            .map(|u| u.to_string())
            .unwrap_or_default();
        let summaries = match self.catalog.list_pending().await {
            Ok(list) => list,
            Err(err) => {
                error!(%err, url = %list_url, "persistent error listing receipts; skipping this cycle");
                self.events.emit(StatusEvent::NoReceipts {
                    url: list_url,
                    reason: Some(err.to_string()),
                });
                report.listing_failed = true;
                return Ok(report);
            }
        };
        report.listed = summaries.len();
        if summaries.is_empty() {
            info!("no receipts found");
            self.events.emit(StatusEvent::NoReceipts {
                url: list_url,
                reason: None,
            });
        }

        for summary in &summaries {
            match self.process_receipt(summary).await {
                Ok(ReceiptOutcome::Printed(classification)) => {
                    self.events.emit(StatusEvent::ReceiptPrinted {
                        full_number: summary.full_number.clone(),
                        classification,
                    });
                    report.printed.push(summary.full_number.clone());
                }
                Ok(ReceiptOutcome::Unchanged) => {
                    self.events.emit(StatusEvent::ReceiptUnchanged {
                        full_number: summary.full_number.clone(),
                    });
                    report.unchanged.push(summary.full_number.clone());
                }
                Err(ReceiptError::Store(err @ StoreError::Io { .. })) => {
                    error!(%err, full_number = %summary.full_number, "storage failure; aborting cycle");
                    return Err(CycleError::Persistence(err));
                }
                Err(err) => {
                    error!(
                        %err,
                        full_number = %summary.full_number,
                        receipt_id = %summary.id,
                        "receipt failed; continuing with the next one"
                    );
                    self.events.emit(StatusEvent::ReceiptFailed {
                        full_number: summary.full_number.clone(),
                        receipt_id: summary.id.clone(),
                        error: err.to_string(),
                    });
                    report.failed.push(summary.full_number.clone());
                }
            }
        }

        enter(Phase::Sweeping);
        report.swept = sweeper::sweep(&self.store, self.retention_days).await?;
        if !report.swept.is_empty() {
            self.events.emit(StatusEvent::RecordsSwept {
                removed: report.swept.len(),
                retention_days: self.retention_days,
            });
        }

        self.events.emit(StatusEvent::CycleFinished {
            printed: report.printed.len(),
            unchanged: report.unchanged.len(),
            failed: report.failed.len(),
        });
        Ok(report)
    }

    /// Print `summary` unless an identical copy was already printed.
    /// Nothing is persisted unless printing succeeded.
    #[instrument(skip_all, fields(full_number = %summary.full_number, receipt_id = %summary.id))]
    pub async fn process_receipt(
        &self,
        summary: &ReceiptSummary,
    ) -> Result<ReceiptOutcome, ReceiptError> {
        if summary.full_number.trim().is_empty() || summary.id.trim().is_empty() {
            return Err(ReceiptError::MissingIdentity);
        }
        let full_number = summary.full_number.as_str();

        enter(Phase::Checking);
        let persisted = self.store.read(full_number).await?;

        enter(Phase::Fetching);
        let body = self.catalog.fetch_detail(&summary.id).await?;
        let classification = dedup::compare(persisted.as_deref(), &body);
        debug!(classification = classification.as_str(), "receipt classified");
        if !classification.needs_print() {
            info!("receipt already printed and unchanged; ignoring");
            return Ok(ReceiptOutcome::Unchanged);
        }

        enter(Phase::Interpreting);
        let interpretation = self.interpreter.interpret(&body).await?;
        for warning in interpretation.warnings {
            warn!(warning = %warning, "image skipped");
            self.events.emit(StatusEvent::ImageSkipped {
                full_number: full_number.to_string(),
                detail: warning,
            });
        }

        enter(Phase::Printing);
        print_job(self.printer.as_ref(), &interpretation.operations).await?;

        enter(Phase::Persisting);
        self.store.write(full_number, &body).await?;
        info!(
            operations = interpretation.operations.len(),
            classification = classification.as_str(),
            "receipt printed and saved"
        );
        Ok(ReceiptOutcome::Printed(classification))
    }
}

fn enter(phase: Phase) {
    debug!(?phase, "entering phase");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    /// A cycle hit a fatal error; no cycles run until a restart.
    Halted { reason: String },
}

/// Drives cycles forever, one at a time, sleeping between them.
pub struct Runner {
    pipeline: Pipeline,
    events: Arc<dyn StatusSink>,
    poll_interval: Duration,
    restart_after: Option<Duration>,
    state: RunnerState,
}

impl Runner {
    pub fn new(
        pipeline: Pipeline,
        events: Arc<dyn StatusSink>,
        poll_interval: Duration,
        restart_after: Option<Duration>,
    ) -> Self {
        Self {
            pipeline,
            events,
            poll_interval,
            restart_after,
            state: RunnerState::Idle,
        }
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    /// Advance the state machine once and return how long to wait before the
    /// next call. A fatal error with no restart delay configured is returned.
    pub async fn tick(&mut self) -> Result<Duration, CycleError> {
        match &self.state {
            RunnerState::Idle => match self.pipeline.run_cycle().await {
                Ok(_) => Ok(self.poll_interval),
                Err(err) => {
                    error!(%err, "cycle aborted; halting");
                    self.events.emit(StatusEvent::Halted {
                        error: err.to_string(),
                    });
                    self.state = RunnerState::Halted {
                        reason: err.to_string(),
                    };
                    match self.restart_after {
                        Some(delay) => Ok(delay),
                        None => Err(err),
                    }
                }
            },
            RunnerState::Halted { reason } => {
                info!(previous_error = %reason, "restarting after halt");
                self.state = RunnerState::Idle;
                self.events.emit(StatusEvent::Restarted);
                Ok(Duration::ZERO)
            }
        }
    }

    pub async fn run(mut self) -> Result<(), CycleError> {
        loop {
            let wait = self.tick().await?;
            tokio::time::sleep(wait).await;
        }
    }
}
