//! Printer collaborator interface.
//!
//! A [`Printer`] opens a fresh [`PrintSession`] for every receipt. The device
//! is reopened per job so a half-broken connection from a previous receipt
//! never leaks into the next one. [`print_job`] guarantees the session is
//! closed even when an operation fails midway.
use async_trait::async_trait;
use image::imageops::FilterType;
use image::DynamicImage;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::PrintOperation;

pub mod escpos;

pub use escpos::EscPosPrinter;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("printer not connected: {0}")]
    Unavailable(String),
    #[error("printer I/O failed: {0}")]
    Io(String),
}

#[async_trait]
pub trait Printer: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PrintSession>, DeviceError>;
}

#[async_trait]
pub trait PrintSession: Send {
    async fn apply(&mut self, op: &PrintOperation) -> Result<(), DeviceError>;

    /// Release the device. Called exactly once per session.
    async fn close(self: Box<Self>) -> Result<(), DeviceError>;
}

/// Print `ops` in order on a freshly opened session, always closing it.
/// The first error (from an operation or from closing) is returned.
pub async fn print_job(printer: &dyn Printer, ops: &[PrintOperation]) -> Result<(), DeviceError> {
    let mut session = printer.open().await?;
    let mut outcome = Ok(());
    for op in ops {
        if let Err(err) = session.apply(op).await {
            warn!(%err, kind = op.kind(), "print operation failed; releasing printer");
            outcome = Err(err);
            break;
        }
    }
    let closed = session.close().await;
    outcome.and(closed)
}

/// Scale proportionally so the width matches `width` dots.
pub fn scale_to_width(image: &DynamicImage, width: u32) -> DynamicImage {
    if image.width() == 0 || image.width() == width {
        return image.clone();
    }
    let factor = f64::from(width) / f64::from(image.width());
    let height = ((f64::from(image.height()) * factor).round() as u32).max(1);
    image.resize_exact(width, height, FilterType::Lanczos3)
}

/// Printer that only logs what it would print. Used for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPrinter;

struct LogSession {
    applied: usize,
}

#[async_trait]
impl Printer for LogPrinter {
    async fn open(&self) -> Result<Box<dyn PrintSession>, DeviceError> {
        Ok(Box::new(LogSession { applied: 0 }))
    }
}

#[async_trait]
impl PrintSession for LogSession {
    async fn apply(&mut self, op: &PrintOperation) -> Result<(), DeviceError> {
        self.applied += 1;
        match op {
            PrintOperation::EmitText { content, style } => {
                info!(bold = style.bold, height = style.height_unit, "print text: {}", content)
            }
            PrintOperation::EmitImage { image, source } => info!(
                source = source.as_str(),
                width = image.width(),
                height = image.height(),
                "print image"
            ),
            PrintOperation::Cut => info!("cut"),
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DeviceError> {
        info!(operations = self.applied, "dry-run job finished");
        Ok(())
    }
}
