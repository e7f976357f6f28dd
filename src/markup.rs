//! Receipt markup interpreter.
//!
//! A receipt body is a list of records. Each non-empty record is one of:
//!
//! - `...#img#<base64>`: inline image, followed by a blank line
//! - `...#url#<url>`: image downloaded from `url`
//! - `#logo#`: the shop logo, downloaded once and cached
//! - `#fin#`: cut the paper; later records are ignored
//! - `<flag>;<height>;<text>`: a text run, bold when `flag` is `B`
//!
//! Directive markers are matched anywhere in the record and checked in the
//! order above. Parsing runs over the whole body before anything is fetched,
//! so a malformed text record fails the receipt without any network traffic.
//! Image downloads that fail are skipped with a warning rather than failing
//! the receipt. Logo cache I/O errors are storage failures and propagate.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::join_all;
use image::{DynamicImage, ImageDecoder, ImageReader};
use reqwest::Url;
use std::collections::VecDeque;
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::CatalogClient;
use crate::model::{
    Align, Directive, ImageSource, PrintOperation, ReceiptBody, Record, TextRecord, TextStyle,
};
use crate::store::{ReceiptStore, StoreError};

pub const INLINE_IMAGE_MARKER: &str = "#img#";
pub const URL_IMAGE_MARKER: &str = "#url#";
pub const LOGO_MARKER: &str = "#logo#";
pub const CUT_MARKER: &str = "#fin#";
pub const FIELD_DELIMITER: char = ';';
pub const BOLD_FLAG: &str = "B";

/// Malformed receipt content. Never retried: the content will not change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("record {line}: expected 3 fields separated by ';', found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("record {line}: height {value:?} is not a number")]
    InvalidHeight { line: usize, value: String },
    #[error("record {line}: height {value} is outside 1..=255")]
    HeightOutOfRange { line: usize, value: i64 },
    #[error("record {line}: inline image is not valid base64: {reason}")]
    InvalidBase64 { line: usize, reason: String },
    #[error("record {line}: inline image could not be decoded: {reason}")]
    InvalidImage { line: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error(transparent)]
    Malformed(#[from] ParseError),
    #[error("logo cache: {0}")]
    Store(#[from] StoreError),
}

/// Text after the first occurrence of `marker`, up to any second occurrence.
fn payload<'a>(record: &'a str, marker: &str) -> &'a str {
    record.split(marker).nth(1).unwrap_or("")
}

/// Parse one non-empty record. `line` is its 1-based position in the body.
pub fn parse_record(line: usize, record: &str) -> Result<Record, ParseError> {
    if record.contains(INLINE_IMAGE_MARKER) {
        let encoded: String = payload(record, INLINE_IMAGE_MARKER)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| ParseError::InvalidBase64 {
                line,
                reason: e.to_string(),
            })?;
        return Ok(Record::Directive(Directive::InlineImage(bytes)));
    }
    if record.contains(URL_IMAGE_MARKER) {
        let url = payload(record, URL_IMAGE_MARKER).trim().to_string();
        return Ok(Record::Directive(Directive::ImageUrl(url)));
    }
    if record.contains(LOGO_MARKER) {
        return Ok(Record::Directive(Directive::Logo));
    }
    if record.contains(CUT_MARKER) {
        return Ok(Record::Directive(Directive::Cut));
    }

    let fields: Vec<&str> = record.split(FIELD_DELIMITER).collect();
    let [flag, height, text] = fields.as_slice() else {
        return Err(ParseError::FieldCount {
            line,
            found: fields.len(),
        });
    };
    let value = height
        .trim()
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidHeight {
            line,
            value: height.to_string(),
        })?;
    let height_unit = u8::try_from(value)
        .ok()
        .filter(|h| *h > 0)
        .ok_or(ParseError::HeightOutOfRange { line, value })?;
    Ok(Record::Text(TextRecord {
        bold: *flag == BOLD_FLAG,
        height_unit,
        content: text.to_string(),
    }))
}

/// Parse every record up to and including the first cut, paired with its
/// 1-based line number.
pub fn parse_body(body: &ReceiptBody) -> Result<Vec<(usize, Record)>, ParseError> {
    let mut records = Vec::new();
    for (line, raw) in body.records() {
        let record = parse_record(line, raw)?;
        let is_cut = matches!(record, Record::Directive(Directive::Cut));
        records.push((line, record));
        if is_cut {
            break;
        }
    }
    Ok(records)
}

/// Decode image bytes and apply any orientation stored in their metadata.
pub fn decode_image(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Result of interpreting one receipt.
#[derive(Debug, Default)]
pub struct Interpretation {
    pub operations: Vec<PrintOperation>,
    /// Images that were skipped, one message each.
    pub warnings: Vec<String>,
}

/// Turns receipt bodies into print operations, downloading images as needed.
#[derive(Debug, Clone)]
pub struct Interpreter {
    catalog: CatalogClient,
    store: ReceiptStore,
}

impl Interpreter {
    pub fn new(catalog: CatalogClient, store: ReceiptStore) -> Self {
        Self { catalog, store }
    }

    pub async fn interpret(&self, body: &ReceiptBody) -> Result<Interpretation, InterpretError> {
        let records = parse_body(body)?;
        let mut downloads = self.download_url_images(&records).await;
        let mut out = Interpretation::default();

        for (line, record) in records {
            match record {
                Record::Text(text) => out.operations.push(PrintOperation::text(
                    text.content,
                    TextStyle {
                        align: Align::Left,
                        bold: text.bold,
                        height_unit: text.height_unit,
                    },
                )),
                Record::Directive(Directive::InlineImage(bytes)) => {
                    let image = decode_image(&bytes).map_err(|e| ParseError::InvalidImage {
                        line,
                        reason: e.to_string(),
                    })?;
                    out.operations.push(PrintOperation::EmitImage {
                        image,
                        source: ImageSource::Inline,
                    });
                    out.operations.push(PrintOperation::blank_line());
                }
                Record::Directive(Directive::ImageUrl(_)) => {
                    match downloads.pop_front().unwrap_or_else(|| Err("download missing".into())) {
                        Ok(image) => out.operations.push(PrintOperation::EmitImage {
                            image,
                            source: ImageSource::Url,
                        }),
                        Err(msg) => out.warnings.push(msg),
                    }
                }
                Record::Directive(Directive::Logo) => {
                    if let Some(image) = self.logo(&mut out.warnings).await? {
                        out.operations.push(PrintOperation::EmitImage {
                            image,
                            source: ImageSource::Logo,
                        });
                    }
                }
                Record::Directive(Directive::Cut) => {
                    out.operations.push(PrintOperation::Cut);
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Download every `#url#` image concurrently, returning results in record order.
    async fn download_url_images(
        &self,
        records: &[(usize, Record)],
    ) -> VecDeque<Result<DynamicImage, String>> {
        let pending = records.iter().filter_map(|(_, r)| match r {
            Record::Directive(Directive::ImageUrl(url)) => Some(self.download_image(url)),
            _ => None,
        });
        join_all(pending).await.into_iter().collect()
    }

    async fn download_image(&self, raw_url: &str) -> Result<DynamicImage, String> {
        let url = Url::parse(raw_url).map_err(|e| {
            warn!(url = raw_url, %e, "image URL is invalid");
            format!("invalid image URL {:?}: {}", raw_url, e)
        })?;
        let fetched = self.catalog.transport().get(&url).await.map_err(|e| {
            warn!(url = %url, %e, "image download failed; skipping");
            e.to_string()
        })?;
        decode_image(&fetched.body).map_err(|e| {
            warn!(url = %url, %e, "downloaded image could not be decoded; skipping");
            format!("image at {} could not be decoded: {}", url, e)
        })
    }

    /// Cached logo, downloading and caching it on first use. An unavailable
    /// or undecodable logo is reported in `warnings` and yields `None`.
    async fn logo(&self, warnings: &mut Vec<String>) -> Result<Option<DynamicImage>, StoreError> {
        let bytes = match self.store.read_logo().await? {
            Some(bytes) => bytes,
            None => {
                let bytes = match self.catalog.fetch_logo().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(%e, "logo download failed; skipping");
                        warnings.push(e.to_string());
                        return Ok(None);
                    }
                };
                self.store.write_logo(&bytes).await?;
                debug!(path = %self.store.logo_path().display(), "logo cached");
                bytes
            }
        };
        match decode_image(&bytes) {
            Ok(image) => Ok(Some(image)),
            Err(e) => {
                warn!(%e, "cached logo is not a valid image; discarding");
                self.store.discard_logo().await?;
                warnings.push(format!("logo could not be decoded: {}", e));
                Ok(None)
            }
        }
    }
}
