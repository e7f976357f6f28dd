//! Decides whether a fetched receipt has to be printed.
//!
//! Comparison is exact text equality after normalizing line endings to LF on
//! both sides. Any server-side content that varies between fetches (a
//! timestamp baked into the body, say) makes every fetch look changed.
use crate::model::{Classification, ReceiptBody};

/// Canonical form used for comparison: CRLF and lone CR become LF.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Classify `body` against the persisted copy, `None` when never printed.
pub fn compare(persisted: Option<&str>, body: &ReceiptBody) -> Classification {
    match persisted {
        None => Classification::New,
        Some(stored) if normalize(stored) == normalize(&body.to_text()) => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}
