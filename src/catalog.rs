use reqwest::Url;
use tracing::{info, instrument};

use crate::model::{ReceiptBody, ReceiptSummary};
use crate::transport::{FetchError, Fetched, Transport};

const LIST_ENDPOINT: &str = "app-get-comprobantes.php";
const DETAIL_ENDPOINT: &str = "app-get-comprobante.php";
const LOGO_PATH: &str = "app/logo.jpg";

/// Client for the remote receipt API rooted at `base_url`.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    transport: Transport,
    base_url: Url,
    pos_id: String,
}

impl CatalogClient {
    /// `base_url` must end with `/` so endpoint names resolve beneath it.
    pub fn new(transport: Transport, base_url: Url, pos_id: impl Into<String>) -> Self {
        Self {
            transport,
            base_url,
            pos_id: pos_id.into(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn list_url(&self) -> Result<Url, FetchError> {
        let mut url = self.endpoint(LIST_ENDPOINT)?;
        url.query_pairs_mut().append_pair("ptoVta", &self.pos_id);
        Ok(url)
    }

    pub fn detail_url(&self, receipt_id: &str) -> Result<Url, FetchError> {
        let mut url = self.endpoint(DETAIL_ENDPOINT)?;
        url.query_pairs_mut().append_pair("id", receipt_id);
        Ok(url)
    }

    pub fn logo_url(&self) -> Result<Url, FetchError> {
        self.endpoint(LOGO_PATH)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url.join(path).map_err(|e| FetchError::Request {
            url: format!("{}{}", self.base_url, path),
            message: e.to_string(),
        })
    }

    /// Receipts pending for this point of sale. An empty body, `null` or `[]`
    /// all mean nothing is pending.
    #[instrument(skip_all, fields(pos_id = %self.pos_id))]
    pub async fn list_pending(&self) -> Result<Vec<ReceiptSummary>, FetchError> {
        let url = self.list_url()?;
        let fetched = self.transport.get(&url).await?;
        let summaries = parse_listing(&url, &fetched)?;
        info!(count = summaries.len(), "receipts listed");
        Ok(summaries)
    }

    /// Detail body of one receipt, split into raw records. No validation here.
    #[instrument(skip_all, fields(receipt_id = %receipt_id))]
    pub async fn fetch_detail(&self, receipt_id: &str) -> Result<ReceiptBody, FetchError> {
        let url = self.detail_url(receipt_id)?;
        let text = self.transport.get_text(&url).await?;
        Ok(ReceiptBody::from_text(&text))
    }

    pub async fn fetch_logo(&self) -> Result<Vec<u8>, FetchError> {
        let url = self.logo_url()?;
        Ok(self.transport.get(&url).await?.body)
    }
}

fn parse_listing(url: &Url, fetched: &Fetched) -> Result<Vec<ReceiptSummary>, FetchError> {
    let text = fetched.text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Option<Vec<ReceiptSummary>> =
        serde_json::from_str(trimmed).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(parsed.unwrap_or_default())
}
