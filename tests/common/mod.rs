#![allow(dead_code)]

use async_trait::async_trait;
use image::DynamicImage;
use receipt_sync::catalog::CatalogClient;
use receipt_sync::cycle::Pipeline;
use receipt_sync::events::{StatusEvent, StatusSink};
use receipt_sync::model::PrintOperation;
use receipt_sync::printer::{DeviceError, PrintSession, Printer};
use receipt_sync::store::ReceiptStore;
use receipt_sync::transport::{Fetch, FetchError, Fetched, RetryPolicy, Transport};
use reqwest::Url;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const BASE: &str = "http://pos.test/";

pub fn list_url(pos: &str) -> String {
    format!("{}app-get-comprobantes.php?ptoVta={}", BASE, pos)
}

pub fn detail_url(id: &str) -> String {
    format!("{}app-get-comprobante.php?id={}", BASE, id)
}

pub fn logo_url() -> String {
    format!("{}app/logo.jpg", BASE)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Fetcher answering from a fixed URL table; unknown URLs get a 404.
#[derive(Clone, Default)]
pub struct RouteFetch {
    routes: Arc<Mutex<HashMap<String, Result<Fetched, u16>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RouteFetch {
    pub fn respond(&self, url: impl Into<String>, body: impl AsRef<[u8]>) {
        self.serve(url, Fetched::new(body.as_ref().to_vec()));
    }

    pub fn respond_typed(&self, url: impl Into<String>, content_type: &str, body: impl AsRef<[u8]>) {
        self.serve(url, Fetched::new(body.as_ref().to_vec()).with_content_type(content_type));
    }

    fn serve(&self, url: impl Into<String>, fetched: Fetched) {
        self.routes.lock().unwrap().insert(url.into(), Ok(fetched));
    }

    pub fn fail(&self, url: impl Into<String>, status: u16) {
        self.routes.lock().unwrap().insert(url.into(), Err(status));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetch for RouteFetch {
    async fn fetch_once(&self, url: &Url) -> Result<Fetched, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let route = self.routes.lock().unwrap().get(url.as_str()).cloned();
        match route {
            Some(Ok(fetched)) => Ok(fetched),
            Some(Err(status)) => Err(FetchError::Status { url: url.to_string(), status }),
            None => Err(FetchError::Status { url: url.to_string(), status: 404 }),
        }
    }
}

/// Printer that records each job as a list of operation descriptions.
#[derive(Clone, Default)]
pub struct RecordingPrinter {
    jobs: Arc<Mutex<Vec<Vec<String>>>>,
    opens: Arc<Mutex<usize>>,
    closes: Arc<Mutex<usize>>,
    unplugged: Arc<Mutex<bool>>,
}

impl RecordingPrinter {
    pub fn jobs(&self) -> Vec<Vec<String>> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn set_unplugged(&self, unplugged: bool) {
        *self.unplugged.lock().unwrap() = unplugged;
    }

    pub fn opens(&self) -> usize {
        *self.opens.lock().unwrap()
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }
}

pub fn describe(op: &PrintOperation) -> String {
    match op {
        PrintOperation::EmitText { content, style } => {
            format!("text:{}:{}:{}", if style.bold { "B" } else { "N" }, style.height_unit, content)
        }
        PrintOperation::EmitImage { source, .. } => format!("image:{}", source.as_str()),
        PrintOperation::Cut => "cut".to_string(),
    }
}

struct RecordingSession {
    owner: RecordingPrinter,
    ops: Vec<String>,
}

#[async_trait]
impl Printer for RecordingPrinter {
    async fn open(&self) -> Result<Box<dyn PrintSession>, DeviceError> {
        if *self.unplugged.lock().unwrap() {
            return Err(DeviceError::Unavailable("device not found".into()));
        }
        *self.opens.lock().unwrap() += 1;
        Ok(Box::new(RecordingSession {
            owner: self.clone(),
            ops: Vec::new(),
        }))
    }
}

#[async_trait]
impl PrintSession for RecordingSession {
    async fn apply(&mut self, op: &PrintOperation) -> Result<(), DeviceError> {
        self.ops.push(describe(op));
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), DeviceError> {
        *self.owner.closes.lock().unwrap() += 1;
        self.owner.jobs.lock().unwrap().push(self.ops);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingSink {
    fn emit(&self, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn catalog(fetch: &RouteFetch, max_attempts: u32) -> CatalogClient {
    let transport = Transport::new(Arc::new(fetch.clone()), RetryPolicy::new(max_attempts));
    CatalogClient::new(transport, Url::parse(BASE).unwrap(), "1")
}

pub struct Harness {
    pub fetch: RouteFetch,
    pub printer: RecordingPrinter,
    pub sink: RecordingSink,
    pub store: ReceiptStore,
    pub pipeline: Pipeline,
}

pub async fn harness(data_dir: &Path, retention_days: u32) -> Harness {
    let fetch = RouteFetch::default();
    let printer = RecordingPrinter::default();
    let sink = RecordingSink::default();
    let store = ReceiptStore::open(data_dir).await.unwrap();
    let pipeline = Pipeline::new(
        catalog(&fetch, 1),
        store.clone(),
        Arc::new(printer.clone()),
        Arc::new(sink.clone()),
        retention_days,
    );
    Harness { fetch, printer, sink, store, pipeline }
}

pub fn listing(entries: &[(&str, &str)]) -> String {
    let items: Vec<serde_json::Value> = entries
        .iter()
        .map(|(number, id)| {
            serde_json::json!({
                "numero_completo": number,
                "idcomprobante": id,
                "fecha": "2024-05-01 10:00:00"
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}
