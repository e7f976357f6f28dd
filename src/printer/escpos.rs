//! ESC/POS printer reached through a USB line-printer device node.
use async_trait::async_trait;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::{scale_to_width, DeviceError, PrintSession, Printer};
use crate::config::{self, Config, ConfigError};
use crate::model::{Align, PrintOperation, TextStyle};

const ESC: u8 = 0x1b;
const GS: u8 = 0x1d;
const LF: u8 = 0x0a;

const SYSFS_USBMISC: &str = "/sys/class/usbmisc";
const DEV_USB: &str = "/dev/usb";

/// Rows per raster band; keeps each `GS v 0` block within common buffer limits.
const BAND_ROWS: u32 = 255;

#[derive(Debug, Clone)]
pub struct EscPosPrinter {
    device_path: Option<PathBuf>,
    vendor_id: u16,
    product_id: u16,
    width: u32,
}

impl EscPosPrinter {
    pub fn new(device_path: Option<PathBuf>, vendor_id: u16, product_id: u16, width: u32) -> Self {
        Self {
            device_path,
            vendor_id,
            product_id,
            width,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            cfg.printer.device_path.as_ref().map(PathBuf::from),
            cfg.vendor_id()?,
            cfg.product_id()?,
            cfg.printer.width,
        ))
    }

    async fn resolve_path(&self) -> Result<PathBuf, DeviceError> {
        if let Some(path) = &self.device_path {
            return Ok(path.clone());
        }
        find_device_node(
            Path::new(SYSFS_USBMISC),
            Path::new(DEV_USB),
            self.vendor_id,
            self.product_id,
        )
        .await
        .ok_or_else(|| {
            DeviceError::Unavailable(format!(
                "no USB printer with id {:04x}:{:04x}",
                self.vendor_id, self.product_id
            ))
        })
    }
}

/// Find the `lp*` node whose USB device matches `vendor:product`.
pub async fn find_device_node(
    sysfs_root: &Path,
    dev_root: &Path,
    vendor_id: u16,
    product_id: u16,
) -> Option<PathBuf> {
    let mut entries = fs::read_dir(sysfs_root).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("lp") {
            continue;
        }
        // `device` links to the USB interface; the ids live on its parent.
        let usb_device = entry.path().join("device").join("..");
        let vendor = read_usb_id(&usb_device.join("idVendor")).await;
        let product = read_usb_id(&usb_device.join("idProduct")).await;
        if vendor == Some(vendor_id) && product == Some(product_id) {
            return Some(dev_root.join(name));
        }
    }
    None
}

async fn read_usb_id(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).await.ok()?;
    config::parse_usb_id(&raw)
}

#[async_trait]
impl Printer for EscPosPrinter {
    #[instrument(skip_all)]
    async fn open(&self) -> Result<Box<dyn PrintSession>, DeviceError> {
        let path = self.resolve_path().await?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| DeviceError::Unavailable(format!("{}: {}", path.display(), e)))?;
        file.write_all(&init())
            .await
            .map_err(|e| DeviceError::Io(e.to_string()))?;
        debug!(path = %path.display(), "printer opened");
        Ok(Box::new(EscPosSession {
            file,
            path,
            width: self.width,
        }))
    }
}

struct EscPosSession {
    file: File,
    path: PathBuf,
    width: u32,
}

#[async_trait]
impl PrintSession for EscPosSession {
    async fn apply(&mut self, op: &PrintOperation) -> Result<(), DeviceError> {
        let bytes = match op {
            PrintOperation::EmitText { content, style } => encode_text(content, style),
            PrintOperation::EmitImage { image, .. } => {
                encode_image(&scale_to_width(image, self.width))
            }
            PrintOperation::Cut => cut(),
        };
        self.file
            .write_all(&bytes)
            .await
            .map_err(|e| DeviceError::Io(format!("{}: {}", self.path.display(), e)))
    }

    async fn close(self: Box<Self>) -> Result<(), DeviceError> {
        let mut session = self;
        session
            .file
            .flush()
            .await
            .map_err(|e| DeviceError::Io(format!("{}: {}", session.path.display(), e)))?;
        info!(path = %session.path.display(), "printer released");
        Ok(())
    }
}

/// `ESC @` then code page PC850 (`ESC t 2`).
pub fn init() -> Vec<u8> {
    vec![ESC, b'@', ESC, b't', 2]
}

/// Feed to the cutter and cut partially (`GS V 66 0`).
pub fn cut() -> Vec<u8> {
    vec![GS, b'V', 66, 0]
}

pub fn encode_text(content: &str, style: &TextStyle) -> Vec<u8> {
    let align = match style.align {
        Align::Left => 0,
        Align::Center => 1,
        Align::Right => 2,
    };
    let magnify = style.height_unit.clamp(1, 8) - 1;
    let mut out = vec![
        ESC,
        b'a',
        align,
        ESC,
        b'E',
        u8::from(style.bold),
        GS,
        b'!',
        (magnify << 4) | magnify,
    ];
    out.extend(content.chars().map(to_pc850));
    out.push(LF);
    out
}

fn to_pc850(c: char) -> u8 {
    match c {
        c if c.is_ascii() => c as u8,
        'ç' => 0x87,
        'ü' => 0x81,
        'é' => 0x82,
        'á' => 0xa0,
        'í' => 0xa1,
        'ó' => 0xa2,
        'ú' => 0xa3,
        'ñ' => 0xa4,
        'Ñ' => 0xa5,
        'ª' => 0xa6,
        'º' => 0xa7,
        '¿' => 0xa8,
        '¡' => 0xad,
        'Á' => 0xb5,
        'É' => 0x90,
        'Í' => 0xd6,
        'Ó' => 0xe0,
        'Ú' => 0xe9,
        'Ü' => 0x9a,
        '°' => 0xf8,
        _ => b'?',
    }
}

/// 1-bit raster (`GS v 0`), dark pixels printed, split into bands.
pub fn encode_image(image: &DynamicImage) -> Vec<u8> {
    let luma = image.to_luma8();
    let (width, height) = luma.dimensions();
    let row_bytes = width.div_ceil(8);
    let mut out = Vec::new();
    let mut top = 0;
    while top < height {
        let rows = BAND_ROWS.min(height - top);
        out.extend([
            GS,
            b'v',
            b'0',
            0,
            (row_bytes & 0xff) as u8,
            (row_bytes >> 8) as u8,
            (rows & 0xff) as u8,
            (rows >> 8) as u8,
        ]);
        for y in top..top + rows {
            for byte in 0..row_bytes {
                let mut bits = 0u8;
                for bit in 0..8 {
                    let x = byte * 8 + bit;
                    if x < width && luma.get_pixel(x, y).0[0] < 128 {
                        bits |= 0x80 >> bit;
                    }
                }
                out.push(bits);
            }
        }
        top += rows;
    }
    out
}
