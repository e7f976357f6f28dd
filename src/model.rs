use chrono::{DateTime, NaiveDate, NaiveDateTime};
use image::DynamicImage;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Record delimiter used by the detail endpoint and by persisted bodies.
pub const RECORD_DELIMITER: &str = "\r\n";

/// A receipt waiting to be printed, as returned by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptSummary {
    #[serde(rename = "numero_completo", default, deserialize_with = "string_or_number")]
    pub full_number: String,
    #[serde(rename = "idcomprobante", default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "fecha", default, deserialize_with = "lenient_timestamp")]
    pub date: Option<NaiveDateTime>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => parse_timestamp(&s),
        _ => None,
    })
}

/// Parse the timestamp formats the listing endpoint is known to produce.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(ts);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|ts| ts.naive_utc())
}

/// Raw receipt detail: the response split on the record delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiptBody {
    pub lines: Vec<String>,
}

impl ReceiptBody {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split(RECORD_DELIMITER).map(str::to_string).collect(),
        }
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// The persisted form: lines joined with CRLF.
    pub fn to_text(&self) -> String {
        self.lines.join(RECORD_DELIMITER)
    }

    /// Non-empty records in order, each with its 1-based line number.
    pub fn records(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(idx, l)| (idx + 1, l.as_str()))
    }
}

/// Directive records, recognised by their marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Base64-decoded image bytes carried inline after `#img#`.
    InlineImage(Vec<u8>),
    /// Image to download from the URL after `#url#`.
    ImageUrl(String),
    Logo,
    Cut,
}

/// A `flag;height;text` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    pub bold: bool,
    pub height_unit: u8,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Directive(Directive),
    Text(TextRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
}

/// Formatting for one text run. Defaults: left aligned, regular weight, height unit 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextStyle {
    pub align: Align,
    pub bold: bool,
    pub height_unit: u8,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            align: Align::Left,
            bold: false,
            height_unit: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    Inline,
    Url,
    Logo,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Inline => "inline",
            ImageSource::Url => "url",
            ImageSource::Logo => "logo",
        }
    }
}

/// Renderer-agnostic instruction handed to the printer collaborator.
#[derive(Debug, Clone)]
pub enum PrintOperation {
    EmitText { content: String, style: TextStyle },
    /// Image already corrected for orientation; scaling is left to the printer.
    EmitImage { image: DynamicImage, source: ImageSource },
    Cut,
}

impl PrintOperation {
    pub fn text(content: impl Into<String>, style: TextStyle) -> Self {
        PrintOperation::EmitText {
            content: content.into(),
            style,
        }
    }

    pub fn blank_line() -> Self {
        PrintOperation::text("", TextStyle::default())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PrintOperation::EmitText { .. } => "text",
            PrintOperation::EmitImage { .. } => "image",
            PrintOperation::Cut => "cut",
        }
    }
}

/// Outcome of comparing a fetched receipt against its persisted copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    New,
    Unchanged,
    Changed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Unchanged => "unchanged",
            Classification::Changed => "changed",
        }
    }

    pub fn needs_print(&self) -> bool {
        !matches!(self, Classification::Unchanged)
    }
}
