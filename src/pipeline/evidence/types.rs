use std::fmt;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EvidenceError;

/// Maximum base64 payload accepted per image (20 MB).
pub const MAX_IMAGE_BASE64_BYTES: usize = 20 * 1024 * 1024;

/// Raster formats the vision models accept.
pub const SUPPORTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp"];

/// Literal the model must use when a gauge cannot be read.
pub const ILLEGIBLE_READING: &str = "ILLEGIBLE";

// ──────────────────────────────────────────────
// Request side
// ──────────────────────────────────────────────

/// What kind of comparison the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InspectionMode {
    /// Same tire/rim as the reference? Tread and cut damage.
    TireIdentity,
    /// Seal condition, gauge reading, unauthorized fittings.
    FuelValveIntegrity,
}

impl InspectionMode {
    pub fn all() -> &'static [InspectionMode] {
        &[Self::TireIdentity, Self::FuelValveIntegrity]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TireIdentity => "TIRE_IDENTITY",
            Self::FuelValveIntegrity => "FUEL_VALVE_INTEGRITY",
        }
    }
}

impl fmt::Display for InspectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which identifier an identification call looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentifierKind {
    LicensePlate,
    TrailerNumber,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LicensePlate => "LICENSE_PLATE",
            Self::TrailerNumber => "TRAILER_NUMBER",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single photographic capture, held as base64 with its declared MIME type.
///
/// The payload is only ever encoded for transport; nothing in the pipeline
/// decodes pixels or rewrites the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EvidenceImage {
    mime_type: String,
    data: String,
}

impl EvidenceImage {
    /// Wrap raw image bytes.
    pub fn from_bytes(bytes: &[u8], mime_type: &str) -> Result<Self, EvidenceError> {
        if bytes.is_empty() {
            return Err(EvidenceError::InvalidImage("image payload is empty".into()));
        }
        let mime_type = canonical_mime(mime_type)?;
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::checked(mime_type, data)
    }

    /// Wrap an already base64-encoded payload (e.g. from a browser upload).
    pub fn from_base64(data: impl Into<String>, mime_type: &str) -> Result<Self, EvidenceError> {
        let data: String = data.into();
        let data = strip_data_url_prefix(&data).trim().to_string();
        if data.is_empty() {
            return Err(EvidenceError::InvalidImage("image payload is empty".into()));
        }
        let mime_type = canonical_mime(mime_type)?;
        base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| EvidenceError::InvalidImage(format!("payload is not valid base64: {e}")))?;
        Self::checked(mime_type, data)
    }

    /// Read an image file, guessing its MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self, EvidenceError> {
        let mime = mime_guess::from_path(path).first().ok_or_else(|| {
            EvidenceError::InvalidImage(format!(
                "cannot determine image type of {}",
                path.display()
            ))
        })?;
        let bytes = std::fs::read(path).map_err(|e| {
            EvidenceError::InvalidImage(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_bytes(&bytes, mime.essence_str())
    }

    fn checked(mime_type: String, data: String) -> Result<Self, EvidenceError> {
        if data.len() > MAX_IMAGE_BASE64_BYTES {
            return Err(EvidenceError::InvalidImage(format!(
                "encoded image is {} bytes, maximum is {MAX_IMAGE_BASE64_BYTES}",
                data.len()
            )));
        }
        Ok(Self { mime_type, data })
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Base64 payload as sent on the wire.
    pub fn base64(&self) -> &str {
        &self.data
    }

    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }
}

// Payloads are never printed; logs only see type and size.
impl fmt::Debug for EvidenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceImage")
            .field("mime_type", &self.mime_type)
            .field("encoded_len", &self.data.len())
            .finish()
    }
}

fn canonical_mime(mime_type: &str) -> Result<String, EvidenceError> {
    let lowered = mime_type.trim().to_ascii_lowercase();
    let canonical = match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => lowered,
    };
    if SUPPORTED_MIME_TYPES.contains(&canonical.as_str()) {
        Ok(canonical)
    } else {
        Err(EvidenceError::InvalidImage(format!(
            "unsupported MIME type '{mime_type}' (expected one of {})",
            SUPPORTED_MIME_TYPES.join(", ")
        )))
    }
}

/// `data:image/png;base64,AAAA` → `AAAA`
fn strip_data_url_prefix(data: &str) -> &str {
    match data.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, payload)| payload).unwrap_or(rest),
        None => data,
    }
}

/// One comparison call: the field capture against its baseline.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonRequest<'a> {
    pub mode: InspectionMode,
    pub current: &'a EvidenceImage,
    pub reference: &'a EvidenceImage,
}

impl<'a> ComparisonRequest<'a> {
    pub fn new(
        mode: InspectionMode,
        current: &'a EvidenceImage,
        reference: &'a EvidenceImage,
    ) -> Self {
        Self {
            mode,
            current,
            reference,
        }
    }
}

// ──────────────────────────────────────────────
// Response side
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SealIntegrity {
    Intact,
    /// Color/tone deviation without a confirmed breach.
    Suspect,
    Broken,
}

impl SealIntegrity {
    pub fn all() -> &'static [SealIntegrity] {
        &[Self::Intact, Self::Suspect, Self::Broken]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intact => "INTACT",
            Self::Suspect => "SUSPECT",
            Self::Broken => "BROKEN",
        }
    }

    /// Exact literal match only. `"intact"` or `" BROKEN"` are not accepted.
    pub fn from_literal(value: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.as_str() == value)
    }
}

/// The four facts a comparison must report. All four are mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Findings {
    pub identity_confirmed: bool,
    pub seal_integrity: SealIntegrity,
    /// Numeric text, `ILLEGIBLE`, or a not-applicable marker in tire mode.
    pub gauge_reading: String,
    /// Empty when nothing abnormal was seen.
    pub anomaly_description: String,
}

impl Findings {
    pub fn gauge_is_illegible(&self) -> bool {
        self.gauge_reading.trim().eq_ignore_ascii_case(ILLEGIBLE_READING)
    }
}

/// Three-tier alert taxonomy. Ordered so that `max()` picks the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Green,
    Yellow,
    Red,
}

impl AlertLevel {
    pub fn all() -> &'static [AlertLevel] {
        &[Self::Green, Self::Yellow, Self::Red]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Yellow => "YELLOW",
            Self::Red => "RED",
        }
    }

    pub fn from_literal(value: &str) -> Option<Self> {
        Self::all().iter().copied().find(|l| l.as_str() == value)
    }

    /// RED is the trigger condition for the external alert dispatcher.
    pub fn requires_dispatch(&self) -> bool {
        matches!(self, Self::Red)
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified outcome of one comparison call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub mode: InspectionMode,
    pub alert_level: AlertLevel,
    pub findings: Findings,
    pub reasoning: String,
    pub model_used: String,
    pub evaluated_at: DateTime<Utc>,
}

/// A normalized plate or trailer identifier.
///
/// Only `normalize_identifier` builds these, so every value is uppercase,
/// at least three characters long, and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `None` means no identifier was found in the image.
pub type IdentifierResult = Option<Identifier>;

// ──────────────────────────────────────────────
// Gateway contract
// ──────────────────────────────────────────────

/// The images attached to one inference call. Never zero, never more than two.
#[derive(Debug, Clone, Copy)]
pub enum ImageSet<'a> {
    Single(&'a EvidenceImage),
    /// Sent in this order: current first, reference second.
    Pair {
        current: &'a EvidenceImage,
        reference: &'a EvidenceImage,
    },
}

impl<'a> ImageSet<'a> {
    pub fn images(&self) -> Vec<&'a EvidenceImage> {
        match *self {
            Self::Single(image) => vec![image],
            Self::Pair { current, reference } => vec![current, reference],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Pair { .. } => 2,
        }
    }

    pub fn total_encoded_len(&self) -> usize {
        self.images().iter().map(|i| i.encoded_len()).sum()
    }
}

/// Output shape requested from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    /// Free text (identification).
    Text,
    /// JSON constrained by the given JSON schema (comparison).
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct InferenceRequest<'a> {
    pub system: Option<String>,
    pub prompt: String,
    pub images: ImageSet<'a>,
    pub format: ResponseFormat,
}

/// Whatever the model sent back, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl RawOutput {
    /// Text form used for audit dumps.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// Boundary to the external multimodal model (allows mocking).
///
/// Implementations must give up once `deadline` has elapsed and report
/// `InferenceTimeout`. They must not retry on their own.
pub trait VisionGateway: Send + Sync {
    fn invoke(
        &self,
        request: &InferenceRequest<'_>,
        deadline: Duration,
    ) -> Result<RawOutput, EvidenceError>;

    /// Model identity recorded on every verdict.
    fn model_name(&self) -> &str;
}
