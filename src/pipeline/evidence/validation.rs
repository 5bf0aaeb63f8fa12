// Strict validation of comparison output against the findings contract.
// Nothing is defaulted or repaired: a missing or mistyped field rejects the
// whole response.

use serde_json::{Map, Value};

use super::prompt::{
    FIELD_ANOMALY_DESCRIPTION, FIELD_GAUGE_READING, FIELD_IDENTITY_CONFIRMED,
    FIELD_SEAL_INTEGRITY,
};
use super::types::{AlertLevel, Findings, InspectionMode, RawOutput, SealIntegrity};
use super::EvidenceError;

/// Optional key some models add on their own. Never trusted, but if present
/// it must still be one of the declared literals.
const FIELD_ALERT_LEVEL: &str = "alertLevel";

/// Validate raw gateway output as `Findings` for `mode`.
pub fn validate_findings(raw: &RawOutput, mode: InspectionMode) -> Result<Findings, EvidenceError> {
    let parsed;
    let value = match raw {
        RawOutput::Structured(value) => value,
        RawOutput::Text(text) => {
            parsed = parse_json_payload(text)?;
            &parsed
        }
    };

    let object = value.as_object().ok_or_else(|| {
        EvidenceError::SchemaViolation(format!(
            "expected a JSON object, got {}",
            json_type_name(value)
        ))
    })?;

    let missing: Vec<&str> = mode
        .profile()
        .required_fields
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(EvidenceError::SchemaViolation(format!(
            "missing required field(s): {}",
            missing.join(", ")
        )));
    }

    let identity_confirmed = require_bool(object, FIELD_IDENTITY_CONFIRMED)?;

    let seal_literal = require_str(object, FIELD_SEAL_INTEGRITY)?;
    let seal_integrity = SealIntegrity::from_literal(seal_literal).ok_or_else(|| {
        EvidenceError::SchemaViolation(format!(
            "{FIELD_SEAL_INTEGRITY} '{seal_literal}' is not one of INTACT, SUSPECT, BROKEN"
        ))
    })?;

    let gauge_reading = require_str(object, FIELD_GAUGE_READING)?.to_string();
    let anomaly_description = require_str(object, FIELD_ANOMALY_DESCRIPTION)?.to_string();

    if let Some(level) = object.get(FIELD_ALERT_LEVEL) {
        let literal = level.as_str().unwrap_or_default();
        if AlertLevel::from_literal(literal).is_none() {
            return Err(EvidenceError::SchemaViolation(format!(
                "{FIELD_ALERT_LEVEL} {level} is not one of GREEN, YELLOW, RED"
            )));
        }
    }

    Ok(Findings {
        identity_confirmed,
        seal_integrity,
        gauge_reading,
        anomaly_description,
    })
}

/// Parse model text as JSON. A single Markdown code fence around the object
/// is tolerated; prose around bare JSON is not.
fn parse_json_payload(text: &str) -> Result<Value, EvidenceError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(EvidenceError::SchemaViolation("empty model response".into()));
    }

    let payload = match extract_fenced_block(trimmed) {
        Some(block) => block,
        None => trimmed,
    };

    serde_json::from_str(payload)
        .map_err(|e| EvidenceError::SchemaViolation(format!("response is not valid JSON: {e}")))
}

/// Contents of the first ```` ``` ```` / ```` ```json ```` block, if any.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let tag = after_fence[..body_start].trim();
    if !(tag.is_empty() || tag.eq_ignore_ascii_case("json")) {
        return None;
    }
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn require_bool(object: &Map<String, Value>, field: &str) -> Result<bool, EvidenceError> {
    match object.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(EvidenceError::SchemaViolation(format!(
            "{field} must be a boolean, got {}",
            json_type_name(other)
        ))),
        None => Err(EvidenceError::SchemaViolation(format!("missing required field(s): {field}"))),
    }
}

fn require_str<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, EvidenceError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(EvidenceError::SchemaViolation(format!(
            "{field} must be a string, got {}",
            json_type_name(other)
        ))),
        None => Err(EvidenceError::SchemaViolation(format!("missing required field(s): {field}"))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
