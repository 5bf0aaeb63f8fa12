//! Prompt and schema construction for evidence inference calls.
//!
//! Each `InspectionMode` owns one `ModeProfile` entry: its instruction block,
//! the fields a response must carry, and how gauge readings are judged. The
//! escalation rules and the JSON contract are shared by every mode, so the
//! model is always told the same thing the classifier enforces.

use serde_json::{json, Value};

use super::types::{IdentifierKind, InspectionMode, SealIntegrity, ILLEGIBLE_READING};

// ──────────────────────────────────────────────
// Findings contract
// ──────────────────────────────────────────────

pub const FIELD_IDENTITY_CONFIRMED: &str = "identityConfirmed";
pub const FIELD_SEAL_INTEGRITY: &str = "sealIntegrity";
pub const FIELD_GAUGE_READING: &str = "gaugeReading";
pub const FIELD_ANOMALY_DESCRIPTION: &str = "anomalyDescription";

/// Every comparison response must carry all of these.
pub const FINDINGS_FIELDS: &[&str] = &[
    FIELD_IDENTITY_CONFIRMED,
    FIELD_SEAL_INTEGRITY,
    FIELD_GAUGE_READING,
    FIELD_ANOMALY_DESCRIPTION,
];

/// How the classifier treats `gaugeReading` for a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugePolicy {
    /// A numeric reading is expected; anything else needs review.
    Required,
    /// No gauge in frame; only an explicit `ILLEGIBLE` is flagged.
    NotApplicable,
}

/// Per-mode prompt and schema settings.
#[derive(Debug)]
pub struct ModeProfile {
    pub mode: InspectionMode,
    pub title: &'static str,
    pub instructions: &'static str,
    pub required_fields: &'static [&'static str],
    pub gauge_policy: GaugePolicy,
}

static TIRE_IDENTITY_PROFILE: ModeProfile = ModeProfile {
    mode: InspectionMode::TireIdentity,
    title: "TIRE IDENTITY VERIFICATION",
    instructions: "\
1. IDENTITY MATCH: Locate the painted or printed identifier on the tire or rim in BOTH images \
(serial, DOT code, fleet marking). Compare it character by character. Then compare unique rim \
imperfections: scratches, dents, weld marks, paint chips, and their positions.
2. CONDITION: Assess tread depth and any cut, bulge, or sidewall damage visible in the CURRENT image \
that is not present in the REFERENCE image.
3. SAME-OBJECT JUDGMENT: Decide whether the CURRENT image shows the very same physical tire as the \
REFERENCE image. If you cannot establish it with confidence, set identityConfirmed to false.
There is no seal in tire mode: report sealIntegrity as \"INTACT\" unless the valve cap or bead seal \
shows tampering. There is no gauge: report gaugeReading as \"N/A\".",
    required_fields: FINDINGS_FIELDS,
    gauge_policy: GaugePolicy::NotApplicable,
};

static FUEL_VALVE_PROFILE: ModeProfile = ModeProfile {
    mode: InspectionMode::FuelValveIntegrity,
    title: "FUEL VALVE INTEGRITY VERIFICATION",
    instructions: "\
1. IDENTITY MATCH: Confirm the CURRENT image shows the same valve assembly and seal serial as the \
REFERENCE image.
2. SEAL CONDITION: Compare the security seal in both images. Look for stress marks, adhesive residue, \
cut marks, re-glued edges, and color shift. Report INTACT, SUSPECT (color or tone deviation without a \
confirmed breach), or BROKEN.
3. GAUGE READING: Read the exact value shown on the gauge or flow meter in the CURRENT image, digits only. \
If it cannot be read, report exactly \"ILLEGIBLE\". Never estimate.
4. ATTACHMENTS: Look for unauthorized attachments that are absent from the REFERENCE image: hoses, \
T-fittings, foreign valves, bypass lines, or substituted parts. Describe any you find in \
anomalyDescription.",
    required_fields: FINDINGS_FIELDS,
    gauge_policy: GaugePolicy::Required,
};

/// Look up the profile for a mode.
pub fn mode_profile(mode: InspectionMode) -> &'static ModeProfile {
    match mode {
        InspectionMode::TireIdentity => &TIRE_IDENTITY_PROFILE,
        InspectionMode::FuelValveIntegrity => &FUEL_VALVE_PROFILE,
    }
}

impl InspectionMode {
    pub fn profile(self) -> &'static ModeProfile {
        mode_profile(self)
    }
}

// ──────────────────────────────────────────────
// Shared blocks
// ──────────────────────────────────────────────

pub const EVIDENCE_SYSTEM_PROMPT: &str = "\
You are a forensic inspection analyst for a regulated vehicle fleet. You compare a CURRENT field \
photograph against a REFERENCE baseline photograph of the same asset. Report only what is visible. \
Never guess, never fill in values you cannot see, and never add commentary outside the requested JSON.";

const ESCALATION_RULES: &str = "\
ESCALATION RULES (these decide the alert level downstream, so report the facts exactly):
- RED: the asset identity is NOT confirmed, OR the seal is BROKEN, OR a foreign attachment or part \
substitution is present (describe it in anomalyDescription).
- YELLOW: none of the RED conditions, but the seal is SUSPECT (color/tone deviation without a confirmed \
breach) or the gauge is ILLEGIBLE.
- GREEN: identity confirmed, seal INTACT, gauge readable, and no anomaly.";

/// Build the instruction text for a comparison call.
pub fn build_comparison_prompt(mode: InspectionMode) -> String {
    let profile = mode.profile();
    let seal_values = SealIntegrity::all()
        .iter()
        .map(|s| format!("\"{}\"", s.as_str()))
        .collect::<Vec<_>>()
        .join(" | ");
    let required = profile.required_fields.join(", ");

    format!(
        r#"{title}

Image 1 is the CURRENT field capture. Image 2 is the REFERENCE baseline.

{instructions}

{ESCALATION_RULES}

Respond with ONE JSON object and nothing else, exactly in this shape:

{{
  "identityConfirmed": true | false,
  "sealIntegrity": {seal_values},
  "gaugeReading": "digits as shown, or \"{ILLEGIBLE_READING}\"",
  "anomalyDescription": "description of any anomaly, or an empty string"
}}

ALL fields are REQUIRED: {required}. A response missing any field is rejected.
Use the exact uppercase literals shown. Do not wrap the JSON in prose."#,
        title = profile.title,
        instructions = profile.instructions,
    )
}

/// JSON schema handed to the model runtime to constrain comparison output.
pub fn findings_schema(mode: InspectionMode) -> Value {
    let profile = mode.profile();
    let seal_values: Vec<&str> = SealIntegrity::all().iter().map(|s| s.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            FIELD_IDENTITY_CONFIRMED: { "type": "boolean" },
            FIELD_SEAL_INTEGRITY: { "type": "string", "enum": seal_values },
            FIELD_GAUGE_READING: { "type": "string" },
            FIELD_ANOMALY_DESCRIPTION: { "type": "string" }
        },
        "required": profile.required_fields,
    })
}

// ──────────────────────────────────────────────
// Identification
// ──────────────────────────────────────────────

pub const IDENTITY_SYSTEM_PROMPT: &str = "\
You are an OCR engine for fleet vehicles. You read exactly one identifier from a photograph and \
output it verbatim. You never explain, never apologize, and never output more than one line.";

/// Build the instruction text for reading a plate or trailer number.
pub fn build_identity_prompt(kind: IdentifierKind) -> String {
    let subject = match kind {
        IdentifierKind::LicensePlate => "the vehicle LICENSE PLATE number",
        IdentifierKind::TrailerNumber => {
            "the TRAILER NUMBER (unit ID painted or stenciled on the trailer body or door)"
        }
    };

    format!(
        "Read {subject} in this image.\n\
         Return ONLY the identifier, in UPPERCASE, preserving any hyphens.\n\
         If no identifier is readable, return exactly: null\n\
         Do not output any other text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_has_a_profile_with_all_findings_fields() {
        for &mode in InspectionMode::all() {
            let profile = mode.profile();
            assert_eq!(profile.mode, mode);
            for field in FINDINGS_FIELDS {
                assert!(
                    profile.required_fields.contains(field),
                    "{mode} profile misses {field}"
                );
            }
        }
    }

    #[test]
    fn tire_prompt_covers_identity_tread_and_judgment() {
        let prompt = build_comparison_prompt(InspectionMode::TireIdentity);
        assert!(prompt.contains("TIRE IDENTITY"));
        assert!(prompt.contains("rim imperfections"));
        assert!(prompt.contains("tread depth"));
        assert!(prompt.contains("SAME-OBJECT JUDGMENT"));
    }

    #[test]
    fn fuel_prompt_covers_seal_gauge_and_attachments() {
        let prompt = build_comparison_prompt(InspectionMode::FuelValveIntegrity);
        assert!(prompt.contains("adhesive residue"));
        assert!(prompt.contains("color shift"));
        assert!(prompt.contains("\"ILLEGIBLE\""));
        assert!(prompt.contains("T-fittings"));
        assert!(prompt.contains("foreign valves"));
    }

    #[test]
    fn both_prompts_embed_escalation_and_schema() {
        for &mode in InspectionMode::all() {
            let prompt = build_comparison_prompt(mode);
            assert!(prompt.contains("ESCALATION RULES"), "{mode}");
            assert!(prompt.contains("- RED:"), "{mode}");
            assert!(prompt.contains("- YELLOW:"), "{mode}");
            assert!(prompt.contains("- GREEN:"), "{mode}");
            for field in FINDINGS_FIELDS {
                assert!(prompt.contains(field), "{mode} prompt misses {field}");
            }
            assert!(prompt.contains("ALL fields are REQUIRED"), "{mode}");
            assert!(prompt.contains("\"INTACT\" | \"SUSPECT\" | \"BROKEN\""), "{mode}");
        }
    }

    #[test]
    fn schema_requires_every_field() {
        let schema = findings_schema(InspectionMode::FuelValveIntegrity);
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, FINDINGS_FIELDS);
        assert_eq!(schema["properties"]["identityConfirmed"]["type"], "boolean");
        assert_eq!(
            schema["properties"]["sealIntegrity"]["enum"],
            json!(["INTACT", "SUSPECT", "BROKEN"])
        );
    }

    #[test]
    fn gauge_policy_differs_by_mode() {
        assert_eq!(
            InspectionMode::FuelValveIntegrity.profile().gauge_policy,
            GaugePolicy::Required
        );
        assert_eq!(
            InspectionMode::TireIdentity.profile().gauge_policy,
            GaugePolicy::NotApplicable
        );
    }

    #[test]
    fn identity_prompt_demands_bare_identifier_or_null() {
        for kind in [IdentifierKind::LicensePlate, IdentifierKind::TrailerNumber] {
            let prompt = build_identity_prompt(kind);
            assert!(prompt.contains("Return ONLY the identifier"));
            assert!(prompt.contains("UPPERCASE"));
            assert!(prompt.contains("hyphens"));
            assert!(prompt.contains("return exactly: null"));
        }
        assert!(build_identity_prompt(IdentifierKind::LicensePlate).contains("LICENSE PLATE"));
        assert!(build_identity_prompt(IdentifierKind::TrailerNumber).contains("TRAILER NUMBER"));
    }
}
