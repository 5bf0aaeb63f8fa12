//! Deterministic alert classification.
//!
//! The alert level is computed here from validated findings. It is never
//! taken from the model, even when the model volunteers one. RED conditions
//! are checked first and dominate; YELLOW only applies when no RED condition
//! holds. Every rule that fires contributes a reason, so the verdict explains
//! itself without another model call.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use super::prompt::GaugePolicy;
use super::types::{AlertLevel, Findings, InspectionMode, SealIntegrity};

/// Level plus the rules that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub alert_level: AlertLevel,
    pub reasons: Vec<String>,
}

impl Assessment {
    /// Reasons joined for display on a verdict.
    pub fn reasoning(&self) -> String {
        self.reasons.join("; ")
    }
}

// ── Keyword sets ────────────────────────────────────────────

/// Anomaly wording that indicates an unauthorized attachment or a part swap:
/// `(label, pattern)`. Patterns are matched on whole words of lowercased text.
static FOREIGN_ATTACHMENT_TERMS: &[(&str, &str)] = &[
    ("foreign", r"foreign"),
    ("unauthorized", r"unauthori[sz]ed"),
    ("hose", r"hoses?"),
    ("t-fitting", r"t[- ]?fittings?|tee[- ]?fittings?"),
    ("bypass", r"bypass(?:ed|es|ing)?"),
    ("siphon", r"siphon(?:ed|ing|s)?"),
    ("splice", r"splice[ds]?|splicing"),
    ("extra valve", r"(?:extra|additional|second) valves?"),
    ("attachment", r"attachments?"),
    ("substitution", r"substitut\w*"),
    ("replaced", r"replaced|replacement"),
    ("swapped", r"swapped"),
    ("different part", r"different (?:tire|tyre|rim|valve|seal)s?"),
    ("mismatch", r"mismatch(?:ed|es|ing)?"),
];

static FOREIGN_ATTACHMENT: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(
        FOREIGN_ATTACHMENT_TERMS
            .iter()
            .map(|(_, pattern)| format!(r"\b(?:{pattern})\b")),
    )
    .expect("static regex")
});

/// Sentence ends and contrastive conjunctions start a new clause.
static CLAUSE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.;!?\n]|\b(?:but|however|although|though|whereas|yet)\b")
        .expect("static regex")
});

/// Clause reports that something is absent ("no hose found").
static ABSENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:there (?:is|are|was|were) )?(?:no|none|nothing|without)\b")
        .expect("static regex")
});

/// Clause negates its verb ("was not replaced", "doesn't match").
static NEGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:not|never|cannot)\b|n['’]t\b").expect("static regex")
});

/// Phrases models use to say "nothing found".
static NO_ANOMALY_PHRASES: &[&str] = &[
    "",
    "none",
    "n/a",
    "na",
    "null",
    "nil",
    "no anomaly",
    "no anomalies",
    "no anomaly detected",
    "no anomalies detected",
    "no anomaly found",
    "no anomalies found",
    "nothing detected",
    "nothing found",
    "nothing abnormal",
];

static NUMERIC_READING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:[.,\s]\d+)*$").expect("static regex"));

// ── Rules ───────────────────────────────────────────────────

/// Classify findings for `mode`, keeping the reasons.
///
/// Total and deterministic: every combination of findings maps to exactly
/// one level, and the same input always maps to the same output.
pub fn assess(findings: &Findings, mode: InspectionMode) -> Assessment {
    let mut red = Vec::new();
    let mut yellow = Vec::new();

    if !findings.identity_confirmed {
        red.push("Asset identity NOT confirmed against reference".to_string());
    }

    match findings.seal_integrity {
        SealIntegrity::Broken => red.push("Security seal is BROKEN".to_string()),
        SealIntegrity::Suspect => {
            yellow.push("Security seal is SUSPECT (color/tone deviation)".to_string())
        }
        SealIntegrity::Intact => {}
    }

    match anomaly_class(&findings.anomaly_description) {
        AnomalyClass::None => {}
        AnomalyClass::ForeignAttachment(keyword) => red.push(format!(
            "Foreign attachment or part substitution reported ({keyword}): {}",
            findings.anomaly_description.trim()
        )),
        AnomalyClass::Unclassified => yellow.push(format!(
            "Unclassified anomaly requires manual review: {}",
            findings.anomaly_description.trim()
        )),
    }

    if findings.gauge_is_illegible() {
        yellow.push("Gauge reading is ILLEGIBLE".to_string());
    } else if mode.profile().gauge_policy == GaugePolicy::Required
        && !NUMERIC_READING.is_match(findings.gauge_reading.trim())
    {
        yellow.push(format!(
            "Gauge reading '{}' is not a numeric value",
            findings.gauge_reading.trim()
        ));
    }

    if !red.is_empty() {
        red.extend(yellow);
        Assessment {
            alert_level: AlertLevel::Red,
            reasons: red,
        }
    } else if !yellow.is_empty() {
        Assessment {
            alert_level: AlertLevel::Yellow,
            reasons: yellow,
        }
    } else {
        Assessment {
            alert_level: AlertLevel::Green,
            reasons: vec![green_reason(mode).to_string()],
        }
    }
}

/// Level only.
pub fn classify(findings: &Findings, mode: InspectionMode) -> AlertLevel {
    assess(findings, mode).alert_level
}

fn green_reason(mode: InspectionMode) -> &'static str {
    match mode.profile().gauge_policy {
        GaugePolicy::Required => "Identity confirmed, seal intact, gauge readable, no anomaly",
        GaugePolicy::NotApplicable => "Identity confirmed, seal intact, no anomaly",
    }
}

enum AnomalyClass {
    None,
    ForeignAttachment(&'static str),
    Unclassified,
}

/// Classify anomaly text clause by clause. A plain statement naming a
/// foreign part is RED. A clear "nothing found" clause is empty. Anything
/// negated or otherwise unrecognized is left for manual review.
fn anomaly_class(description: &str) -> AnomalyClass {
    let lowered = description.to_lowercase();
    let mut needs_review = false;

    for clause in CLAUSE_BREAK.split(&lowered).map(str::trim) {
        match clause_class(clause) {
            AnomalyClass::ForeignAttachment(label) => return AnomalyClass::ForeignAttachment(label),
            AnomalyClass::Unclassified => needs_review = true,
            AnomalyClass::None => {}
        }
    }

    if needs_review {
        AnomalyClass::Unclassified
    } else {
        AnomalyClass::None
    }
}

fn clause_class(clause: &str) -> AnomalyClass {
    if NO_ANOMALY_PHRASES.contains(&clause) {
        return AnomalyClass::None;
    }

    // "No hose, T-fitting, or bypass" cannot be told apart from
    // "No residue, hose attached" without parsing; both go to review.
    if ABSENCE.is_match(clause) {
        return if clause.contains(',') {
            AnomalyClass::Unclassified
        } else {
            AnomalyClass::None
        };
    }
    if NEGATION.is_match(clause) {
        return AnomalyClass::Unclassified;
    }

    match FOREIGN_ATTACHMENT.matches(clause).iter().next() {
        Some(index) => AnomalyClass::ForeignAttachment(FOREIGN_ATTACHMENT_TERMS[index].0),
        None => AnomalyClass::Unclassified,
    }
}
