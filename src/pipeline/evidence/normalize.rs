// Cleanup rules for OCR'd plate and trailer identifiers.

use std::sync::LazyLock;

use regex::Regex;

use super::types::Identifier;

/// Shortest identifier worth reporting (alphanumeric characters).
pub const MIN_IDENTIFIER_LEN: usize = 3;

/// What the model is told to answer when no identifier is visible.
const NULL_LITERAL: &str = "NULL";

static SEPARATOR_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-_./\\|:]+").expect("static regex"));

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Z0-9-]").expect("static regex"));

static HYPHEN_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("static regex"));

/// Normalize raw OCR text into an identifier, or `None` if nothing usable remains.
///
/// Only the first non-blank line is considered. The line is uppercased, runs
/// of separators collapse to a single hyphen, anything outside `A-Z`, `0-9`
/// and `-` is dropped, and leading/trailing hyphens are trimmed. The literal
/// `null` (any case) and results with fewer than three alphanumerics map to
/// `None`.
pub fn normalize_identifier(raw: &str) -> Option<Identifier> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;

    let upper = line.to_uppercase();
    let separated = SEPARATOR_RUN.replace_all(&upper, "-");
    let stripped = DISALLOWED.replace_all(&separated, "");
    let collapsed = HYPHEN_RUN.replace_all(&stripped, "-");
    let cleaned = collapsed.trim_matches('-');

    if cleaned.is_empty() || cleaned == NULL_LITERAL {
        return None;
    }

    let meaningful = cleaned.chars().filter(char::is_ascii_alphanumeric).count();
    if meaningful < MIN_IDENTIFIER_LEN {
        return None;
    }

    Some(Identifier::new_unchecked(cleaned.to_string()))
}
