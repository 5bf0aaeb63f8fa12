//! Per-call diagnostic dump: writes what was sent to and received from the
//! vision model, so a disputed verdict can be audited afterwards.
//!
//! **Activation**: only when the caller sets `PipelineOptions::dump_dir`.
//! The library does not read environment variables; the CLI maps
//! `EVIDENCE_DUMP_DIR` onto that option.
//!
//! **Output structure**:
//! ```text
//! {dump_dir}/{call_id}/
//!   00-request.json
//!   01-prompt.txt
//!   02-raw-output.txt
//!   03-result.json        (verdict or identifier)
//!   03-error.json         (on failure instead)
//!   03-abandoned.json     (caller timed out first; outcome discarded)
//! ```
//!
//! Image payloads are never written.

use std::path::{Path, PathBuf};

use uuid::Uuid;

// ──────────────────────────────────────────────
// Dump directory resolution
// ──────────────────────────────────────────────

/// Returns the dump directory for one call, or `None` if dumping is off.
///
/// Creates the directory tree. Returns `None` (with a warning) if that
/// fails; a dump problem never fails the call itself.
pub fn call_dump_dir(base: Option<&Path>, call_id: &Uuid) -> Option<PathBuf> {
    let dir = base?.join(call_id.to_string());

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(
            path = %dir.display(),
            error = %e,
            "Diagnostic dump: failed to create directory"
        );
        return None;
    }

    Some(dir)
}

// ──────────────────────────────────────────────
// Dump writers
// ──────────────────────────────────────────────

/// Write a JSON artifact (any serde-serializable value). Never panics.
pub fn dump_json<T: serde::Serialize>(dir: &Path, filename: &str, value: &T) {
    let path = dir.join(filename);
    match serde_json::to_string_pretty(value) {
        Ok(json) => match std::fs::write(&path, json.as_bytes()) {
            Ok(()) => tracing::debug!(
                path = %path.display(),
                size = json.len(),
                "Diagnostic dump: JSON written"
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Diagnostic dump: failed to write JSON"
            ),
        },
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Diagnostic dump: failed to serialize JSON"
        ),
    }
}

/// Write a text artifact (prompt, raw model output). Never panics.
pub fn dump_text(dir: &Path, filename: &str, text: &str) {
    let path = dir.join(filename);
    match std::fs::write(&path, text.as_bytes()) {
        Ok(()) => tracing::debug!(
            path = %path.display(),
            size = text.len(),
            "Diagnostic dump: text written"
        ),
        Err(e) => tracing::warn!(
            path = %path.display(),
            error = %e,
            "Diagnostic dump: failed to write text"
        ),
    }
}
