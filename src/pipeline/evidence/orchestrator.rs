use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::classify::assess;
use super::normalize::normalize_identifier;
use super::prompt::{
    build_comparison_prompt, build_identity_prompt, findings_schema, EVIDENCE_SYSTEM_PROMPT,
    IDENTITY_SYSTEM_PROMPT,
};
use super::types::{
    ComparisonRequest, EvidenceImage, IdentifierKind, IdentifierResult, ImageSet,
    InferenceRequest, InspectionMode, RawOutput, ResponseFormat, Verdict, VisionGateway,
};
use super::validation::validate_findings;
use super::EvidenceError;
use crate::config::{IdentifyFailureMode, PipelineOptions};
use crate::pipeline::diagnostic;

/// Runs evidence calls against a vision gateway:
/// prompt → gateway → validate → classify → verdict
///
/// Each call is one bounded gateway invocation. Nothing is cached or shared
/// between calls, so a pipeline can serve concurrent callers through `&self`.
pub struct EvidencePipeline {
    gateway: Arc<dyn VisionGateway>,
    options: PipelineOptions,
}

impl EvidencePipeline {
    pub fn new(gateway: Arc<dyn VisionGateway>, options: PipelineOptions) -> Self {
        Self { gateway, options }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn model_name(&self) -> &str {
        self.gateway.model_name()
    }

    // ──────────────────────────────────────────────
    // Identification
    // ──────────────────────────────────────────────

    /// Read a plate or trailer number from one image, using the default deadline.
    pub fn identify(
        &self,
        image: &EvidenceImage,
        kind: IdentifierKind,
    ) -> Result<IdentifierResult, EvidenceError> {
        self.identify_within(image, kind, self.options.deadline)
    }

    /// Read a plate or trailer number within `deadline`.
    ///
    /// `Ok(None)` means the model saw no readable identifier. Under
    /// `IdentifyFailureMode::SoftFail`, an unreachable or late model also
    /// yields `Ok(None)`; a malformed reply is always an error.
    pub fn identify_within(
        &self,
        image: &EvidenceImage,
        kind: IdentifierKind,
        deadline: Duration,
    ) -> Result<IdentifierResult, EvidenceError> {
        self.identify_unless_abandoned(image, kind, deadline, &AtomicBool::new(false))
    }

    /// `identify_within` for a caller that may stop waiting. Once
    /// `abandoned` is set, the outcome is not recorded as a result.
    pub(crate) fn identify_unless_abandoned(
        &self,
        image: &EvidenceImage,
        kind: IdentifierKind,
        deadline: Duration,
        abandoned: &AtomicBool,
    ) -> Result<IdentifierResult, EvidenceError> {
        let call_id = Uuid::new_v4();
        let _span = tracing::info_span!(
            "identify",
            call_id = %call_id,
            kind = %kind,
            model = %self.gateway.model_name(),
            image_bytes = image.encoded_len(),
        )
        .entered();
        let start = Instant::now();
        let dump = diagnostic::call_dump_dir(self.options.dump_dir.as_deref(), &call_id);

        let request = InferenceRequest {
            system: Some(IDENTITY_SYSTEM_PROMPT.to_string()),
            prompt: build_identity_prompt(kind),
            images: ImageSet::Single(image),
            format: ResponseFormat::Text,
        };
        if let Some(dir) = &dump {
            dump_request(dir, &request, "identify", kind.as_str(), self.model_name(), deadline);
        }

        let result = self
            .gateway
            .invoke(&request, deadline)
            .and_then(|raw| {
                if let Some(dir) = &dump {
                    diagnostic::dump_text(dir, "02-raw-output.txt", &raw.to_display_string());
                }
                identifier_from_output(raw)
            });

        let result = match result {
            Err(e) if e.is_inference_failure() => {
                self.soft_fail_identify(e, start.elapsed().as_millis())
            }
            other => other,
        };

        if abandoned.load(Ordering::Acquire) {
            log_abandoned(dump.as_deref(), &result, start);
            return result;
        }

        match &result {
            Ok(identifier) => {
                tracing::info!(
                    found = identifier.is_some(),
                    elapsed_ms = %start.elapsed().as_millis(),
                    "Identification complete"
                );
                if let Some(dir) = &dump {
                    diagnostic::dump_json(dir, "03-result.json", &json!({ "identifier": identifier }));
                }
            }
            Err(e) => self.log_failure(dump.as_deref(), e, start),
        }

        result
    }

    /// Apply the configured identify failure mode to an inference failure.
    pub(crate) fn soft_fail_identify(
        &self,
        error: EvidenceError,
        elapsed_ms: u128,
    ) -> Result<IdentifierResult, EvidenceError> {
        match self.options.identify_failure {
            IdentifyFailureMode::Propagate => Err(error),
            IdentifyFailureMode::SoftFail => {
                tracing::warn!(
                    error = %error,
                    kind = error.kind(),
                    elapsed_ms = %elapsed_ms,
                    "Identification failed, reporting no identifier (soft-fail)"
                );
                Ok(None)
            }
        }
    }

    // ──────────────────────────────────────────────
    // Comparison
    // ──────────────────────────────────────────────

    /// Compare a field capture against its baseline, using the default deadline.
    pub fn compare_evidence(
        &self,
        mode: InspectionMode,
        current: &EvidenceImage,
        reference: &EvidenceImage,
    ) -> Result<Verdict, EvidenceError> {
        self.compare_evidence_within(mode, current, reference, self.options.deadline)
    }

    pub fn compare_evidence_within(
        &self,
        mode: InspectionMode,
        current: &EvidenceImage,
        reference: &EvidenceImage,
        deadline: Duration,
    ) -> Result<Verdict, EvidenceError> {
        self.run_comparison(&ComparisonRequest::new(mode, current, reference), deadline)
    }

    /// Run one comparison. The alert level comes from `classify`, never from
    /// the model. Inference and schema failures surface as errors, never as
    /// a verdict.
    pub fn run_comparison(
        &self,
        request: &ComparisonRequest<'_>,
        deadline: Duration,
    ) -> Result<Verdict, EvidenceError> {
        self.run_comparison_unless_abandoned(request, deadline, &AtomicBool::new(false))
    }

    /// `run_comparison` for a caller that may stop waiting. Once `abandoned`
    /// is set, a late verdict is discarded instead of recorded.
    pub(crate) fn run_comparison_unless_abandoned(
        &self,
        request: &ComparisonRequest<'_>,
        deadline: Duration,
        abandoned: &AtomicBool,
    ) -> Result<Verdict, EvidenceError> {
        let call_id = Uuid::new_v4();
        let mode = request.mode;
        let _span = tracing::info_span!(
            "compare_evidence",
            call_id = %call_id,
            mode = %mode,
            model = %self.gateway.model_name(),
            current_bytes = request.current.encoded_len(),
            reference_bytes = request.reference.encoded_len(),
        )
        .entered();
        let start = Instant::now();
        let dump = diagnostic::call_dump_dir(self.options.dump_dir.as_deref(), &call_id);

        // Step 1: Build the mode-specific prompt and schema
        let inference = InferenceRequest {
            system: Some(EVIDENCE_SYSTEM_PROMPT.to_string()),
            prompt: build_comparison_prompt(mode),
            images: ImageSet::Pair {
                current: request.current,
                reference: request.reference,
            },
            format: ResponseFormat::Json(findings_schema(mode)),
        };
        if let Some(dir) = &dump {
            dump_request(dir, &inference, "compare", mode.as_str(), self.model_name(), deadline);
        }

        // Step 2: One bounded gateway call
        // Step 3: Strict validation (no defaults, no repair)
        // Step 4: Deterministic classification
        let result = self
            .gateway
            .invoke(&inference, deadline)
            .and_then(|raw| {
                if let Some(dir) = &dump {
                    diagnostic::dump_text(dir, "02-raw-output.txt", &raw.to_display_string());
                }
                validate_findings(&raw, mode)
            })
            .map(|findings| {
                let assessment = assess(&findings, mode);
                Verdict {
                    mode,
                    alert_level: assessment.alert_level,
                    reasoning: assessment.reasoning(),
                    findings,
                    model_used: self.gateway.model_name().to_string(),
                    evaluated_at: Utc::now(),
                }
            });

        if abandoned.load(Ordering::Acquire) {
            log_abandoned(dump.as_deref(), &result, start);
            return result;
        }

        match &result {
            Ok(verdict) => {
                if verdict.alert_level.requires_dispatch() {
                    tracing::warn!(
                        alert_level = %verdict.alert_level,
                        reasoning = %verdict.reasoning,
                        elapsed_ms = %start.elapsed().as_millis(),
                        "Evidence comparison raised a RED alert"
                    );
                } else {
                    tracing::info!(
                        alert_level = %verdict.alert_level,
                        elapsed_ms = %start.elapsed().as_millis(),
                        "Evidence comparison complete"
                    );
                }
                if let Some(dir) = &dump {
                    diagnostic::dump_json(dir, "03-result.json", verdict);
                }
            }
            Err(e) => self.log_failure(dump.as_deref(), e, start),
        }

        result
    }

    fn log_failure(&self, dump: Option<&Path>, error: &EvidenceError, start: Instant) {
        tracing::warn!(
            error = %error,
            kind = error.kind(),
            elapsed_ms = %start.elapsed().as_millis(),
            "Evidence call not evaluated"
        );
        if let Some(dir) = dump {
            diagnostic::dump_json(
                dir,
                "03-error.json",
                &json!({ "kind": error.kind(), "message": error.to_string() }),
            );
        }
    }
}

/// The caller already reported a timeout. Record that the late outcome was
/// dropped; no result or error file is written.
fn log_abandoned<T>(dump: Option<&Path>, result: &Result<T, EvidenceError>, start: Instant) {
    let outcome = match result {
        Ok(_) => "completed",
        Err(e) => e.kind(),
    };
    tracing::warn!(
        outcome,
        elapsed_ms = %start.elapsed().as_millis(),
        "Evidence call finished after the caller gave up; outcome discarded"
    );
    if let Some(dir) = dump {
        diagnostic::dump_json(
            dir,
            "03-abandoned.json",
            &json!({
                "abandoned": true,
                "outcome": outcome,
                "elapsedMs": u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        );
    }
}

/// Interpret identification output. Text and JSON strings go through the
/// normalizer; JSON null is "nothing found"; any other JSON is malformed.
fn identifier_from_output(raw: RawOutput) -> Result<IdentifierResult, EvidenceError> {
    match raw {
        RawOutput::Text(text) => Ok(normalize_identifier(&text)),
        RawOutput::Structured(serde_json::Value::String(text)) => Ok(normalize_identifier(&text)),
        RawOutput::Structured(serde_json::Value::Null) => Ok(None),
        RawOutput::Structured(other) => Err(EvidenceError::SchemaViolation(format!(
            "identification expects text, got {other}"
        ))),
    }
}

fn dump_request(
    dir: &Path,
    request: &InferenceRequest<'_>,
    operation: &str,
    subject: &str,
    model: &str,
    deadline: Duration,
) {
    let images: Vec<_> = request
        .images
        .images()
        .into_iter()
        .map(|image| json!({ "mimeType": image.mime_type(), "encodedLen": image.encoded_len() }))
        .collect();
    diagnostic::dump_json(
        dir,
        "00-request.json",
        &json!({
            "operation": operation,
            "subject": subject,
            "model": model,
            "deadlineMs": u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            "images": images,
            "jsonFormat": matches!(request.format, ResponseFormat::Json(_)),
        }),
    );
    diagnostic::dump_text(dir, "01-prompt.txt", &request.prompt);
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::pipeline::evidence::ollama::MockVisionGateway;
    use crate::pipeline::evidence::types::{AlertLevel, SealIntegrity};

    fn image(tag: &[u8]) -> EvidenceImage {
        EvidenceImage::from_bytes(tag, "image/jpeg").unwrap()
    }

    fn pipeline(mock: &Arc<MockVisionGateway>) -> EvidencePipeline {
        EvidencePipeline::new(mock.clone(), PipelineOptions::default())
    }

    fn clean_findings() -> Value {
        json!({
            "identityConfirmed": true,
            "sealIntegrity": "INTACT",
            "gaugeReading": "4231",
            "anomalyDescription": ""
        })
    }

    #[test]
    fn identify_normalizes_text_output() {
        let mock = Arc::new(MockVisionGateway::text("  pipa- 01 \n"));
        let id = pipeline(&mock)
            .identify(&image(b"plate"), IdentifierKind::LicensePlate)
            .unwrap();
        assert_eq!(id.unwrap().as_str(), "PIPA-01");

        let call = &mock.calls()[0];
        assert_eq!(call.image_count, 1);
        assert!(!call.json_format);
        assert_eq!(call.system.as_deref(), Some(IDENTITY_SYSTEM_PROMPT));
        assert!(call.prompt.contains("LICENSE PLATE"));
    }

    #[test]
    fn identify_null_means_not_found() {
        for reply in ["null", "NULL", "", "x"] {
            let mock = Arc::new(MockVisionGateway::text(reply));
            let id = pipeline(&mock)
                .identify(&image(b"plate"), IdentifierKind::TrailerNumber)
                .unwrap();
            assert!(id.is_none(), "{reply:?}");
        }
    }

    #[test]
    fn identify_structured_output() {
        let mock = Arc::new(MockVisionGateway::json(json!("trl 4471")));
        let id = pipeline(&mock)
            .identify(&image(b"trailer"), IdentifierKind::TrailerNumber)
            .unwrap();
        assert_eq!(id.unwrap().as_str(), "TRL-4471");

        let mock = Arc::new(MockVisionGateway::json(Value::Null));
        assert!(pipeline(&mock)
            .identify(&image(b"trailer"), IdentifierKind::TrailerNumber)
            .unwrap()
            .is_none());

        let mock = Arc::new(MockVisionGateway::json(json!({"plate": "ABC"})));
        let err = pipeline(&mock)
            .identify(&image(b"trailer"), IdentifierKind::TrailerNumber)
            .unwrap_err();
        assert!(matches!(err, EvidenceError::SchemaViolation(_)));
    }

    #[test]
    fn identify_propagates_unavailable_by_default() {
        let mock = Arc::new(MockVisionGateway::unavailable("connection refused"));
        let err = pipeline(&mock)
            .identify(&image(b"plate"), IdentifierKind::LicensePlate)
            .unwrap_err();
        assert!(matches!(err, EvidenceError::InferenceUnavailable(_)));
    }

    #[test]
    fn identify_soft_fail_reports_not_found() {
        let mock = Arc::new(MockVisionGateway::unavailable("connection refused"));
        let options =
            PipelineOptions::default().with_identify_failure(IdentifyFailureMode::SoftFail);
        let id = EvidencePipeline::new(mock, options)
            .identify(&image(b"plate"), IdentifierKind::LicensePlate)
            .unwrap();
        assert!(id.is_none());
    }

    #[test]
    fn soft_fail_does_not_hide_schema_violations() {
        let mock = Arc::new(MockVisionGateway::json(json!([1, 2])));
        let options =
            PipelineOptions::default().with_identify_failure(IdentifyFailureMode::SoftFail);
        let err = EvidencePipeline::new(mock, options)
            .identify(&image(b"plate"), IdentifierKind::LicensePlate)
            .unwrap_err();
        assert!(matches!(err, EvidenceError::SchemaViolation(_)));
    }

    #[test]
    fn identify_within_passes_deadline() {
        let mock = Arc::new(MockVisionGateway::text("ABC123"));
        pipeline(&mock)
            .identify_within(&image(b"p"), IdentifierKind::LicensePlate, Duration::from_secs(7))
            .unwrap();
        assert_eq!(mock.calls()[0].deadline, Duration::from_secs(7));
    }

    #[test]
    fn compare_sends_current_then_reference_with_schema() {
        let mock = Arc::new(MockVisionGateway::json(clean_findings()).with_model("llava:13b"));
        let verdict = pipeline(&mock)
            .compare_evidence(
                InspectionMode::FuelValveIntegrity,
                &image(b"current"),
                &image(b"reference"),
            )
            .unwrap();

        assert_eq!(verdict.alert_level, AlertLevel::Green);
        assert_eq!(verdict.mode, InspectionMode::FuelValveIntegrity);
        assert_eq!(verdict.model_used, "llava:13b");

        let call = &mock.calls()[0];
        assert_eq!(call.image_count, 2);
        assert!(call.json_format);
        assert_eq!(call.deadline, PipelineOptions::default().deadline);
        assert!(call.prompt.contains("Image 1 is the CURRENT"));
    }

    #[test]
    fn model_alert_level_is_ignored() {
        let mut findings = clean_findings();
        findings["sealIntegrity"] = json!("BROKEN");
        findings["alertLevel"] = json!("GREEN");
        let mock = Arc::new(MockVisionGateway::json(findings));
        let verdict = pipeline(&mock)
            .compare_evidence(
                InspectionMode::FuelValveIntegrity,
                &image(b"current"),
                &image(b"reference"),
            )
            .unwrap();
        assert_eq!(verdict.alert_level, AlertLevel::Red);
        assert_eq!(verdict.findings.seal_integrity, SealIntegrity::Broken);
    }

    #[test]
    fn compare_inference_failure_is_not_a_verdict() {
        let mock = Arc::new(MockVisionGateway::unavailable("503"));
        let options =
            PipelineOptions::default().with_identify_failure(IdentifyFailureMode::SoftFail);
        let err = EvidencePipeline::new(mock, options)
            .compare_evidence(InspectionMode::TireIdentity, &image(b"a"), &image(b"b"))
            .unwrap_err();
        assert!(matches!(err, EvidenceError::InferenceUnavailable(_)));
    }

    #[test]
    fn compare_timeout_surfaces_as_timeout() {
        let mock =
            Arc::new(MockVisionGateway::json(clean_findings()).with_latency(Duration::from_secs(5)));
        let err = pipeline(&mock)
            .compare_evidence_within(
                InspectionMode::TireIdentity,
                &image(b"a"),
                &image(b"b"),
                Duration::from_millis(30),
            )
            .unwrap_err();
        assert!(matches!(err, EvidenceError::InferenceTimeout { deadline_ms: 30 }));
    }

    #[test]
    fn dump_dir_receives_call_artifacts() {
        let base = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVisionGateway::json(clean_findings()));
        let options = PipelineOptions::default().with_dump_dir(base.path());
        EvidencePipeline::new(mock, options)
            .compare_evidence(
                InspectionMode::FuelValveIntegrity,
                &image(b"current"),
                &image(b"reference"),
            )
            .unwrap();

        let call_dirs: Vec<_> = std::fs::read_dir(base.path()).unwrap().collect();
        assert_eq!(call_dirs.len(), 1);
        let dir = call_dirs[0].as_ref().unwrap().path();
        for file in ["00-request.json", "01-prompt.txt", "02-raw-output.txt", "03-result.json"] {
            assert!(dir.join(file).is_file(), "{file}");
        }

        let request: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("00-request.json")).unwrap())
                .unwrap();
        assert_eq!(request["images"].as_array().unwrap().len(), 2);
        let dumped = std::fs::read_to_string(dir.join("00-request.json")).unwrap();
        assert!(!dumped.contains(image(b"current").base64()));
    }

    #[test]
    fn dump_records_errors() {
        let base = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVisionGateway::json(json!({"identityConfirmed": true})));
        let options = PipelineOptions::default().with_dump_dir(base.path());
        let _ = EvidencePipeline::new(mock, options).compare_evidence(
            InspectionMode::FuelValveIntegrity,
            &image(b"current"),
            &image(b"reference"),
        );

        let dir = std::fs::read_dir(base.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let error: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("03-error.json")).unwrap())
                .unwrap();
        assert_eq!(error["kind"], "SCHEMA_VIOLATION");
    }

    #[test]
    fn abandoned_call_leaves_no_result_file() {
        let base = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVisionGateway::json(clean_findings()));
        let options = PipelineOptions::default().with_dump_dir(base.path());
        let pipeline = EvidencePipeline::new(mock, options);
        let (current, reference) = (image(b"current"), image(b"reference"));
        let request =
            ComparisonRequest::new(InspectionMode::FuelValveIntegrity, &current, &reference);

        let abandoned = AtomicBool::new(true);
        pipeline
            .run_comparison_unless_abandoned(&request, Duration::from_secs(5), &abandoned)
            .unwrap();

        let dir = std::fs::read_dir(base.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert!(!dir.join("03-result.json").exists());
        assert!(!dir.join("03-error.json").exists());
        let marker: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("03-abandoned.json")).unwrap())
                .unwrap();
        assert_eq!(marker["abandoned"], true);
        assert_eq!(marker["outcome"], "completed");
    }

    #[test]
    fn abandoned_identify_failure_leaves_no_error_file() {
        let base = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockVisionGateway::unavailable("connection refused"));
        let options = PipelineOptions::default().with_dump_dir(base.path());
        let result = EvidencePipeline::new(mock, options).identify_unless_abandoned(
            &image(b"plate"),
            IdentifierKind::LicensePlate,
            Duration::from_secs(5),
            &AtomicBool::new(true),
        );
        assert!(matches!(result, Err(EvidenceError::InferenceUnavailable(_))));

        let dir = std::fs::read_dir(base.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        assert!(!dir.join("03-error.json").exists());
        assert!(dir.join("03-abandoned.json").is_file());
    }
}
