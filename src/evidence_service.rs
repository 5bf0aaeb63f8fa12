//! Async front door for the evidence pipeline.
//!
//! The pipeline and its gateway are blocking. Each call here runs on the
//! blocking pool and is raced against its deadline, so an async caller gets
//! `InferenceTimeout` on time even if a gateway overruns its own budget.
//! A call that loses the race is abandoned; its result is dropped and no
//! verdict is produced. The blocking task is told it was abandoned, so it
//! does not record a late result in the diagnostic dump either.
//!
//! Build services with [`EvidenceService::connect`] from async code: the
//! blocking HTTP client must not be constructed on a runtime thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{GatewayConfig, PipelineOptions};
use crate::pipeline::evidence::{
    ComparisonRequest, EvidenceError, EvidenceImage, EvidencePipeline, IdentifierKind,
    IdentifierResult, InspectionMode, OllamaVisionGateway, RetryingGateway, Verdict,
    VisionGateway,
};

/// Slack given to the blocking call beyond its deadline before the service
/// reports a timeout itself.
pub const DEADLINE_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct EvidenceService {
    pipeline: Arc<EvidencePipeline>,
}

impl EvidenceService {
    pub fn new(pipeline: EvidencePipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// Validate `config` and build an Ollama-backed service.
    pub async fn connect(
        config: GatewayConfig,
        options: PipelineOptions,
    ) -> Result<Self, EvidenceError> {
        Self::connect_with_retry(config, 1, options).await
    }

    /// Like [`connect`](Self::connect), retrying connection failures up to
    /// `max_attempts` times within each call's deadline.
    pub async fn connect_with_retry(
        config: GatewayConfig,
        max_attempts: u32,
        options: PipelineOptions,
    ) -> Result<Self, EvidenceError> {
        let gateway = tokio::task::spawn_blocking(
            move || -> Result<Arc<dyn VisionGateway>, EvidenceError> {
                let gateway: Arc<dyn VisionGateway> = Arc::new(OllamaVisionGateway::new(&config)?);
                if max_attempts > 1 {
                    return Ok(Arc::new(
                        RetryingGateway::new(gateway).with_max_attempts(max_attempts),
                    ));
                }
                Ok(gateway)
            },
        )
        .await
        .map_err(|e| EvidenceError::Config(format!("gateway construction failed: {e}")))??;

        Ok(Self::new(EvidencePipeline::new(gateway, options)))
    }

    pub fn pipeline(&self) -> &EvidencePipeline {
        &self.pipeline
    }

    pub async fn identify(
        &self,
        image: EvidenceImage,
        kind: IdentifierKind,
    ) -> Result<IdentifierResult, EvidenceError> {
        let deadline = self.pipeline.options().deadline;
        self.identify_within(image, kind, deadline).await
    }

    pub async fn identify_within(
        &self,
        image: EvidenceImage,
        kind: IdentifierKind,
        deadline: Duration,
    ) -> Result<IdentifierResult, EvidenceError> {
        let start = Instant::now();
        let result = self
            .run_with_deadline(deadline, move |pipeline, abandoned| {
                pipeline.identify_unless_abandoned(&image, kind, deadline, abandoned)
            })
            .await;

        // The pipeline already applied the failure mode to its own errors;
        // this covers timeouts raised here.
        match result {
            Err(e) if e.is_inference_failure() => self
                .pipeline
                .soft_fail_identify(e, start.elapsed().as_millis()),
            other => other,
        }
    }

    pub async fn compare_evidence(
        &self,
        mode: InspectionMode,
        current: EvidenceImage,
        reference: EvidenceImage,
    ) -> Result<Verdict, EvidenceError> {
        let deadline = self.pipeline.options().deadline;
        self.compare_evidence_within(mode, current, reference, deadline)
            .await
    }

    pub async fn compare_evidence_within(
        &self,
        mode: InspectionMode,
        current: EvidenceImage,
        reference: EvidenceImage,
        deadline: Duration,
    ) -> Result<Verdict, EvidenceError> {
        self.run_with_deadline(deadline, move |pipeline, abandoned| {
            let request = ComparisonRequest::new(mode, &current, &reference);
            pipeline.run_comparison_unless_abandoned(&request, deadline, abandoned)
        })
        .await
    }

    async fn run_with_deadline<T, F>(&self, deadline: Duration, call: F) -> Result<T, EvidenceError>
    where
        T: Send + 'static,
        F: FnOnce(&EvidencePipeline, &AtomicBool) -> Result<T, EvidenceError> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        let abandoned = Arc::new(AtomicBool::new(false));
        let handle = {
            let abandoned = Arc::clone(&abandoned);
            tokio::task::spawn_blocking(move || call(&pipeline, &abandoned))
        };

        match tokio::time::timeout(deadline + DEADLINE_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "Evidence task failed");
                Err(EvidenceError::InferenceUnavailable(format!(
                    "inference task failed: {join_error}"
                )))
            }
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                tracing::warn!(
                    deadline_ms = %deadline.as_millis(),
                    "Evidence call abandoned after deadline"
                );
                Err(EvidenceError::timeout(deadline))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{IdentifyFailureMode, PipelineOptions};
    use crate::pipeline::evidence::{
        AlertLevel, InferenceRequest, MockVisionGateway, RawOutput, VisionGateway,
    };

    /// Ignores its deadline entirely.
    struct StubbornGateway;

    impl VisionGateway for StubbornGateway {
        fn invoke(
            &self,
            _request: &InferenceRequest<'_>,
            _deadline: Duration,
        ) -> Result<RawOutput, EvidenceError> {
            std::thread::sleep(Duration::from_secs(1));
            Ok(RawOutput::Text("TOO-LATE".into()))
        }

        fn model_name(&self) -> &str {
            "stubborn"
        }
    }

    /// Slow enough to be abandoned, then answers with a clean verdict.
    struct LateGateway;

    impl VisionGateway for LateGateway {
        fn invoke(
            &self,
            _request: &InferenceRequest<'_>,
            _deadline: Duration,
        ) -> Result<RawOutput, EvidenceError> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(RawOutput::Structured(json!({
                "identityConfirmed": true,
                "sealIntegrity": "INTACT",
                "gaugeReading": "4231",
                "anomalyDescription": ""
            })))
        }

        fn model_name(&self) -> &str {
            "late"
        }
    }

    /// Panics inside the blocking call.
    struct PanickingGateway;

    impl VisionGateway for PanickingGateway {
        fn invoke(
            &self,
            _request: &InferenceRequest<'_>,
            _deadline: Duration,
        ) -> Result<RawOutput, EvidenceError> {
            panic!("gateway bug");
        }

        fn model_name(&self) -> &str {
            "panicking"
        }
    }

    fn capture(tag: &str) -> EvidenceImage {
        EvidenceImage::from_bytes(tag.as_bytes(), "image/png").unwrap()
    }

    fn service(gateway: Arc<dyn VisionGateway>, options: PipelineOptions) -> EvidenceService {
        EvidenceService::new(EvidencePipeline::new(gateway, options))
    }

    #[tokio::test]
    async fn compare_returns_verdict() {
        let gateway = Arc::new(MockVisionGateway::json(json!({
            "identityConfirmed": false,
            "sealIntegrity": "INTACT",
            "gaugeReading": "N/A",
            "anomalyDescription": ""
        })));
        let verdict = service(gateway, PipelineOptions::default())
            .compare_evidence(InspectionMode::TireIdentity, capture("a"), capture("b"))
            .await
            .unwrap();
        assert_eq!(verdict.alert_level, AlertLevel::Red);
    }

    #[tokio::test]
    async fn identify_returns_identifier() {
        let gateway = Arc::new(MockVisionGateway::text("trl-0042"));
        let id = service(gateway, PipelineOptions::default())
            .identify(capture("trailer"), IdentifierKind::TrailerNumber)
            .await
            .unwrap();
        assert_eq!(id.unwrap().as_str(), "TRL-0042");
    }

    #[tokio::test]
    async fn overrunning_gateway_times_out_on_schedule() {
        let svc = service(Arc::new(StubbornGateway), PipelineOptions::default());
        let start = Instant::now();
        let err = svc
            .compare_evidence_within(
                InspectionMode::FuelValveIntegrity,
                capture("a"),
                capture("b"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EvidenceError::InferenceTimeout { deadline_ms: 100 }));
        assert!(start.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn overrun_identify_honors_soft_fail() {
        let options =
            PipelineOptions::default().with_identify_failure(IdentifyFailureMode::SoftFail);
        let svc = service(Arc::new(StubbornGateway), options);
        let id = svc
            .identify_within(
                capture("plate"),
                IdentifierKind::LicensePlate,
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn panicking_gateway_is_unavailable() {
        let svc = service(Arc::new(PanickingGateway), PipelineOptions::default());
        let err = svc
            .compare_evidence(InspectionMode::TireIdentity, capture("a"), capture("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, EvidenceError::InferenceUnavailable(_)));
    }

    #[tokio::test]
    async fn concurrent_requests_complete_independently() {
        let gateway = Arc::new(MockVisionGateway::text("abc-123"));
        let svc = service(gateway.clone(), PipelineOptions::default());

        let mut tasks = Vec::new();
        for i in 0..6 {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                svc.identify(capture(&format!("plate-{i}")), IdentifierKind::LicensePlate)
                    .await
            }));
        }
        for task in tasks {
            let id = task.await.unwrap().unwrap();
            assert_eq!(id.unwrap().as_str(), "ABC-123");
        }
        assert_eq!(gateway.call_count(), 6);
    }

    #[tokio::test]
    async fn connect_builds_gateway_from_async_context() {
        let svc = EvidenceService::connect(GatewayConfig::default(), PipelineOptions::default())
            .await
            .unwrap();
        assert_eq!(svc.pipeline().model_name(), crate::config::DEFAULT_VISION_MODEL);

        let retrying = EvidenceService::connect_with_retry(
            GatewayConfig::default(),
            3,
            PipelineOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(retrying.pipeline().model_name(), crate::config::DEFAULT_VISION_MODEL);
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let config = GatewayConfig {
            base_url: "http://10.1.2.3:11434".into(),
            local_only: true,
            ..GatewayConfig::default()
        };
        let err = EvidenceService::connect(config, PipelineOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EvidenceError::Config(_)));
    }

    #[tokio::test]
    async fn abandoned_call_does_not_dump_late_result() {
        let base = tempfile::tempdir().unwrap();
        let options = PipelineOptions::default().with_dump_dir(base.path());
        let svc = service(Arc::new(LateGateway), options);

        let err = svc
            .compare_evidence_within(
                InspectionMode::FuelValveIntegrity,
                capture("a"),
                capture("b"),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(err.is_inference_failure());

        // The blocking task keeps running after the timeout; wait for it to finish.
        let mut marker = None;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let found = std::fs::read_dir(base.path())
                .unwrap()
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .find(|dir| dir.join("03-abandoned.json").is_file());
            if found.is_some() {
                marker = found;
                break;
            }
        }
        let dir = marker.expect("late call should leave an abandoned marker");
        assert!(dir.join("02-raw-output.txt").is_file());
        assert!(!dir.join("03-result.json").exists());
    }
}
