use crate::capture::{Artifact, CaptureEngine};
use crate::config::{Config, PipelinePreset};
use crate::engine::{ContextLease, RenderEngine};
use crate::error::{ClassifiedError, ErrorClassifier, RenderError};
use crate::events::{JobEvent, JobObserver, JobState, TracingObserver};
use crate::job::{JobKind, JobPlan, PlanInput, RenderJob};
use crate::metrics::Metrics;
use crate::navigation::NavigationController;
use crate::readiness::{ReadinessDetector, ReadinessReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub job_id: String,
    pub correlation_id: String,
    pub kind: JobKind,
    pub format: String,
    pub preset: PipelinePreset,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_size: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_format: Option<String>,
    pub readiness: ReadinessReport,
    pub blocked_requests: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// A produced artifact
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub bytes: Vec<u8>,
    pub size_bytes: usize,
    pub content_type: String,
    pub metadata: CaptureMetadata,
}

struct PipelineOutput {
    artifact: Artifact,
    readiness: ReadinessReport,
}

/// Emits events for one job
struct JobTracker<'a> {
    observer: &'a dyn JobObserver,
    job_id: String,
    correlation_id: String,
}

impl JobTracker<'_> {
    fn enter(&self, state: JobState) {
        self.observer.on_event(&JobEvent::Transition {
            job_id: self.job_id.clone(),
            correlation_id: self.correlation_id.clone(),
            state,
        });
    }

    fn degraded(&self, signal: &str, reason: &str) {
        self.observer.on_event(&JobEvent::ReadinessDegraded {
            job_id: self.job_id.clone(),
            correlation_id: self.correlation_id.clone(),
            signal: signal.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Runs one job end to end and releases its context before reporting
pub struct RequestCoordinator {
    engine: Arc<dyn RenderEngine>,
    config: Arc<Config>,
    observer: Arc<dyn JobObserver>,
    metrics: Arc<Metrics>,
    navigation: NavigationController,
    readiness: ReadinessDetector,
    capture: CaptureEngine,
    classifier: ErrorClassifier,
}

impl RequestCoordinator {
    pub fn new(engine: Arc<dyn RenderEngine>, config: Config) -> Self {
        let readiness = ReadinessDetector::new(&config.loader_heuristic);
        Self {
            engine,
            config: Arc::new(config),
            observer: Arc::new(TracingObserver),
            metrics: Arc::new(Metrics::new()),
            navigation: NavigationController,
            readiness,
            capture: CaptureEngine,
            classifier: ErrorClassifier,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub async fn execute(&self, job: RenderJob) -> Result<CaptureResult, ClassifiedError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "render_job",
            job_id = %job.id,
            kind = %job.kind(),
            correlation_id = %correlation_id
        );

        self.run(job, correlation_id).instrument(span).await
    }

    async fn run(
        &self,
        job: RenderJob,
        correlation_id: String,
    ) -> Result<CaptureResult, ClassifiedError> {
        let started = Instant::now();
        let tracker = JobTracker {
            observer: self.observer.as_ref(),
            job_id: job.id.clone(),
            correlation_id: correlation_id.clone(),
        };
        tracker.enter(JobState::Created);

        // Rejected jobs never touch the engine.
        let plan = match JobPlan::resolve(job, &self.config) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(&tracker, &e, started)),
        };

        // Acquisition and pipeline share one deadline; teardown has its own.
        let deadline = self.config.job_deadline();
        let deadline_at = Instant::now() + deadline;

        let acquire =
            ContextLease::acquire(self.engine.as_ref(), &plan.job_id, self.metrics.clone());
        let lease = match timeout_at(deadline_at, acquire).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(e)) => return Err(self.fail(&tracker, &e, started)),
            Err(_) => {
                warn!("Job deadline of {:?} elapsed while acquiring a context", deadline);
                let error = RenderError::DeadlineExceeded(deadline);
                return Err(self.fail(&tracker, &error, started));
            }
        };
        tracker.enter(JobState::ContextAcquired);

        let outcome = match timeout_at(deadline_at, self.pipeline(&lease, &plan, &tracker)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Job deadline of {:?} elapsed; cancelling", deadline);
                Err(RenderError::DeadlineExceeded(deadline))
            }
        };

        let blocked_requests = lease.context().map(|c| c.blocked_requests()).unwrap_or(0);
        self.metrics.record_blocked_requests(blocked_requests);

        if let Err(e) = lease.release(self.config.teardown_timeout()).await {
            // The artifact (or the original failure) stands either way.
            warn!("{}", e);
        }
        tracker.enter(JobState::ContextReleased);

        match outcome {
            Ok(output) => {
                let result =
                    self.build_result(&plan, output, correlation_id, blocked_requests, started);
                tracker.enter(JobState::Succeeded);
                self.metrics.record_job("succeeded", started.elapsed());
                info!(
                    "Job succeeded: {} bytes of {} in {}ms",
                    result.size_bytes, result.content_type, result.metadata.duration_ms
                );
                Ok(result)
            }
            Err(e) => Err(self.fail(&tracker, &e, started)),
        }
    }

    async fn pipeline(
        &self,
        lease: &ContextLease,
        plan: &JobPlan,
        tracker: &JobTracker<'_>,
    ) -> Result<PipelineOutput, RenderError> {
        let context = lease.context()?;

        match &plan.input {
            PlanInput::Document { content, .. } => {
                self.navigation
                    .load_content(context, content, &plan.navigation)
                    .await?;
                tracker.enter(JobState::ContentLoaded);
            }
            PlanInput::Capture { target, .. } => {
                self.navigation
                    .navigate(context, target, &plan.navigation)
                    .await?;
                tracker.enter(JobState::Navigated);
            }
        }

        let readiness = self.readiness.evaluate(context, &plan.readiness).await?;
        for (signal, reason) in readiness.degraded_signals() {
            self.metrics.record_readiness_degraded(signal);
            tracker.degraded(signal, reason);
        }
        tracker.enter(JobState::ReadinessEvaluated {
            degraded: readiness.degraded(),
        });

        let artifact = match &plan.input {
            PlanInput::Document { pdf, .. } => self.capture.document(context, pdf).await?,
            PlanInput::Capture { raster, .. } => self.capture.raster(context, raster).await?,
        };
        tracker.enter(JobState::Captured);

        Ok(PipelineOutput {
            artifact,
            readiness,
        })
    }

    fn build_result(
        &self,
        plan: &JobPlan,
        output: PipelineOutput,
        correlation_id: String,
        blocked_requests: usize,
        started: Instant,
    ) -> CaptureResult {
        let (format, viewport, page_format) = match &plan.input {
            PlanInput::Document { pdf, .. } => {
                ("pdf".to_string(), None, Some(pdf.page_format.to_string()))
            }
            PlanInput::Capture {
                viewport, raster, ..
            } => (
                raster.format.to_string(),
                Some(Size {
                    width: viewport.width,
                    height: viewport.height,
                }),
                None,
            ),
        };

        let PipelineOutput {
            artifact,
            readiness,
        } = output;

        CaptureResult {
            size_bytes: artifact.size_bytes(),
            content_type: artifact.content_type.to_string(),
            metadata: CaptureMetadata {
                job_id: plan.job_id.clone(),
                correlation_id,
                kind: plan.kind,
                format,
                preset: plan.preset,
                viewport,
                pixel_size: artifact
                    .pixel_size
                    .map(|(width, height)| Size { width, height }),
                page_format,
                readiness,
                blocked_requests,
                duration_ms: started.elapsed().as_millis() as u64,
                completed_at: Utc::now(),
            },
            bytes: artifact.bytes,
        }
    }

    fn fail(
        &self,
        tracker: &JobTracker<'_>,
        error: &RenderError,
        started: Instant,
    ) -> ClassifiedError {
        let classified = self.classifier.classify(error);
        warn!(
            "Job failed with {} (correlation {}): {}",
            classified.kind, tracker.correlation_id, classified.message
        );
        tracker.enter(JobState::Failed {
            kind: classified.kind,
        });
        self.metrics.record_job(classified.kind.as_str(), started.elapsed());
        classified
    }
}

/// Response envelope for document jobs
///
/// The bytes are not serialized; transports encode them however they like.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub success: bool,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CaptureMetadata>,
}

impl From<Result<CaptureResult, ClassifiedError>> for DocumentResponse {
    fn from(result: Result<CaptureResult, ClassifiedError>) -> Self {
        match result {
            Ok(result) => Self {
                success: true,
                size_bytes: Some(result.size_bytes),
                bytes: result.bytes,
                error: None,
                metadata: Some(result.metadata),
            },
            Err(error) => Self {
                success: false,
                bytes: Vec::new(),
                size_bytes: None,
                error: Some(error),
                metadata: None,
            },
        }
    }
}

/// Response envelope for capture jobs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResponse {
    pub success: bool,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ClassifiedError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CaptureMetadata>,
}

impl From<Result<CaptureResult, ClassifiedError>> for CaptureResponse {
    fn from(result: Result<CaptureResult, ClassifiedError>) -> Self {
        match result {
            Ok(result) => Self {
                success: true,
                size_bytes: Some(result.size_bytes),
                format: Some(result.metadata.format.clone()),
                viewport: result.metadata.viewport,
                bytes: result.bytes,
                error: None,
                metadata: Some(result.metadata),
            },
            Err(error) => Self {
                success: false,
                bytes: Vec::new(),
                size_bytes: None,
                format: None,
                viewport: None,
                error: Some(error),
                metadata: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::MockJobObserver;
    use crate::testing::{FakeBehavior, FakeEngine};
    use mockall::Sequence;

    fn coordinator(engine: Arc<FakeEngine>) -> RequestCoordinator {
        RequestCoordinator::new(engine, Config::default())
    }

    fn transition(event: &JobEvent, expected: JobState) -> bool {
        event.state() == Some(&expected)
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_release_before_success() {
        let mut observer = MockJobObserver::new();
        let mut seq = Sequence::new();
        for expected in [
            JobState::Created,
            JobState::ContextAcquired,
            JobState::ContentLoaded,
            JobState::ReadinessEvaluated { degraded: false },
            JobState::Captured,
            JobState::ContextReleased,
            JobState::Succeeded,
        ] {
            observer
                .expect_on_event()
                .withf(move |event| transition(event, expected.clone()))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }

        let engine = Arc::new(FakeEngine::new(FakeBehavior::default()));
        let coordinator = coordinator(engine.clone()).with_observer(Arc::new(observer));

        let result = coordinator
            .execute(RenderJob::document("<html><body>Hi</body></html>"))
            .await
            .unwrap();

        assert_eq!(result.content_type, "application/pdf");
        assert_eq!(result.metadata.page_format.as_deref(), Some("A4"));
    }

    #[tokio::test]
    async fn validation_failure_emits_created_then_failed() {
        let mut observer = MockJobObserver::new();
        let mut seq = Sequence::new();
        observer
            .expect_on_event()
            .withf(|event| transition(event, JobState::Created))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        observer
            .expect_on_event()
            .withf(|event| {
                transition(
                    event,
                    JobState::Failed {
                        kind: ErrorKind::ValidationError,
                    },
                )
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let engine = Arc::new(FakeEngine::new(FakeBehavior::default()));
        let coordinator = coordinator(engine.clone()).with_observer(Arc::new(observer));
        let job: RenderJob = serde_json::from_str(r#"{"kind":"capture"}"#).unwrap();

        let err = coordinator.execute(job).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert_eq!(engine.state().created(), 0);
    }

    #[tokio::test]
    async fn context_creation_failure_is_reported_without_release() {
        let engine = Arc::new(FakeEngine::new(FakeBehavior {
            create_error: Some("browser process exited".to_string()),
            ..Default::default()
        }));
        let coordinator = coordinator(engine.clone());

        let err = coordinator
            .execute(RenderJob::capture("https://example.com"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::InternalError);
        assert_eq!(engine.state().created(), 0);
        assert_eq!(engine.state().released(), 0);
        assert_eq!(coordinator.metrics().snapshot().contexts_acquired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failure_still_releases() {
        let engine = Arc::new(FakeEngine::new(FakeBehavior {
            capture_error: Some("Page.captureScreenshot failed".to_string()),
            ..Default::default()
        }));
        let coordinator = coordinator(engine.clone());

        let err = coordinator
            .execute(RenderJob::capture("https://example.com"))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::CaptureFailure);
        assert_eq!(engine.state().created(), 1);
        assert_eq!(engine.state().released(), 1);
    }

    #[test]
    fn responses_carry_classified_errors() {
        let response =
            CaptureResponse::from(Err(ClassifiedError::validation("target is required")));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "ValidationError");
        assert!(json.get("bytes").is_none());
    }
}
