use crate::capture::{PdfSettings, RasterSettings};
use crate::error::RenderError;
use crate::filter::ResourceFilter;
use crate::job::Viewport;
use crate::metrics::Metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

/// Network quietness requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIdle {
    /// Largest number of in-flight requests still considered idle
    pub max_inflight: usize,
    /// How long the count must stay at or below `max_inflight`
    #[serde(with = "crate::config::duration_ms")]
    pub idle_for: Duration,
}

/// Condition a load or navigation must reach before it counts as done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitCondition {
    pub load_event: bool,
    pub network_idle: Option<NetworkIdle>,
}

impl WaitCondition {
    pub const IDLE_WINDOW: Duration = Duration::from_millis(500);

    /// No outstanding network activity at all
    pub fn network_quiet() -> Self {
        Self {
            load_event: false,
            network_idle: Some(NetworkIdle {
                max_inflight: 0,
                idle_for: Self::IDLE_WINDOW,
            }),
        }
    }

    /// Load event only
    pub fn load() -> Self {
        Self {
            load_event: true,
            network_idle: None,
        }
    }

    /// Load event followed by a near-idle network
    pub fn load_and_idle(max_inflight: usize) -> Self {
        Self {
            load_event: true,
            network_idle: Some(NetworkIdle {
                max_inflight,
                idle_for: Self::IDLE_WINDOW,
            }),
        }
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.load_event, self.network_idle) {
            (true, Some(idle)) => {
                write!(f, "load + network idle (<= {} in flight)", idle.max_inflight)
            }
            (true, None) => write!(f, "load"),
            (false, Some(idle)) => write!(f, "network idle (<= {} in flight)", idle.max_inflight),
            (false, None) => write!(f, "nothing"),
        }
    }
}

/// Terminal state of a single image element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Loaded,
    Errored,
    /// The element went away while we were waiting on it
    Missing,
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Create a fresh, isolated context owned by exactly one job
    async fn create_context(&self, job_id: &str) -> Result<Box<dyn ExecutionContext>, RenderError>;
}

/// One isolated, single-use rendering environment
///
/// Implementations bound nothing themselves; every stage wraps these calls in
/// its own timeout.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    fn id(&self) -> &str;

    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError>;

    /// Abort or continue every later sub-resource request according to `filter`
    async fn install_request_filter(&self, filter: &ResourceFilter) -> Result<(), RenderError>;

    async fn load_content(&self, html: &str, wait: &WaitCondition) -> Result<(), RenderError>;

    async fn navigate(&self, url: &Url, wait: &WaitCondition) -> Result<(), RenderError>;

    /// Evaluate a boolean predicate inside the rendered page
    async fn evaluate_predicate(&self, script: &str) -> Result<bool, RenderError>;

    async fn image_count(&self) -> Result<usize, RenderError>;

    /// Resolve once image `index` reports completion or error
    async fn wait_for_image(&self, index: usize) -> Result<ImageState, RenderError>;

    async fn print_document(&self, settings: &PdfSettings) -> Result<Vec<u8>, RenderError>;

    async fn capture_raster(&self, settings: &RasterSettings) -> Result<Vec<u8>, RenderError>;

    /// Requests aborted by the installed filter so far
    fn blocked_requests(&self) -> usize;

    async fn close(&mut self) -> Result<(), RenderError>;
}

/// Scoped acquisition of one context for the lifetime of one job
///
/// Release happens once: through [`ContextLease::release`], or from `Drop`
/// when the owning future is cancelled first.
pub struct ContextLease {
    context: Option<Box<dyn ExecutionContext>>,
    job_id: String,
    metrics: Arc<Metrics>,
}

impl ContextLease {
    pub async fn acquire(
        engine: &dyn RenderEngine,
        job_id: &str,
        metrics: Arc<Metrics>,
    ) -> Result<Self, RenderError> {
        let context = engine.create_context(job_id).await?;
        metrics.record_context_acquired();
        debug!(
            "Acquired context {} on {} for job {}",
            context.id(),
            engine.name(),
            job_id
        );

        Ok(Self {
            context: Some(context),
            job_id: job_id.to_string(),
            metrics,
        })
    }

    pub fn context(&self) -> Result<&dyn ExecutionContext, RenderError> {
        self.context
            .as_deref()
            .ok_or_else(|| RenderError::Engine("execution context already released".to_string()))
    }

    /// Tear the context down, giving `close` at most `limit`
    ///
    /// Consumes the lease so it cannot run twice. The release is recorded even
    /// when teardown fails or times out; the context is dropped either way.
    pub async fn release(mut self, limit: Duration) -> Result<(), RenderError> {
        let Some(mut context) = self.context.take() else {
            return Ok(());
        };

        let result = match timeout(limit, context.close()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Teardown of context {} for job {} exceeded {:?}; abandoning it",
                    context.id(),
                    self.job_id,
                    limit
                );
                Err(RenderError::Teardown(format!("close timed out after {limit:?}")))
            }
        };
        self.metrics.record_context_released();
        debug!("Released context {} for job {}", context.id(), self.job_id);
        result
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        let Some(mut context) = self.context.take() else {
            return;
        };

        let metrics = self.metrics.clone();
        let job_id = std::mem::take(&mut self.job_id);
        warn!("Job {} dropped its context without release; tearing down", job_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = context.close().await {
                        warn!("Background teardown for job {} failed: {}", job_id, e);
                    }
                    metrics.record_context_released();
                });
            }
            Err(_) => {
                // Nothing can drive `close` here, so the context stays live.
                warn!(
                    "No runtime to tear down context {} for job {}; it is leaked",
                    context.id(),
                    job_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeEngine};

    #[tokio::test(start_paused = true)]
    async fn release_is_recorded_when_close_hangs() {
        let engine = FakeEngine::new(FakeBehavior {
            close_hangs: true,
            ..Default::default()
        });
        let metrics = Arc::new(Metrics::new());
        let lease = ContextLease::acquire(&engine, "job", metrics.clone()).await.unwrap();

        let err = lease.release(Duration::from_secs(2)).await.unwrap_err();

        assert!(matches!(err, RenderError::Teardown(_)));
        assert_eq!(metrics.snapshot().contexts_released, 1);
        assert_eq!(engine.state().released(), 0);
    }

    #[tokio::test]
    async fn dropped_lease_closes_on_the_runtime() {
        let engine = FakeEngine::new(FakeBehavior::default());
        let state = engine.state();
        let metrics = Arc::new(Metrics::new());
        let lease = ContextLease::acquire(&engine, "job", metrics.clone()).await.unwrap();

        drop(lease);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(state.released(), 1);
        assert_eq!(metrics.snapshot().contexts_live(), 0);
    }

    #[test]
    fn lease_dropped_outside_a_runtime_is_not_counted_as_released() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let engine = FakeEngine::new(FakeBehavior::default());
        let metrics = Arc::new(Metrics::new());
        let lease = runtime
            .block_on(ContextLease::acquire(&engine, "job", metrics.clone()))
            .unwrap();
        drop(runtime);

        drop(lease);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.contexts_acquired, 1);
        assert_eq!(snapshot.contexts_released, 0);
        assert_eq!(snapshot.contexts_live(), 1);
        assert_eq!(engine.state().released(), 0);
    }
}
