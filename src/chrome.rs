use crate::capture::{OutputFormat, PdfSettings, RasterSettings};
use crate::config::{browser_config, Config};
use crate::engine::{ExecutionContext, ImageState, NetworkIdle, RenderEngine, WaitCondition};
use crate::error::RenderError;
use crate::filter::{FilterDecision, FilterStats, ResourceFilter, ResourceType};
use crate::job::Viewport;
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch;
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use dashmap::DashSet;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One browser process serving every job
///
/// Each job gets its own CDP browser context (separate cookies, storage and
/// cache) with a single page in it. The context is disposed on release.
pub struct ChromeEngine {
    /// CDP calls only need shared access; `close` at shutdown is exclusive.
    browser: Arc<RwLock<Browser>>,
    handler: JoinHandle<()>,
}

impl ChromeEngine {
    pub async fn launch(config: &Config) -> Result<Self, RenderError> {
        let (browser, mut handler) = Browser::launch(browser_config(config)?)
            .await
            .map_err(|e| RenderError::Engine(format!("Failed to launch browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {}", e);
                }
            }
        });

        info!("Browser launched");
        Ok(Self {
            browser: Arc::new(RwLock::new(browser)),
            handler,
        })
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.browser.write().await.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        self.handler.abort();
        info!("Browser shut down");
    }
}

#[async_trait]
impl RenderEngine for ChromeEngine {
    fn name(&self) -> &str {
        "chrome"
    }

    async fn create_context(&self, job_id: &str) -> Result<Box<dyn ExecutionContext>, RenderError> {
        let (context_id, page) = {
            let browser = self.browser.read().await;

            let context_id = browser
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(|e| RenderError::Engine(format!("Failed to create browser context: {e}")))?
                .result
                .browser_context_id;

            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(RenderError::Engine)?;

            match browser.new_page(target).await {
                Ok(page) => (context_id, page),
                Err(e) => {
                    let _ = browser
                        .execute(DisposeBrowserContextParams::new(context_id))
                        .await;
                    return Err(RenderError::Engine(format!("Failed to create page: {e}")));
                }
            }
        };

        let mut context = ChromeContext {
            id: format!("{}:{}", context_id.inner(), job_id),
            browser: self.browser.clone(),
            context_id: Some(context_id),
            page: Some(page),
            in_flight: Arc::new(DashSet::new()),
            stats: Arc::new(FilterStats::default()),
            tasks: StdMutex::new(Vec::new()),
        };

        // Teardown the half-built context if tracking cannot start.
        if let Err(e) = context.start_network_tracker().await {
            let _ = context.close().await;
            return Err(e);
        }

        Ok(Box::new(context))
    }
}

pub struct ChromeContext {
    id: String,
    browser: Arc<RwLock<Browser>>,
    context_id: Option<BrowserContextId>,
    page: Option<Page>,
    in_flight: Arc<DashSet<String>>,
    stats: Arc<FilterStats>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChromeContext {
    fn page(&self) -> Result<&Page, RenderError> {
        self.page
            .as_ref()
            .ok_or_else(|| RenderError::Engine("page already closed".to_string()))
    }

    fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => task.abort(),
        }
    }

    async fn start_network_tracker(&self) -> Result<(), RenderError> {
        let page = self.page()?;
        let subscribe = |e: chromiumoxide::error::CdpError| {
            RenderError::Engine(format!("Failed to subscribe to network events: {e}"))
        };

        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| RenderError::Engine(format!("Failed to enable network events: {e}")))?;

        let mut will_be_sent = page
            .event_listener::<network::EventRequestWillBeSent>()
            .await
            .map_err(subscribe)?;
        let mut finished = page
            .event_listener::<network::EventLoadingFinished>()
            .await
            .map_err(subscribe)?;
        let mut failed = page
            .event_listener::<network::EventLoadingFailed>()
            .await
            .map_err(subscribe)?;

        // Redirects reuse the request id, so in-flight is a set, not a counter.
        let in_flight = self.in_flight.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = will_be_sent.next().await {
                in_flight.insert(event.request_id.inner().clone());
            }
        }));

        let in_flight = self.in_flight.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = finished.next().await {
                in_flight.remove(event.request_id.inner());
            }
        }));

        let in_flight = self.in_flight.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = failed.next().await {
                in_flight.remove(event.request_id.inner());
            }
        }));

        Ok(())
    }

    async fn await_condition(&self, wait: &WaitCondition) {
        if let Some(idle) = wait.network_idle {
            wait_for_network_idle(&self.in_flight, idle).await;
        }
    }

    async fn evaluate<T: DeserializeOwned>(&self, script: &str) -> Result<T, RenderError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(RenderError::Engine)?;

        self.page()?
            .evaluate_expression(params)
            .await
            .map_err(|e| RenderError::Engine(format!("Evaluation failed: {e}")))?
            .into_value::<T>()
            .map_err(|e| RenderError::Engine(format!("Unexpected evaluation result: {e}")))
    }
}

fn resource_type(resource_type: &network::ResourceType) -> ResourceType {
    ResourceType::parse(&format!("{resource_type:?}")).unwrap_or(ResourceType::Other)
}

fn image_wait_script(index: usize) -> String {
    format!(
        r#"new Promise((resolve) => {{
  const img = document.images[{index}];
  if (!img) return resolve('missing');
  if (img.complete) return resolve(img.naturalWidth > 0 ? 'loaded' : 'errored');
  img.addEventListener('load', () => resolve('loaded'), {{ once: true }});
  img.addEventListener('error', () => resolve('errored'), {{ once: true }});
}})"#
    )
}

#[async_trait]
impl ExecutionContext for ChromeContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(RenderError::Engine)?;

        self.page()?
            .execute(params)
            .await
            .map_err(|e| RenderError::Engine(format!("Failed to set viewport: {e}")))?;
        Ok(())
    }

    async fn install_request_filter(&self, filter: &ResourceFilter) -> Result<(), RenderError> {
        let page = self.page()?;

        // Listen before enabling so no paused request is missed.
        let mut paused = page
            .event_listener::<fetch::EventRequestPaused>()
            .await
            .map_err(|e| {
                RenderError::Engine(format!("Failed to listen for paused requests: {e}"))
            })?;

        page.execute(fetch::EnableParams {
            patterns: Some(vec![fetch::RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: None,
                request_stage: Some(fetch::RequestStage::Request),
            }]),
            handle_auth_requests: Some(false),
        })
        .await
        .map_err(|e| RenderError::Engine(format!("Failed to enable request interception: {e}")))?;

        let filter = filter.clone();
        let stats = self.stats.clone();
        let page = page.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let decision = filter.decide(resource_type(&event.resource_type));
                stats.record(decision);

                let result = match decision {
                    FilterDecision::Abort => page
                        .execute(fetch::FailRequestParams {
                            request_id: event.request_id.clone(),
                            error_reason: network::ErrorReason::BlockedByClient,
                        })
                        .await
                        .map(|_| ()),
                    FilterDecision::Continue => page
                        .execute(fetch::ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ()),
                };

                if let Err(e) = result {
                    debug!("Failed to resolve paused request {}: {}", event.request.url, e);
                }
            }
        }));

        Ok(())
    }

    async fn load_content(&self, html: &str, wait: &WaitCondition) -> Result<(), RenderError> {
        self.page()?
            .set_content(html)
            .await
            .map_err(|e| RenderError::Navigation(format!("Failed to load content: {e}")))?;

        self.await_condition(wait).await;
        Ok(())
    }

    async fn navigate(&self, url: &Url, wait: &WaitCondition) -> Result<(), RenderError> {
        // goto resolves once the frame has loaded.
        self.page()?
            .goto(url.as_str())
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        self.await_condition(wait).await;
        Ok(())
    }

    async fn evaluate_predicate(&self, script: &str) -> Result<bool, RenderError> {
        self.evaluate::<bool>(script).await
    }

    async fn image_count(&self) -> Result<usize, RenderError> {
        self.evaluate::<usize>("document.images.length").await
    }

    async fn wait_for_image(&self, index: usize) -> Result<ImageState, RenderError> {
        let state: String = self.evaluate(&image_wait_script(index)).await?;
        Ok(match state.as_str() {
            "loaded" => ImageState::Loaded,
            "errored" => ImageState::Errored,
            _ => ImageState::Missing,
        })
    }

    async fn print_document(&self, settings: &PdfSettings) -> Result<Vec<u8>, RenderError> {
        let (paper_width, paper_height) = settings.paper_size();
        let params = PrintToPdfParams::builder()
            .print_background(settings.print_background)
            .landscape(settings.landscape)
            .paper_width(paper_width)
            .paper_height(paper_height)
            .margin_top(settings.margin.top)
            .margin_right(settings.margin.right)
            .margin_bottom(settings.margin.bottom)
            .margin_left(settings.margin.left)
            .build();

        self.page()?
            .pdf(params)
            .await
            .map_err(|e| RenderError::Capture(format!("Failed to print document: {e}")))
    }

    async fn capture_raster(&self, settings: &RasterSettings) -> Result<Vec<u8>, RenderError> {
        let format = match settings.format {
            OutputFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            OutputFormat::Png => CaptureScreenshotFormat::Png,
            OutputFormat::Webp => CaptureScreenshotFormat::Webp,
        };

        let mut builder = ScreenshotParams::builder()
            .format(format)
            .from_surface(true)
            .full_page(settings.full_page)
            .capture_beyond_viewport(settings.full_page);

        if let Some(quality) = settings.quality {
            builder = builder.quality(quality as i64);
        }

        self.page()?
            .screenshot(builder.build())
            .await
            .map_err(|e| RenderError::Capture(format!("Failed to capture screenshot: {e}")))
    }

    fn blocked_requests(&self) -> usize {
        self.stats.aborted()
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Page close for {} failed: {}", self.id, e);
            }
        }

        if let Some(context_id) = self.context_id.take() {
            let browser = self.browser.read().await;
            browser
                .execute(DisposeBrowserContextParams::new(context_id))
                .await
                .map_err(|e| {
                    error!("Failed to dispose browser context {}: {}", self.id, e);
                    RenderError::Teardown(format!("failed to dispose browser context: {e}"))
                })?;
        }

        debug!("Context {} disposed", self.id);
        Ok(())
    }
}

impl Drop for ChromeContext {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Resolve once at most `idle.max_inflight` requests have been in flight for
/// an unbroken `idle.idle_for`. Unbounded; callers apply the timeout.
async fn wait_for_network_idle(in_flight: &DashSet<String>, idle: NetworkIdle) {
    let mut idle_since: Option<Instant> = None;

    loop {
        if in_flight.len() <= idle.max_inflight {
            let start = *idle_since.get_or_insert_with(Instant::now);
            if start.elapsed() >= idle.idle_for {
                return;
            }
        } else {
            idle_since = None;
        }

        sleep(IDLE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdp_resource_types_map_onto_filter_types() {
        assert_eq!(resource_type(&network::ResourceType::Font), ResourceType::Font);
        assert_eq!(resource_type(&network::ResourceType::WebSocket), ResourceType::WebSocket);
        assert_eq!(resource_type(&network::ResourceType::Xhr), ResourceType::Xhr);
        assert_eq!(resource_type(&network::ResourceType::Prefetch), ResourceType::Other);
        assert_eq!(resource_type(&network::ResourceType::Other), ResourceType::Other);
    }

    #[test]
    fn image_wait_script_targets_one_index() {
        let script = image_wait_script(3);
        assert!(script.contains("document.images[3]"));
        assert!(script.starts_with("new Promise"));
    }

    fn quiet_for(idle_for: Duration) -> NetworkIdle {
        NetworkIdle {
            max_inflight: 0,
            idle_for,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_idle_waits_for_requests_to_drain() {
        let in_flight = Arc::new(DashSet::new());
        for id in ["a", "b", "c"] {
            in_flight.insert(id.to_string());
        }
        let draining = in_flight.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            draining.clear();
        });
        let started = Instant::now();

        wait_for_network_idle(&in_flight, quiet_for(Duration::from_millis(500))).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn network_idle_restarts_when_a_request_starts() {
        let in_flight = Arc::new(DashSet::new());
        let busy = in_flight.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            busy.insert("late".to_string());
            sleep(Duration::from_millis(700)).await;
            busy.remove("late");
        });
        let started = Instant::now();

        wait_for_network_idle(&in_flight, quiet_for(Duration::from_millis(500))).await;

        // The quiet window restarts after the late request finishes at 1s.
        assert!(started.elapsed() >= Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn network_idle_tolerates_the_configured_in_flight_count() {
        let in_flight = DashSet::new();
        in_flight.insert("long-poll".to_string());
        let idle = NetworkIdle {
            max_inflight: 2,
            idle_for: Duration::from_millis(500),
        };
        let started = Instant::now();

        wait_for_network_idle(&in_flight, idle).await;

        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn network_idle_never_resolves_while_busy() {
        let in_flight = DashSet::new();
        in_flight.insert("stream".to_string());

        let waited = tokio::time::timeout(
            Duration::from_secs(10),
            wait_for_network_idle(&in_flight, quiet_for(Duration::from_millis(500))),
        )
        .await;

        assert!(waited.is_err());
    }

    /// Needs a real browser: set RENDER_CORE_TEST_CHROME_PATH to run it.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closing_a_context_is_not_blocked_by_concurrent_creation() {
        let Ok(chrome_path) = std::env::var("RENDER_CORE_TEST_CHROME_PATH") else {
            eprintln!("RENDER_CORE_TEST_CHROME_PATH not set; skipping browser test");
            return;
        };
        let config = Config {
            chrome_path: Some(chrome_path),
            ..Default::default()
        };
        let engine = Arc::new(ChromeEngine::launch(&config).await.unwrap());

        let mut first = engine.create_context("first").await.unwrap();
        let creating = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.create_context("second").await })
        };

        let closed = tokio::time::timeout(Duration::from_secs(10), first.close()).await;
        assert!(closed.is_ok(), "close stalled behind context creation");
        assert!(closed.unwrap().is_ok());

        let mut second = creating.await.unwrap().unwrap();
        second.close().await.unwrap();
        engine.shutdown().await;
    }
}
