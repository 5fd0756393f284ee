use crate::capture::{PdfSettings, RasterSettings};
use crate::engine::{ExecutionContext, ImageState, RenderEngine, WaitCondition};
use crate::error::RenderError;
use crate::filter::{FilterDecision, FilterStats, ResourceFilter, ResourceType};
use crate::job::Viewport;
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub enum FakeImage {
    LoadsAfter(Duration),
    Errors,
    Never,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// Polls that still see a loader
    pub loader_visible_polls: usize,
    pub loader_never_clears: bool,
    pub images: Vec<FakeImage>,
    /// Requests issued by every load or navigation
    pub subresources: Vec<ResourceType>,
    /// Applies to both content loads and navigations
    pub navigation_delay: Duration,
    pub create_delay: Duration,
    /// `close` never resolves
    pub close_hangs: bool,
    pub navigation_error: Option<String>,
    pub capture_error: Option<String>,
    pub create_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    created: AtomicUsize,
    released: AtomicUsize,
    evaluations: AtomicUsize,
    continued: AtomicUsize,
    loaded_content: Mutex<Vec<String>>,
    navigations: Mutex<Vec<String>>,
}

impl FakeState {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn continued_requests(&self) -> usize {
        self.continued.load(Ordering::SeqCst)
    }

    pub fn loaded_content(&self) -> Vec<String> {
        self.loaded_content.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

pub struct FakeEngine {
    behavior: FakeBehavior,
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> Arc<FakeState> {
        self.state.clone()
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_context(&self, job_id: &str) -> Result<Box<dyn ExecutionContext>, RenderError> {
        if let Some(message) = &self.behavior.create_error {
            return Err(RenderError::Engine(message.clone()));
        }
        if !self.behavior.create_delay.is_zero() {
            tokio::time::sleep(self.behavior.create_delay).await;
        }

        let n = self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            id: format!("fake-{n}-{job_id}"),
            behavior: self.behavior.clone(),
            state: self.state.clone(),
            filter: Mutex::new(ResourceFilter::allow_all()),
            stats: FilterStats::default(),
            polls: AtomicUsize::new(0),
        }))
    }
}

pub struct FakeContext {
    id: String,
    behavior: FakeBehavior,
    state: Arc<FakeState>,
    filter: Mutex<ResourceFilter>,
    stats: FilterStats,
    polls: AtomicUsize,
}

impl FakeContext {
    fn issue_subresource_requests(&self) {
        let filter = self.filter.lock().unwrap().clone();
        for resource_type in &self.behavior.subresources {
            let decision = filter.decide(*resource_type);
            self.stats.record(decision);
            if decision == FilterDecision::Continue {
                self.state.continued.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl ExecutionContext for FakeContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_viewport(&self, _viewport: &Viewport) -> Result<(), RenderError> {
        Ok(())
    }

    async fn install_request_filter(&self, filter: &ResourceFilter) -> Result<(), RenderError> {
        *self.filter.lock().unwrap() = filter.clone();
        Ok(())
    }

    async fn load_content(&self, html: &str, _wait: &WaitCondition) -> Result<(), RenderError> {
        self.state.loaded_content.lock().unwrap().push(html.to_string());
        if !self.behavior.navigation_delay.is_zero() {
            tokio::time::sleep(self.behavior.navigation_delay).await;
        }
        self.issue_subresource_requests();
        Ok(())
    }

    async fn navigate(&self, url: &Url, _wait: &WaitCondition) -> Result<(), RenderError> {
        self.state.navigations.lock().unwrap().push(url.to_string());
        if !self.behavior.navigation_delay.is_zero() {
            tokio::time::sleep(self.behavior.navigation_delay).await;
        }
        if let Some(message) = &self.behavior.navigation_error {
            return Err(RenderError::Navigation(message.clone()));
        }
        self.issue_subresource_requests();
        Ok(())
    }

    async fn evaluate_predicate(&self, _script: &str) -> Result<bool, RenderError> {
        self.state.evaluations.fetch_add(1, Ordering::SeqCst);
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(!self.behavior.loader_never_clears && seen >= self.behavior.loader_visible_polls)
    }

    async fn image_count(&self) -> Result<usize, RenderError> {
        Ok(self.behavior.images.len())
    }

    async fn wait_for_image(&self, index: usize) -> Result<ImageState, RenderError> {
        match self.behavior.images.get(index) {
            Some(FakeImage::LoadsAfter(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(ImageState::Loaded)
            }
            Some(FakeImage::Errors) => Ok(ImageState::Errored),
            Some(FakeImage::Never) => std::future::pending().await,
            None => Ok(ImageState::Missing),
        }
    }

    async fn print_document(&self, _settings: &PdfSettings) -> Result<Vec<u8>, RenderError> {
        if let Some(message) = &self.behavior.capture_error {
            return Err(RenderError::Capture(message.clone()));
        }
        Ok(b"%PDF-1.7\n%fake document\n%%EOF\n".to_vec())
    }

    async fn capture_raster(&self, _settings: &RasterSettings) -> Result<Vec<u8>, RenderError> {
        if let Some(message) = &self.behavior.capture_error {
            return Err(RenderError::Capture(message.clone()));
        }
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::new_rgb8(8, 6)
            .write_to(&mut buf, image::ImageOutputFormat::Png)
            .map_err(|e| RenderError::Capture(e.to_string()))?;
        Ok(buf.into_inner())
    }

    fn blocked_requests(&self) -> usize {
        self.stats.aborted()
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        if self.behavior.close_hangs {
            std::future::pending::<()>().await;
        }
        // Counted every time so a double release shows up in the totals.
        self.state.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
