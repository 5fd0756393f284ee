//! # render-core
//!
//! Renders caller-supplied HTML to PDF and captures web pages as raster
//! images through a headless Chrome, one isolated browser context per job.
//!
//! A job flows through the [`RequestCoordinator`]:
//!
//! 1. [`JobPlan::resolve`] validates it and resolves every budget up front.
//! 2. A [`ContextLease`] acquires a fresh execution context.
//! 3. The [`NavigationController`] loads the content or navigates, with
//!    optional resource blocking.
//! 4. The [`ReadinessDetector`] waits for loaders and images; slow signals
//!    degrade instead of failing the job.
//! 5. The [`CaptureEngine`] prints or screenshots the page.
//! 6. The context is released, whatever happened, and every failure leaves
//!    through the [`ErrorClassifier`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::{ChromeEngine, Config, RenderJob, RequestCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let engine = Arc::new(ChromeEngine::launch(&config).await?);
//!     let coordinator = RequestCoordinator::new(engine.clone(), config);
//!
//!     let result = coordinator
//!         .execute(RenderJob::document("<html><body>Hi</body></html>"))
//!         .await?;
//!     println!("{} bytes of {}", result.size_bytes, result.content_type);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-core document --input invoice.html --output invoice.pdf
//! render-core capture --target https://example.com --output shot.png --format png
//! render-core batch --manifest jobs.json --output out/ --concurrency 4
//! ```

/// Service configuration and pipeline presets
pub mod config;

/// Error types and failure classification
pub mod error;

/// Job requests and plan resolution
pub mod job;

/// Resource-type blocking policy
pub mod filter;

/// Rendering engine abstraction and context leases
pub mod engine;

/// Chrome DevTools implementation of the engine
pub mod chrome;

/// Navigation with wait conditions and budgets
pub mod navigation;

/// Loader and image readiness signals
pub mod readiness;

/// PDF and raster capture
pub mod capture;

/// The job pipeline
pub mod coordinator;

/// Job lifecycle events
pub mod events;

/// Liveness probe
pub mod health;

/// Pipeline metrics
pub mod metrics;

/// Bounded worker pool for batches
pub mod worker;

/// Command-line interface
pub mod cli;

#[cfg(test)]
mod testing;


pub use capture::{Artifact, CaptureEngine, OutputFormat, PageFormat, PdfSettings, RasterSettings};
pub use chrome::ChromeEngine;
pub use config::{Config, PipelinePolicy, PipelinePreset};
pub use coordinator::{
    CaptureMetadata, CaptureResponse, CaptureResult, DocumentResponse, RequestCoordinator,
};
pub use engine::{ContextLease, ExecutionContext, RenderEngine, WaitCondition};
pub use error::{ClassifiedError, ErrorClassifier, ErrorKind, RenderError};
pub use events::{JobEvent, JobObserver, JobState, TracingObserver};
pub use filter::{ResourceFilter, ResourceType};
pub use health::{LivenessProbe, LivenessReport};
pub use job::{CaptureOptions, DocumentOptions, JobKind, JobPlan, JobSpec, RenderJob};
pub use metrics::{Metrics, MetricsSnapshot};
pub use navigation::{NavigationController, NavigationPlan};
pub use readiness::{LoaderHeuristic, ReadinessDetector, ReadinessReport};
pub use worker::{process_batch, BatchItem, WorkerPool};
