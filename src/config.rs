//! Configuration management with serde serialization/deserialization
//!
//! This module provides the service configuration, the named pipeline presets
//! that select wait conditions, stage budgets and resource block-sets, and the
//! Chrome launch arguments.

use crate::engine::WaitCondition;
use crate::error::RenderError;
use crate::filter::ResourceType;
use crate::readiness::LoaderHeuristic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the render service
///
/// Nothing in here is mutated while jobs run. Each job resolves its own
/// immutable plan from the config plus its options.
///
/// # Examples
///
/// ```rust
/// use render_core::{Config, PipelinePreset};
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Favour speed over fidelity for every job that does not pick a preset
/// let config = Config {
///     default_preset: PipelinePreset::Fast,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Name reported by the liveness probe (default: "render-core")
    pub service_name: String,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for requests (default: Chrome default)
    pub user_agent: Option<String>,

    /// Run the browser headless (default: true)
    pub headless: bool,

    /// Keep Chrome's sandbox enabled (default: false)
    ///
    /// Containers without user namespaces usually need it off.
    pub sandbox: bool,

    /// Overall budget for one job from context acquisition to capture
    /// (default: 120 seconds)
    ///
    /// When it elapses the in-flight stage is cancelled and the job fails with
    /// `NavigationTimeout`. Any acquired context is still released.
    pub job_deadline_ms: u64,

    /// Budget for closing a job's context (default: 10 seconds)
    ///
    /// A close that outlives it is abandoned with a warning.
    pub teardown_timeout_ms: u64,

    /// Largest accepted document markup in bytes (default: 10 MiB)
    pub max_content_bytes: usize,

    /// Budget for inline markup to reach network quiet (default: 30 seconds)
    pub content_wait_timeout_ms: u64,

    /// Preset used when a job does not name one (default: standard)
    pub default_preset: PipelinePreset,

    /// Loading-indicator probe evaluated inside the page
    pub loader_heuristic: LoaderHeuristic,

    /// Delay between loader probe evaluations (default: 250 ms)
    pub loader_poll_interval_ms: u64,

    /// Fail the job when an image misses its cap (default: false)
    ///
    /// The non-strict mode accepts partially loaded images after the cap.
    pub strict_image_wait: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "render-core".to_string(),
            chrome_path: None,
            user_agent: None,
            headless: true,
            sandbox: false,
            job_deadline_ms: 120_000,
            teardown_timeout_ms: 10_000,
            max_content_bytes: 10 * 1024 * 1024,
            content_wait_timeout_ms: 30_000,
            default_preset: PipelinePreset::Standard,
            loader_heuristic: LoaderHeuristic::default(),
            loader_poll_interval_ms: 250,
            strict_image_wait: false,
        }
    }
}

impl Config {
    pub fn job_deadline(&self) -> Duration {
        Duration::from_millis(self.job_deadline_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn content_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.content_wait_timeout_ms)
    }

    pub fn loader_poll_interval(&self) -> Duration {
        Duration::from_millis(self.loader_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.job_deadline_ms == 0 {
            return Err(RenderError::Validation(
                "job_deadline_ms must be greater than 0".to_string(),
            ));
        }

        if self.teardown_timeout_ms == 0 {
            return Err(RenderError::Validation(
                "teardown_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.content_wait_timeout_ms == 0 {
            return Err(RenderError::Validation(
                "content_wait_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.loader_poll_interval_ms == 0 {
            return Err(RenderError::Validation(
                "loader_poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_content_bytes == 0 {
            return Err(RenderError::Validation(
                "max_content_bytes must be greater than 0".to_string(),
            ));
        }

        if self.service_name.trim().is_empty() {
            return Err(RenderError::Validation(
                "service_name cannot be empty".to_string(),
            ));
        }

        self.loader_heuristic.validate()?;

        if self.content_wait_timeout_ms >= self.job_deadline_ms {
            tracing::warn!(
                "content_wait_timeout_ms ({}) is not below job_deadline_ms ({}); \
                 the job deadline will fire first",
                self.content_wait_timeout_ms,
                self.job_deadline_ms
            );
        }

        Ok(())
    }
}

/// Named capture pipeline variants
///
/// The three variants differ in how long they are willing to wait and in how
/// much they load. None is canonical; callers pick one explicitly or take the
/// configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePreset {
    /// Load event plus a near-idle network
    #[default]
    Standard,
    /// Load event plus a fully idle network and longer budgets
    Thorough,
    /// Load event only, with a block-set for heavy non-visual resources
    Fast,
}

impl PipelinePreset {
    pub const ALL: [PipelinePreset; 3] = [
        PipelinePreset::Standard,
        PipelinePreset::Thorough,
        PipelinePreset::Fast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePreset::Standard => "standard",
            PipelinePreset::Thorough => "thorough",
            PipelinePreset::Fast => "fast",
        }
    }

    pub fn policy(&self) -> PipelinePolicy {
        match self {
            PipelinePreset::Standard => PipelinePolicy {
                address_wait: WaitCondition::load_and_idle(2),
                navigation_timeout: Duration::from_secs(30),
                loader_timeout: Duration::from_secs(15),
                per_image_timeout: Duration::from_secs(5),
                settle_delay: Duration::from_secs(2),
                blocked: BTreeSet::new(),
            },
            PipelinePreset::Thorough => PipelinePolicy {
                address_wait: WaitCondition::load_and_idle(0),
                navigation_timeout: Duration::from_secs(60),
                loader_timeout: Duration::from_secs(20),
                per_image_timeout: Duration::from_secs(10),
                settle_delay: Duration::from_secs(3),
                blocked: BTreeSet::new(),
            },
            PipelinePreset::Fast => PipelinePolicy {
                address_wait: WaitCondition::load(),
                navigation_timeout: Duration::from_secs(15),
                loader_timeout: Duration::from_secs(5),
                per_image_timeout: Duration::from_secs(3),
                settle_delay: Duration::from_secs(1),
                blocked: [
                    ResourceType::Media,
                    ResourceType::Font,
                    ResourceType::WebSocket,
                    ResourceType::Manifest,
                    ResourceType::Other,
                ]
                .into_iter()
                .collect(),
            },
        }
    }
}

impl fmt::Display for PipelinePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelinePreset {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| RenderError::Validation(format!("unknown pipeline preset: {s}")))
    }
}

/// Wait conditions, stage budgets and block-set behind a preset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePolicy {
    /// Condition an address navigation must reach
    pub address_wait: WaitCondition,
    pub navigation_timeout: Duration,
    pub loader_timeout: Duration,
    pub per_image_timeout: Duration,
    pub settle_delay: Duration,
    pub blocked: BTreeSet<ResourceType>,
}

/// Chrome command-line arguments for the shared browser process
///
/// Each job gets its own browser context inside this one process, so the
/// user data directory only needs to be unique per process.
pub fn chrome_args(config: &Config) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());

    let mut args = vec![
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--font-render-hinting=none".to_string(),
        format!("--user-data-dir=/tmp/render-core-{}", unique_id),
    ];

    if !config.sandbox {
        args.push("--no-sandbox".to_string());
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder().args(chrome_args(config));

    if !config.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(|e| RenderError::Engine(format!("Invalid browser configuration: {e}")))
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
