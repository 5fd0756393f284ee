use crate::capture::{
    css_length_to_inches, MarginInches, OutputFormat, PageFormat, PdfSettings, RasterSettings,
};
use crate::config::{Config, PipelinePreset};
use crate::engine::WaitCondition;
use crate::error::RenderError;
use crate::filter::{ResourceFilter, ResourceType};
use crate::navigation::NavigationPlan;
use crate::readiness::ReadinessPlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use url::Url;

pub const MAX_VIEWPORT_DIMENSION: u32 = 16_384;
pub const MAX_DEVICE_PIXEL_RATIO: f64 = 8.0;

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One request to produce a paged document or a raster capture
///
/// # Examples
///
/// ```rust
/// use render_core::RenderJob;
///
/// let job: RenderJob = serde_json::from_str(
///     r#"{"kind":"capture","target":"https://example.com","options":{"fullPage":false}}"#,
/// ).unwrap();
/// assert_eq!(job.kind().as_str(), "capture");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    #[serde(default = "new_job_id")]
    pub id: String,
    #[serde(flatten)]
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSpec {
    Document {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        options: DocumentOptions,
    },
    Capture {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        options: CaptureOptions,
    },
}

impl RenderJob {
    pub fn document(content: impl Into<String>) -> Self {
        Self::from_spec(JobSpec::Document {
            content: Some(content.into()),
            options: DocumentOptions::default(),
        })
    }

    pub fn capture(target: impl Into<String>) -> Self {
        Self::from_spec(JobSpec::Capture {
            target: Some(target.into()),
            options: CaptureOptions::default(),
        })
    }

    pub fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: new_job_id(),
            spec,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn kind(&self) -> JobKind {
        match self.spec {
            JobSpec::Document { .. } => JobKind::Document,
            JobSpec::Capture { .. } => JobKind::Capture,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Document,
    Capture,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Document => "document",
            JobKind::Capture => "capture",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margin {
    pub top: String,
    pub right: String,
    pub bottom: String,
    pub left: String,
}

impl Margin {
    pub fn uniform(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            top: value.clone(),
            right: value.clone(),
            bottom: value.clone(),
            left: value,
        }
    }

    fn to_inches(&self) -> Result<MarginInches, RenderError> {
        Ok(MarginInches {
            top: css_length_to_inches(&self.top)?,
            right: css_length_to_inches(&self.right)?,
            bottom: css_length_to_inches(&self.bottom)?,
            left: css_length_to_inches(&self.left)?,
        })
    }
}

impl Default for Margin {
    fn default() -> Self {
        Self::uniform("20px")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentOptions {
    pub page_format: String,
    pub margin: Margin,
    pub print_background: bool,
    pub landscape: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            page_format: PageFormat::A4.as_str().to_string(),
            margin: Margin::default(),
            print_background: true,
            landscape: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_pixel_ratio: f64,
    pub output_format: OutputFormat,
    pub quality: u8,
    pub full_page: bool,
    /// Settle delay override
    pub wait_time_ms: Option<u64>,
    /// Replaces the preset's block-set when given
    pub blocked_resource_types: Option<BTreeSet<ResourceType>>,
    pub preset: Option<PipelinePreset>,
    pub strict_image_wait: Option<bool>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            viewport_width: 1920,
            viewport_height: 1080,
            device_pixel_ratio: 1.0,
            output_format: OutputFormat::Jpeg,
            quality: 80,
            full_page: true,
            wait_time_ms: None,
            blocked_resource_types: None,
            preset: None,
            strict_image_wait: None,
        }
    }
}

/// Browser viewport used for a capture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Validated input for the pipeline
#[derive(Debug, Clone)]
pub enum PlanInput {
    Document {
        content: String,
        pdf: PdfSettings,
    },
    Capture {
        target: Url,
        viewport: Viewport,
        raster: RasterSettings,
    },
}

/// Everything one job needs, resolved up front and never mutated
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job_id: String,
    pub kind: JobKind,
    pub preset: PipelinePreset,
    pub input: PlanInput,
    pub navigation: NavigationPlan,
    pub readiness: ReadinessPlan,
}

impl JobPlan {
    pub fn resolve(job: RenderJob, config: &Config) -> Result<Self, RenderError> {
        match job.spec {
            JobSpec::Document { content, options } => {
                Self::resolve_document(job.id, content, options, config)
            }
            JobSpec::Capture { target, options } => {
                Self::resolve_capture(job.id, target, options, config)
            }
        }
    }

    fn resolve_document(
        job_id: String,
        content: Option<String>,
        options: DocumentOptions,
        config: &Config,
    ) -> Result<Self, RenderError> {
        let content = match content {
            Some(content) if !content.trim().is_empty() => content,
            _ => {
                return Err(RenderError::Validation(
                    "content is required for document jobs".to_string(),
                ))
            }
        };

        if content.len() > config.max_content_bytes {
            return Err(RenderError::Validation(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                config.max_content_bytes
            )));
        }

        let pdf = PdfSettings {
            page_format: options.page_format.parse()?,
            landscape: options.landscape,
            print_background: options.print_background,
            margin: options.margin.to_inches()?,
        };

        let preset = config.default_preset;
        let policy = preset.policy();

        Ok(Self {
            job_id,
            kind: JobKind::Document,
            preset,
            input: PlanInput::Document { content, pdf },
            navigation: NavigationPlan {
                wait: WaitCondition::network_quiet(),
                timeout: config.content_wait_timeout(),
                filter: ResourceFilter::allow_all(),
                viewport: None,
            },
            readiness: ReadinessPlan {
                loader_timeout: policy.loader_timeout,
                poll_interval: config.loader_poll_interval(),
                per_image_timeout: policy.per_image_timeout,
                strict_image_wait: config.strict_image_wait,
                settle_delay: policy.settle_delay,
            },
        })
    }

    fn resolve_capture(
        job_id: String,
        target: Option<String>,
        options: CaptureOptions,
        config: &Config,
    ) -> Result<Self, RenderError> {
        let target = match target {
            Some(target) if !target.trim().is_empty() => parse_target(target.trim())?,
            _ => {
                return Err(RenderError::Validation(
                    "target is required for capture jobs".to_string(),
                ))
            }
        };

        for (name, value) in [
            ("viewportWidth", options.viewport_width),
            ("viewportHeight", options.viewport_height),
        ] {
            if value == 0 || value > MAX_VIEWPORT_DIMENSION {
                return Err(RenderError::Validation(format!(
                    "{name} must be between 1 and {MAX_VIEWPORT_DIMENSION}, got {value}"
                )));
            }
        }

        let dpr = options.device_pixel_ratio;
        if !dpr.is_finite() || dpr <= 0.0 || dpr > MAX_DEVICE_PIXEL_RATIO {
            return Err(RenderError::Validation(format!(
                "devicePixelRatio must be in (0, {MAX_DEVICE_PIXEL_RATIO}], got {dpr}"
            )));
        }

        if options.quality > 100 {
            return Err(RenderError::Validation(format!(
                "quality must be at most 100, got {}",
                options.quality
            )));
        }

        let preset = options.preset.unwrap_or(config.default_preset);
        let policy = preset.policy();
        let blocked = options.blocked_resource_types.unwrap_or(policy.blocked);
        let settle_delay = options
            .wait_time_ms
            .map(Duration::from_millis)
            .unwrap_or(policy.settle_delay);

        let viewport = Viewport {
            width: options.viewport_width,
            height: options.viewport_height,
            device_scale_factor: dpr,
            mobile: false,
        };

        Ok(Self {
            job_id,
            kind: JobKind::Capture,
            preset,
            input: PlanInput::Capture {
                target,
                viewport,
                raster: RasterSettings::new(
                    options.output_format,
                    options.quality,
                    options.full_page,
                ),
            },
            navigation: NavigationPlan {
                wait: policy.address_wait,
                timeout: policy.navigation_timeout,
                filter: ResourceFilter::new(blocked),
                viewport: Some(viewport),
            },
            readiness: ReadinessPlan {
                loader_timeout: policy.loader_timeout,
                poll_interval: config.loader_poll_interval(),
                per_image_timeout: policy.per_image_timeout,
                strict_image_wait: options
                    .strict_image_wait
                    .unwrap_or(config.strict_image_wait),
                settle_delay,
            },
        })
    }
}

fn parse_target(target: &str) -> Result<Url, RenderError> {
    let url = Url::parse(target)
        .map_err(|e| RenderError::Validation(format!("target must be an absolute URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(RenderError::Validation(format!(
            "unsupported target scheme: {scheme}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn document_defaults_are_a4_with_20px_margins() {
        let job: RenderJob =
            serde_json::from_str(r#"{"kind":"document","content":"<p>x</p>"}"#).unwrap();

        match &job.spec {
            JobSpec::Document { options, .. } => {
                assert_eq!(options.page_format, "A4");
                assert_eq!(options.margin, Margin::uniform("20px"));
                assert!(options.print_background);
            }
            JobSpec::Capture { .. } => panic!("expected a document job"),
        }

        let plan = JobPlan::resolve(job, &config()).unwrap();
        match plan.input {
            PlanInput::Document { pdf, .. } => {
                assert_eq!(pdf.page_format, PageFormat::A4);
                assert!((pdf.margin.left - 20.0 / 96.0).abs() < 1e-9);
            }
            PlanInput::Capture { .. } => panic!("expected a document plan"),
        }
        assert_eq!(plan.navigation.wait, WaitCondition::network_quiet());
        assert!(!plan.navigation.filter.is_enabled());
    }

    #[test]
    fn partial_margin_keeps_default_sides() {
        let options: DocumentOptions =
            serde_json::from_str(r#"{"margin":{"top":"1in"}}"#).unwrap();
        assert_eq!(options.margin.top, "1in");
        assert_eq!(options.margin.bottom, "20px");
    }

    #[test]
    fn missing_or_blank_content_is_rejected() {
        let job: RenderJob = serde_json::from_str(r#"{"kind":"document"}"#).unwrap();
        assert!(matches!(
            JobPlan::resolve(job, &config()),
            Err(RenderError::Validation(_))
        ));

        let job = RenderJob::document("   ");
        assert!(matches!(
            JobPlan::resolve(job, &config()),
            Err(RenderError::Validation(_))
        ));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let config = Config {
            max_content_bytes: 8,
            ..Default::default()
        };
        let err = JobPlan::resolve(RenderJob::document("<p>too long</p>"), &config).unwrap_err();
        assert!(err.to_string().contains("limit is 8"));
    }

    #[test]
    fn capture_defaults_follow_the_default_preset() {
        let plan = JobPlan::resolve(RenderJob::capture("https://example.com"), &config()).unwrap();
        assert_eq!(plan.preset, PipelinePreset::Standard);
        assert_eq!(plan.navigation.wait, WaitCondition::load_and_idle(2));
        assert_eq!(plan.readiness.settle_delay, Duration::from_secs(2));

        match plan.input {
            PlanInput::Capture {
                viewport, raster, ..
            } => {
                assert_eq!((viewport.width, viewport.height), (1920, 1080));
                assert_eq!(viewport.device_scale_factor, 1.0);
                assert_eq!(raster.format, OutputFormat::Jpeg);
                assert_eq!(raster.quality, Some(80));
                assert!(raster.full_page);
            }
            PlanInput::Document { .. } => panic!("expected a capture plan"),
        }
    }

    #[test]
    fn explicit_block_set_replaces_the_preset() {
        let job: RenderJob = serde_json::from_str(
            r#"{"kind":"capture","target":"https://example.com",
                "options":{"preset":"fast","blockedResourceTypes":["image"],"waitTimeMs":250}}"#,
        )
        .unwrap();
        let plan = JobPlan::resolve(job, &config()).unwrap();

        assert_eq!(plan.preset, PipelinePreset::Fast);
        assert_eq!(
            plan.navigation.filter.blocked().iter().copied().collect::<Vec<_>>(),
            vec![ResourceType::Image]
        );
        assert_eq!(plan.readiness.settle_delay, Duration::from_millis(250));
    }

    #[test]
    fn bad_capture_options_are_rejected() {
        let cases = [
            r#"{"kind":"capture"}"#,
            r#"{"kind":"capture","target":"example.com"}"#,
            r#"{"kind":"capture","target":"ftp://example.com"}"#,
            r#"{"kind":"capture","target":"https://example.com","options":{"viewportWidth":0}}"#,
            r#"{"kind":"capture","target":"https://example.com","options":{"viewportHeight":20000}}"#,
            r#"{"kind":"capture","target":"https://example.com","options":{"devicePixelRatio":0}}"#,
            r#"{"kind":"capture","target":"https://example.com","options":{"quality":101}}"#,
        ];

        for case in cases {
            let job: RenderJob = serde_json::from_str(case).unwrap();
            assert!(
                matches!(JobPlan::resolve(job, &config()), Err(RenderError::Validation(_))),
                "{case}"
            );
        }
    }

    #[test]
    fn strict_image_wait_can_be_overridden_per_job() {
        let config = Config {
            strict_image_wait: true,
            ..Default::default()
        };
        let job: RenderJob = serde_json::from_str(
            r#"{"kind":"capture","target":"https://example.com","options":{"strictImageWait":false}}"#,
        )
        .unwrap();
        assert!(!JobPlan::resolve(job, &config).unwrap().readiness.strict_image_wait);

        let plan = JobPlan::resolve(RenderJob::capture("https://example.com"), &config).unwrap();
        assert!(plan.readiness.strict_image_wait);
    }

    #[test]
    fn job_ids_are_generated_when_absent() {
        let job: RenderJob =
            serde_json::from_str(r#"{"kind":"capture","target":"https://example.com"}"#).unwrap();
        assert!(!job.id.is_empty());

        let job = RenderJob::capture("https://example.com").with_id("job-1");
        assert_eq!(job.id, "job-1");
        assert_eq!(job.kind(), JobKind::Capture);
    }
}
