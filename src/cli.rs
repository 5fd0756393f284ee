use crate::capture::OutputFormat;
use crate::chrome::ChromeEngine;
use crate::config::{Config, PipelinePreset};
use crate::coordinator::{CaptureResponse, DocumentResponse, RequestCoordinator};
use crate::engine::RenderEngine;
use crate::filter::ResourceType;
use crate::health::LivenessProbe;
use crate::job::{CaptureOptions, DocumentOptions, JobSpec, Margin, RenderJob};
use crate::worker::process_batch;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "render-core")]
#[command(about = "Headless-browser document and screenshot rendering")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Per-job deadline in seconds")]
    pub deadline: Option<u64>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Print Prometheus metrics on exit")]
    pub metrics: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render an HTML file to PDF
    Document {
        #[arg(short, long, help = "HTML input file")]
        input: PathBuf,

        #[arg(short, long, help = "Output PDF path")]
        output: PathBuf,

        #[arg(
            long,
            default_value = "A4",
            help = "Page format (A0-A6, Letter, Legal, Tabloid, Ledger)"
        )]
        page_format: String,

        #[arg(
            long,
            default_value = "20px",
            help = "Margin applied to all sides (px, in, cm, mm, pt)"
        )]
        margin: String,

        #[arg(long, help = "Landscape orientation")]
        landscape: bool,
    },

    /// Screenshot a URL
    Capture {
        #[arg(short, long, help = "URL to capture")]
        target: String,

        #[arg(short, long, help = "Output image path")]
        output: PathBuf,

        #[arg(long, default_value_t = 1920, help = "Viewport width")]
        width: u32,

        #[arg(long, default_value_t = 1080, help = "Viewport height")]
        height: u32,

        #[arg(long, default_value_t = 1.0, help = "Device pixel ratio")]
        scale: f64,

        #[arg(long, default_value = "jpeg", help = "Output format (jpeg, png, webp)")]
        format: String,

        #[arg(long, default_value_t = 80, help = "Quality for lossy formats (1-100)")]
        quality: u8,

        #[arg(long, help = "Capture only the viewport instead of the full page")]
        viewport_only: bool,

        #[arg(long, help = "Settle delay in milliseconds before capture")]
        wait_ms: Option<u64>,

        #[arg(long = "block", value_name = "TYPE", help = "Resource type to block (repeatable)")]
        block: Vec<String>,

        #[arg(long, conflicts_with = "block", help = "Load every resource type")]
        allow_all: bool,

        #[arg(long, help = "Pipeline preset (standard, thorough, fast)")]
        preset: Option<String>,

        #[arg(long, help = "Fail the job when an image never settles")]
        strict_images: bool,
    },

    /// Run a JSON manifest of jobs through a bounded worker pool
    Batch {
        #[arg(short, long, help = "JSON array of render jobs")]
        manifest: PathBuf,

        #[arg(short, long, help = "Output directory")]
        output: PathBuf,

        #[arg(short, long, help = "Concurrent jobs (defaults to the CPU count)")]
        concurrency: Option<usize>,
    },

    /// Print the liveness report
    Health,

    /// Validate the configuration given with --config and print it
    Validate,
}

/// Read the configuration file if given, then apply command-line overrides
pub async fn load_config(args: &Cli) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config(path).await?,
        None => Config::default(),
    };

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
    if let Some(deadline) = args.deadline {
        config.job_deadline_ms = deadline.saturating_mul(1000);
    }

    config.validate()?;
    info!(
        "Configuration loaded: deadline {:?}, default preset {}",
        config.job_deadline(),
        config.default_preset
    );
    Ok(config)
}

async fn read_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Document {
                input,
                output,
                page_format,
                margin,
                landscape,
            } => {
                let content = fs::read_to_string(&input)
                    .await
                    .with_context(|| format!("reading {}", input.display()))?;
                let job = RenderJob::from_spec(JobSpec::Document {
                    content: Some(content),
                    options: DocumentOptions {
                        page_format,
                        margin: Margin::uniform(margin),
                        landscape,
                        ..Default::default()
                    },
                });
                self.run_document(job, &output).await
            }
            Commands::Capture {
                target,
                output,
                width,
                height,
                scale,
                format,
                quality,
                viewport_only,
                wait_ms,
                block,
                allow_all,
                preset,
                strict_images,
            } => {
                let blocked_resource_types = if allow_all {
                    Some(BTreeSet::new())
                } else {
                    parse_block_list(&block)?
                };
                let options = CaptureOptions {
                    viewport_width: width,
                    viewport_height: height,
                    device_pixel_ratio: scale,
                    output_format: format.parse::<OutputFormat>()?,
                    quality,
                    full_page: !viewport_only,
                    wait_time_ms: wait_ms,
                    blocked_resource_types,
                    preset: preset.as_deref().map(str::parse::<PipelinePreset>).transpose()?,
                    strict_image_wait: strict_images.then_some(true),
                };
                let job = RenderJob::from_spec(JobSpec::Capture {
                    target: Some(target),
                    options,
                });
                self.run_capture(job, &output).await
            }
            Commands::Batch {
                manifest,
                output,
                concurrency,
            } => {
                self.run_batch(&manifest, &output, concurrency.unwrap_or_else(num_cpus::get))
                    .await
            }
            Commands::Health => {
                let report = LivenessProbe::new(&self.config.service_name).check();
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Commands::Validate => {
                // load_config has already parsed and validated it.
                let config = &self.config;
                println!("Configuration is valid:");
                println!("  Service: {}", config.service_name);
                println!("  Job deadline: {:?}", config.job_deadline());
                println!("  Content wait: {:?}", config.content_wait_timeout());
                println!("  Default preset: {}", config.default_preset);
                println!("  Strict image wait: {}", config.strict_image_wait);
                Ok(())
            }
        }
    }

    async fn run_document(&self, job: RenderJob, output: &Path) -> Result<()> {
        let response = self
            .with_coordinator(|coordinator| async move {
                DocumentResponse::from(coordinator.execute(job).await)
            })
            .await?;

        println!("{}", serde_json::to_string_pretty(&response)?);
        if let Some(error) = response.error {
            bail!(error);
        }
        write_artifact(output, &response.bytes).await
    }

    async fn run_capture(&self, job: RenderJob, output: &Path) -> Result<()> {
        let response = self
            .with_coordinator(|coordinator| async move {
                CaptureResponse::from(coordinator.execute(job).await)
            })
            .await?;

        println!("{}", serde_json::to_string_pretty(&response)?);
        if let Some(error) = response.error {
            bail!(error);
        }
        write_artifact(output, &response.bytes).await
    }

    async fn run_batch(&self, manifest: &Path, output: &Path, concurrency: usize) -> Result<()> {
        let content = fs::read_to_string(manifest)
            .await
            .with_context(|| format!("reading manifest {}", manifest.display()))?;
        let jobs: Vec<RenderJob> = serde_json::from_str(&content)
            .with_context(|| format!("parsing manifest {}", manifest.display()))?;
        info!("Loaded {} jobs from {}", jobs.len(), manifest.display());

        fs::create_dir_all(output).await?;

        let results = self
            .with_coordinator(|coordinator| async move {
                process_batch(coordinator, jobs, concurrency).await
            })
            .await?;

        let mut failures = 0;
        for item in results {
            match item.result {
                Ok(result) => {
                    let path = output.join(output_filename(&item.job_id, &result.metadata.format));
                    fs::write(&path, &result.bytes).await?;
                    let line = serde_json::json!({
                        "jobId": item.job_id,
                        "success": true,
                        "output": path.display().to_string(),
                        "sizeBytes": result.size_bytes,
                    });
                    println!("{line}");
                }
                Err(error) => {
                    failures += 1;
                    let line = serde_json::json!({
                        "jobId": item.job_id,
                        "success": false,
                        "error": error,
                    });
                    println!("{line}");
                }
            }
        }

        if failures > 0 {
            warn!("{} job(s) in the batch failed", failures);
        }
        Ok(())
    }

    /// Launch the browser, run `f` with a coordinator over it, always shut down
    async fn with_coordinator<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<RequestCoordinator>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let engine = Arc::new(ChromeEngine::launch(&self.config).await?);
        let coordinator = Arc::new(RequestCoordinator::new(
            engine.clone() as Arc<dyn RenderEngine>,
            self.config.clone(),
        ));

        let output = f(coordinator.clone()).await;

        let snapshot = coordinator.metrics().snapshot();
        if snapshot.contexts_live() > 0 {
            warn!("{} execution context(s) still live at shutdown", snapshot.contexts_live());
        }
        engine.shutdown().await;
        Ok(output)
    }
}

fn parse_block_list(names: &[String]) -> Result<Option<BTreeSet<ResourceType>>> {
    if names.is_empty() {
        return Ok(None);
    }
    let mut blocked = BTreeSet::new();
    for name in names.iter().flat_map(|n| n.split(',')) {
        match ResourceType::parse(name) {
            Some(resource_type) => {
                blocked.insert(resource_type);
            }
            None => bail!("unknown resource type: {name}"),
        }
    }
    Ok(Some(blocked))
}

async fn write_artifact(output: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::write(output, bytes)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    info!("Wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

/// File name for a batch artifact; job ids are caller-supplied so they get sanitised
pub fn output_filename(job_id: &str, format: &str) -> String {
    let stem: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let extension = match format.parse::<OutputFormat>() {
        Ok(format) => format.extension(),
        Err(_) => "pdf",
    };
    format!("{stem}.{extension}")
}

pub fn setup_logging(verbose: bool) {
    let default_directive = if verbose { "render_core=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
