use crate::engine::{ExecutionContext, ImageState};
use crate::error::RenderError;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

/// Budgets for one job's readiness pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPlan {
    pub loader_timeout: Duration,
    pub poll_interval: Duration,
    pub per_image_timeout: Duration,
    pub strict_image_wait: bool,
    pub settle_delay: Duration,
}

/// Content-readiness probe evaluated inside the rendered page
///
/// An element counts as a loading indicator when it matches one of
/// `indicator_selectors`, is visible, and either covers at least
/// `min_viewport_coverage` of the viewport or sits inside a fixed or absolute
/// container spanning the viewport. A main-content region holding fewer than
/// `min_main_text_length` characters also counts as still loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderHeuristic {
    pub indicator_selectors: Vec<String>,
    pub min_viewport_coverage: f64,
    pub main_content_selectors: Vec<String>,
    pub min_main_text_length: usize,
}

impl Default for LoaderHeuristic {
    fn default() -> Self {
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            indicator_selectors: strings(&[
                "[class*='loader' i]",
                "[class*='spinner' i]",
                "[class*='skeleton' i]",
                "[class*='loading' i]",
                "[class*='preloader' i]",
                "[aria-busy='true']",
                "[role='progressbar']",
                "progress",
                ".animate-spin",
                ".animate-pulse",
            ]),
            min_viewport_coverage: 0.25,
            main_content_selectors: strings(&["main", "[role='main']", "#root", "#app", "#__next"]),
            min_main_text_length: 20,
        }
    }
}

impl LoaderHeuristic {
    pub fn validate(&self) -> Result<(), RenderError> {
        if !(0.0..=1.0).contains(&self.min_viewport_coverage) {
            return Err(RenderError::Validation(format!(
                "loader_heuristic.min_viewport_coverage must be within [0, 1], got {}",
                self.min_viewport_coverage
            )));
        }
        Ok(())
    }

    /// Build the predicate. It evaluates to `true` once the page looks ready.
    pub fn script(&self) -> String {
        // serde_json string/array literals are valid JavaScript literals.
        let indicators = serde_json::Value::from(self.indicator_selectors.clone());
        let mains = serde_json::Value::from(self.main_content_selectors.clone());

        format!(
            r#"(() => {{
  const indicators = {indicators};
  const mains = {mains};
  const minCoverage = {coverage};
  const minMainText = {min_text};
  const vw = window.innerWidth || document.documentElement.clientWidth || 1;
  const vh = window.innerHeight || document.documentElement.clientHeight || 1;
  const visible = (el) => {{
    const style = window.getComputedStyle(el);
    if (style.display === 'none' || style.visibility === 'hidden') return false;
    if (parseFloat(style.opacity) === 0) return false;
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  }};
  const inOverlay = (el) => {{
    for (let p = el.parentElement; p; p = p.parentElement) {{
      const style = window.getComputedStyle(p);
      if (style.position !== 'fixed' && style.position !== 'absolute') continue;
      const rect = p.getBoundingClientRect();
      if (rect.width >= vw * 0.9 && rect.height >= vh * 0.9) return true;
    }}
    return false;
  }};
  for (const selector of indicators) {{
    let nodes;
    try {{ nodes = document.querySelectorAll(selector); }} catch (_) {{ continue; }}
    for (const el of nodes) {{
      if (!visible(el)) continue;
      const rect = el.getBoundingClientRect();
      if ((rect.width * rect.height) / (vw * vh) >= minCoverage || inOverlay(el)) return false;
    }}
  }}
  for (const selector of mains) {{
    let main;
    try {{ main = document.querySelector(selector); }} catch (_) {{ continue; }}
    if (main) return (main.innerText || '').trim().length >= minMainText;
  }}
  return true;
}})()"#,
            indicators = indicators,
            mains = mains,
            coverage = self.min_viewport_coverage,
            min_text = self.min_main_text_length,
        )
    }
}

/// Outcome of one readiness signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SignalOutcome {
    Ready,
    Degraded { reason: String },
    NotApplicable,
}

impl SignalOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SignalOutcome::Degraded { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStats {
    pub total: usize,
    pub loaded: usize,
    pub errored: usize,
    pub stalled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub loader: SignalOutcome,
    pub images: SignalOutcome,
    pub image_stats: ImageStats,
    pub settle_ms: u64,
}

impl ReadinessReport {
    pub fn degraded(&self) -> bool {
        self.loader.is_degraded() || self.images.is_degraded()
    }

    /// `(signal, reason)` for every degraded signal
    pub fn degraded_signals(&self) -> Vec<(&'static str, &str)> {
        [("loader", &self.loader), ("images", &self.images)]
            .into_iter()
            .filter_map(|(name, outcome)| match outcome {
                SignalOutcome::Degraded { reason } => Some((name, reason.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// Post-navigation readiness: loader poll, concurrent image waits, settle
///
/// Best effort. A signal that runs out of budget is recorded as degraded and
/// the job moves on, unless the caller asked for a strict image wait.
pub struct ReadinessDetector {
    probe: String,
}

impl ReadinessDetector {
    pub fn new(heuristic: &LoaderHeuristic) -> Self {
        Self {
            probe: heuristic.script(),
        }
    }

    #[instrument(skip_all)]
    pub async fn evaluate(
        &self,
        context: &dyn ExecutionContext,
        plan: &ReadinessPlan,
    ) -> Result<ReadinessReport, RenderError> {
        let loader = self.wait_for_loaders(context, plan).await;
        let (images, image_stats) = self.wait_for_images(context, plan).await?;

        if !plan.settle_delay.is_zero() {
            debug!("Settling for {:?}", plan.settle_delay);
            sleep(plan.settle_delay).await;
        }

        Ok(ReadinessReport {
            loader,
            images,
            image_stats,
            settle_ms: plan.settle_delay.as_millis() as u64,
        })
    }

    async fn wait_for_loaders(
        &self,
        context: &dyn ExecutionContext,
        plan: &ReadinessPlan,
    ) -> SignalOutcome {
        let poll = async {
            let mut polls = 0usize;
            loop {
                polls += 1;
                if context.evaluate_predicate(&self.probe).await? {
                    return Ok::<usize, RenderError>(polls);
                }
                sleep(plan.poll_interval).await;
            }
        };

        match timeout(plan.loader_timeout, poll).await {
            Ok(Ok(polls)) => {
                debug!("No loading indicators after {} poll(s)", polls);
                SignalOutcome::Ready
            }
            Ok(Err(e)) => {
                warn!("Loader probe failed, continuing: {}", e);
                SignalOutcome::Degraded {
                    reason: format!("loader probe failed: {e}"),
                }
            }
            Err(_) => {
                warn!(
                    "Loading indicator still visible after {:?}, continuing",
                    plan.loader_timeout
                );
                SignalOutcome::Degraded {
                    reason: format!(
                        "loading indicator still visible after {:?}",
                        plan.loader_timeout
                    ),
                }
            }
        }
    }

    async fn wait_for_images(
        &self,
        context: &dyn ExecutionContext,
        plan: &ReadinessPlan,
    ) -> Result<(SignalOutcome, ImageStats), RenderError> {
        let total = match context.image_count().await {
            Ok(total) => total,
            Err(e) if plan.strict_image_wait => {
                return Err(RenderError::Readiness(format!("could not count images: {e}")))
            }
            Err(e) => {
                warn!("Could not count images, continuing: {}", e);
                let outcome = SignalOutcome::Degraded {
                    reason: format!("could not count images: {e}"),
                };
                return Ok((outcome, ImageStats::default()));
            }
        };

        if total == 0 {
            return Ok((SignalOutcome::NotApplicable, ImageStats::default()));
        }

        let cap = plan.per_image_timeout;
        let waits = (0..total).map(|index| timeout(cap, context.wait_for_image(index)));
        let results = join_all(waits).await;

        let mut stats = ImageStats {
            total,
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(Ok(ImageState::Loaded)) => stats.loaded += 1,
                Ok(Ok(ImageState::Errored | ImageState::Missing)) => stats.errored += 1,
                Ok(Err(e)) => {
                    debug!("Image wait failed: {}", e);
                    stats.stalled += 1;
                }
                Err(_) => stats.stalled += 1,
            }
        }

        if stats.stalled == 0 {
            debug!("{} image(s) settled ({} errored)", total, stats.errored);
            return Ok((SignalOutcome::Ready, stats));
        }

        let reason = format!(
            "{} of {} image(s) timed out after {:?}",
            stats.stalled, total, cap
        );
        if plan.strict_image_wait {
            return Err(RenderError::Readiness(reason));
        }

        warn!("Continuing with partially loaded images: {}", reason);
        Ok((SignalOutcome::Degraded { reason }, stats))
    }
}
