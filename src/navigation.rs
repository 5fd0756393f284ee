use crate::engine::{ExecutionContext, WaitCondition};
use crate::error::RenderError;
use crate::filter::ResourceFilter;
use crate::job::Viewport;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument};
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationPlan {
    pub wait: WaitCondition,
    pub timeout: Duration,
    pub filter: ResourceFilter,
    /// Emulated viewport, applied before anything loads
    pub viewport: Option<Viewport>,
}

/// Loads job input into a context, bounded by the plan's budget
#[derive(Debug, Default, Clone, Copy)]
pub struct NavigationController;

impl NavigationController {
    #[instrument(skip_all, fields(bytes = html.len(), wait = %plan.wait))]
    pub async fn load_content(
        &self,
        context: &dyn ExecutionContext,
        html: &str,
        plan: &NavigationPlan,
    ) -> Result<(), RenderError> {
        self.prepare(context, plan).await?;
        bounded(plan, context.load_content(html, &plan.wait)).await?;
        debug!("Content loaded");
        Ok(())
    }

    #[instrument(skip_all, fields(url = %url, wait = %plan.wait))]
    pub async fn navigate(
        &self,
        context: &dyn ExecutionContext,
        url: &Url,
        plan: &NavigationPlan,
    ) -> Result<(), RenderError> {
        self.prepare(context, plan).await?;
        bounded(plan, context.navigate(url, &plan.wait)).await?;
        debug!("Navigated");
        Ok(())
    }

    async fn prepare(
        &self,
        context: &dyn ExecutionContext,
        plan: &NavigationPlan,
    ) -> Result<(), RenderError> {
        if let Some(viewport) = &plan.viewport {
            context.set_viewport(viewport).await?;
        }

        if plan.filter.is_enabled() {
            context.install_request_filter(&plan.filter).await?;
            info!(
                "Blocking resource types: {}",
                plan.filter
                    .blocked()
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(())
    }
}

async fn bounded<F>(plan: &NavigationPlan, load: F) -> Result<(), RenderError>
where
    F: Future<Output = Result<(), RenderError>>,
{
    match timeout(plan.timeout, load).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(into_navigation_error(err)),
        Err(_) => Err(RenderError::NavigationTimeout {
            condition: plan.wait.to_string(),
            budget: plan.timeout,
        }),
    }
}

fn into_navigation_error(err: RenderError) -> RenderError {
    match err {
        RenderError::Engine(message) => RenderError::Navigation(message),
        other => other,
    }
}
