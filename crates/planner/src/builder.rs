//! Page builders: turn one param combination into a `BuildOutput`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use isr_core::{BuildOutput, Params, PlanError, PlanResult, RouteTemplate};
use isr_upstream::DataSource;
use tracing::debug;

/// Produces the content for one combination. Called at most once at a time per key.
#[async_trait::async_trait]
pub trait PageBuilder: Send + Sync {
    async fn build(&self, params: &Params) -> PlanResult<BuildOutput>;
}

/// Turns a data snapshot into page content.
pub trait Renderer: Send + Sync {
    fn render(&self, template: &RouteTemplate, params: &Params, data: &serde_json::Value) -> anyhow::Result<String>;
}

/// Renders the data snapshot as pretty JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn render(&self, _template: &RouteTemplate, _params: &Params, data: &serde_json::Value) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(data)?)
    }
}

/// Fetches the entity named by one route param and renders it.
pub struct UpstreamPageBuilder {
    template: RouteTemplate,
    source: Arc<dyn DataSource>,
    renderer: Arc<dyn Renderer>,
    id_param: String,
    revalidate_field: Option<String>,
}

impl UpstreamPageBuilder {
    /// Uses the template's first param as the upstream id.
    pub fn new(template: RouteTemplate, source: Arc<dyn DataSource>) -> Self {
        let id_param = template.params.first().cloned().unwrap_or_else(|| "id".to_string());
        Self { template, source, renderer: Arc::new(JsonRenderer), id_param, revalidate_field: None }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self { self.renderer = renderer; self }

    pub fn with_id_param(mut self, name: impl Into<String>) -> Self { self.id_param = name.into(); self }

    /// Entity field (whole seconds) that overrides the staleness window for that page.
    pub fn with_revalidate_field(mut self, field: impl Into<String>) -> Self {
        self.revalidate_field = Some(field.into());
        self
    }
}

#[async_trait::async_trait]
impl PageBuilder for UpstreamPageBuilder {
    async fn build(&self, params: &Params) -> PlanResult<BuildOutput> {
        let t0 = Instant::now();
        let id = params
            .get(&self.id_param)
            .ok_or_else(|| PlanError::InvalidParams(format!("{} has no {} param", params, self.id_param)))?;
        let data = match self.source.fetch_entity(id).await {
            Ok(Some(v)) => v,
            Ok(None) => return Err(PlanError::EntityNotFound(params.clone())),
            Err(e) => return Err(PlanError::build_failed(params, format!("{:#}", e))),
        };
        let content = self
            .renderer
            .render(&self.template, params, &data)
            .map_err(|e| PlanError::build_failed(params, format!("render: {:#}", e)))?;
        let revalidate = self
            .revalidate_field
            .as_deref()
            .and_then(|f| data.get(f))
            .and_then(|v| v.as_u64())
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        debug!(params = %params, bytes = content.len(), took_ms = %t0.elapsed().as_millis(), "planner: page rendered");
        Ok(BuildOutput { content, data, revalidate })
    }
}
