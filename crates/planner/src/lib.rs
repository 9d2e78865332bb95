//! ISR page build planner.
//!
//! Decides, for one dynamic route, which param combinations are built before
//! traffic, which are built on first request, and when a served artifact is
//! rebuilt in the background. Hosts call [`Planner::prebuild`] once at deploy
//! time and [`Planner::resolve_request`] once per request, and map the result
//! to their own responses (404 page, loading UI, rendered content).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use isr_core::{
    decide, Artifact, BuildMode, BuildState, Clock, Disposition, ParamSet, Params, PlanError, PlanResult, PlannerConfig,
    RouteTemplate, SlotView, SystemClock,
};
use isr_store::{ArtifactStore, BuildFuture, BuildHandle, StoreCounters};
use isr_upstream::DataSource;
use metrics::counter;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod builder;

pub use builder::{JsonRenderer, PageBuilder, Renderer, UpstreamPageBuilder};
pub use isr_core::prelude;

/// Outcome of one request.
#[derive(Debug)]
pub enum Resolution {
    Fresh(Arc<Artifact>),
    /// Window elapsed; served as-is while `revalidating` says whether a rebuild is running.
    Stale { artifact: Arc<Artifact>, revalidating: bool },
    /// Loading fallback: show a placeholder and re-render once the build settles.
    Placeholder(PendingBuild),
}

impl Resolution {
    pub fn artifact(&self) -> Option<&Arc<Artifact>> {
        match self {
            Resolution::Fresh(a) | Resolution::Stale { artifact: a, .. } => Some(a),
            Resolution::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool { matches!(self, Resolution::Placeholder(_)) }

    pub fn is_stale(&self) -> bool { matches!(self, Resolution::Stale { .. }) }
}

/// A build the caller was not made to wait for.
pub struct PendingBuild {
    handle: BuildHandle,
}

impl PendingBuild {
    pub fn params(&self) -> &Params { self.handle.params() }

    /// Changes once the build settles; the host's cue to re-render.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.handle.subscribe() }

    pub async fn wait(self) -> PlanResult<Arc<Artifact>> { self.handle.wait().await }
}

impl std::fmt::Debug for PendingBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBuild").field("params", self.params()).finish()
    }
}

/// Result of the deploy-time build phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrebuildReport {
    pub built: Vec<Params>,
    /// Upstream said these do not exist; skipped and not cached.
    pub not_found: Vec<Params>,
    pub failed: Vec<(Params, String)>,
}

impl PrebuildReport {
    pub fn is_clean(&self) -> bool { self.failed.is_empty() }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerStats {
    pub build_mode: BuildMode,
    pub artifacts: usize,
    pub unbuilt: usize,
    pub building: usize,
    pub fresh: usize,
    pub stale: usize,
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub builds_collapsed: u64,
}

/// Planner for one route template.
pub struct Planner {
    template: RouteTemplate,
    config: PlannerConfig,
    store: ArtifactStore,
    builder: Arc<dyn PageBuilder>,
}

impl Planner {
    pub fn new(template: RouteTemplate, config: PlannerConfig, builder: Arc<dyn PageBuilder>) -> Self {
        Self::with_clock(template, config, builder, Arc::new(SystemClock))
    }

    pub fn with_clock(template: RouteTemplate, config: PlannerConfig, builder: Arc<dyn PageBuilder>, clock: Arc<dyn Clock>) -> Self {
        let store = ArtifactStore::new(clock, config.revalidate, config.retry_backoff);
        info!(route = %template.pattern, mode = %config.build_mode, revalidate = ?config.revalidate, "planner: ready");
        Self { template, config, store, builder }
    }

    pub fn template(&self) -> &RouteTemplate { &self.template }
    pub fn config(&self) -> &PlannerConfig { &self.config }
    pub fn store(&self) -> &ArtifactStore { &self.store }

    fn build_fn(&self, params: &Params) -> impl FnOnce() -> BuildFuture {
        let builder = Arc::clone(&self.builder);
        let params = params.clone();
        move || async move { builder.build(&params).await }.boxed()
    }

    /// Unique, template-valid combinations to build before taking traffic,
    /// in first-seen order and capped at `eager_limit`.
    pub fn plan_eager_builds(&self, set: &ParamSet) -> Vec<Params> {
        let mut seen: FxHashSet<&Params> = FxHashSet::default();
        let mut out = Vec::new();
        for p in set {
            if let Err(e) = self.template.validate(p) {
                warn!(params = %p, error = %e, "planner: skipping invalid eager params");
                continue;
            }
            if seen.insert(p) { out.push(p.clone()); }
        }
        if let Some(limit) = self.config.eager_limit {
            out.truncate(limit);
        }
        debug!(requested = set.len(), planned = out.len(), "planner: eager plan");
        out
    }

    /// Build every planned combination. Builds are independent and run concurrently.
    pub async fn prebuild(&self, set: &ParamSet) -> PrebuildReport {
        let t0 = Instant::now();
        let planned = self.plan_eager_builds(set);
        let waits = planned.iter().map(|p| {
            let handle = self.store.ensure_built(p, self.build_fn(p));
            let p = p.clone();
            async move { (p, handle.wait().await) }
        });
        let mut report = PrebuildReport::default();
        for (p, res) in futures::future::join_all(waits).await {
            match res {
                Ok(_) => report.built.push(p),
                Err(PlanError::EntityNotFound(_)) => report.not_found.push(p),
                Err(e) => report.failed.push((p, e.to_string())),
            }
        }
        info!(
            built = report.built.len(),
            not_found = report.not_found.len(),
            failed = report.failed.len(),
            took_ms = %t0.elapsed().as_millis(),
            "planner: prebuild done"
        );
        report
    }

    /// Decide and act on one request for `params`.
    pub async fn resolve_request(&self, params: &Params) -> PlanResult<Resolution> {
        self.template.validate(params)?;
        let current = self.store.get(params);
        let view = SlotView { artifact: current.as_ref().map(|a| a.stamp()), ..self.store.view(params) };
        let disposition = decide(view, self.config.build_mode, self.store.now());
        counter!("isr_requests_total", 1u64, "disposition" => disposition.as_str());
        debug!(params = %params, disposition = disposition.as_str(), "planner: resolve");

        match (disposition, current) {
            (Disposition::ServeFresh, Some(artifact)) => Ok(Resolution::Fresh(artifact)),
            (Disposition::ServeStaleAndRevalidate, Some(artifact)) => {
                if self.store.revalidate(params, self.build_fn(params)).is_some() {
                    debug!(params = %params, generation = artifact.generation, "planner: background rebuild scheduled");
                }
                Ok(Resolution::Stale { artifact, revalidating: self.store.view(params).in_flight })
            }
            (Disposition::ServeStale, Some(artifact)) => Ok(Resolution::Stale { artifact, revalidating: view.in_flight }),
            (Disposition::Reject, _) => Err(PlanError::NotFound(params.clone())),
            (Disposition::ServePlaceholderAndBuild | Disposition::PlaceholderInFlight, _) => {
                let handle = self.store.ensure_built(params, self.build_fn(params));
                // The build may have landed after the snapshot was taken.
                if let Some(Ok(artifact)) = handle.outcome() {
                    return Ok(Resolution::Fresh(artifact));
                }
                Ok(Resolution::Placeholder(PendingBuild { handle }))
            }
            (Disposition::BuildAndWait | Disposition::AwaitInFlight, _) => {
                let artifact = self.store.ensure_built(params, self.build_fn(params)).wait().await?;
                Ok(Resolution::Fresh(artifact))
            }
            // Artifact dispositions always come with an artifact.
            (_, None) => Err(PlanError::NotFound(params.clone())),
        }
    }

    /// On-demand revalidation: rebuild now regardless of the window.
    /// A closed set (`EagerAll`) is never extended this way.
    pub async fn revalidate_now(&self, params: &Params) -> PlanResult<Arc<Artifact>> {
        self.template.validate(params)?;
        if self.config.build_mode == BuildMode::EagerAll && self.store.get(params).is_none() {
            return Err(PlanError::NotFound(params.clone()));
        }
        info!(params = %params, "planner: on-demand revalidation");
        self.store.rebuild(params, self.build_fn(params)).wait().await
    }

    pub fn state(&self, params: &Params) -> BuildState { self.store.state(params) }

    /// Receiver that changes whenever a build for `params` settles; `None`
    /// while the key is neither served nor building.
    pub fn subscribe(&self, params: &Params) -> Option<watch::Receiver<u64>> { self.store.subscribe(params) }

    pub fn stats(&self) -> PlannerStats {
        let mut stats = PlannerStats {
            build_mode: self.config.build_mode,
            artifacts: self.store.len(),
            unbuilt: 0,
            building: 0,
            fresh: 0,
            stale: 0,
            builds_started: 0,
            builds_succeeded: 0,
            builds_failed: 0,
            builds_collapsed: 0,
        };
        for (state, n) in self.store.state_counts() {
            match state {
                BuildState::Unbuilt => stats.unbuilt = n,
                BuildState::Building => stats.building = n,
                BuildState::Fresh => stats.fresh = n,
                BuildState::Stale => stats.stale = n,
            }
        }
        let StoreCounters { builds_started, builds_succeeded, builds_failed, builds_collapsed } = self.store.counters();
        stats.builds_started = builds_started;
        stats.builds_succeeded = builds_succeeded;
        stats.builds_failed = builds_failed;
        stats.builds_collapsed = builds_collapsed;
        stats
    }
}

/// Turn upstream's candidate ids into a param set for a single-param template.
pub async fn param_set_from_upstream(source: &dyn DataSource, template: &RouteTemplate) -> anyhow::Result<ParamSet> {
    let [name] = template.params.as_slice() else {
        anyhow::bail!("{} has {} params; upstream ids bind exactly one", template.pattern, template.params.len());
    };
    let ids = source.fetch_ids().await?;
    info!(route = %template.pattern, count = ids.len(), "planner: candidate ids fetched");
    Ok(ParamSet::from_values(name, ids))
}
