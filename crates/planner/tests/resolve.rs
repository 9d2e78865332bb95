#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use isr_core::{BuildMode, BuildOutput, BuildState, ManualClock, ParamSet, Params, PlanError, PlanResult, PlannerConfig, RouteTemplate};
use isr_planner::{PageBuilder, Planner, Resolution};
use tokio::sync::Semaphore;

/// Counts builds; content is `<params>#<n>` so rebuilds are distinguishable.
#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
    failing: AtomicBool,
    panicking: AtomicBool,
    gate: Option<Arc<Semaphore>>,
}

impl Counting {
    fn gated(gate: Arc<Semaphore>) -> Self { Self { gate: Some(gate), ..Default::default() } }
    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl PageBuilder for Counting {
    async fn build(&self, params: &Params) -> PlanResult<BuildOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if self.panicking.swap(false, Ordering::SeqCst) {
            panic!("template error while rendering {}", params);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlanError::build_failed(params, "upstream down"));
        }
        Ok(BuildOutput { content: format!("{}#{}", params, n), data: serde_json::json!({ "n": n }), revalidate: None })
    }
}

fn id(v: &str) -> Params { Params::single("id", v) }

fn planner(mode: BuildMode, window_secs: Option<u64>, builder: Arc<Counting>) -> (Planner, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let cfg = PlannerConfig::default()
        .with_build_mode(mode)
        .with_revalidate(window_secs.map(Duration::from_secs));
    let template = RouteTemplate::parse("/items/[id]").unwrap();
    (Planner::with_clock(template, cfg, builder, clock.clone()), clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eager_all_serves_planned_set_and_rejects_the_rest() {
    let b = Arc::new(Counting::default());
    let (p, _clock) = planner(BuildMode::EagerAll, None, b.clone());
    let set = ParamSet::from_values("id", ["1", "2", "3"]);

    assert_eq!(p.plan_eager_builds(&set), vec![id("1"), id("2"), id("3")]);
    let report = p.prebuild(&set).await;
    assert_eq!(report.built.len(), 3);
    assert!(report.is_clean());
    assert_eq!(b.calls(), 3);

    for v in ["1", "2", "3"] {
        let r = p.resolve_request(&id(v)).await.unwrap();
        assert!(matches!(r, Resolution::Fresh(_)));
    }
    assert_eq!(b.calls(), 3, "planned artifacts are served without building");

    for _ in 0..5 {
        assert_eq!(p.resolve_request(&id("4")).await.unwrap_err(), PlanError::NotFound(id("4")));
    }
    assert_eq!(b.calls(), 3);
    assert_eq!(p.state(&id("4")), BuildState::Unbuilt);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eager_plan_dedups_validates_and_caps() {
    let b = Arc::new(Counting::default());
    let clock = Arc::new(ManualClock::default());
    let cfg = PlannerConfig::default().with_eager_limit(Some(2));
    let p = Planner::with_clock(RouteTemplate::parse("/items/[id]").unwrap(), cfg, b, clock);

    let mut set = ParamSet::from_values("id", ["3", "1", "3", "2"]);
    set.push(Params::single("slug", "nope"));
    assert_eq!(p.plan_eager_builds(&set), vec![id("3"), id("1")]);
    assert!(p.plan_eager_builds(&ParamSet::new()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_fallback_builds_once_and_returns_artifact() {
    let b = Arc::new(Counting::default());
    let (p, _clock) = planner(BuildMode::EagerSubsetWithBlockingFallback, None, b.clone());

    let r = p.resolve_request(&id("9")).await.unwrap();
    let a = r.artifact().expect("blocking fallback never yields a placeholder").clone();
    assert!(!r.is_placeholder());
    assert_eq!(a.content, "id=9#1");
    assert_eq!(b.calls(), 1);

    let again = p.resolve_request(&id("9")).await.unwrap();
    assert!(Arc::ptr_eq(again.artifact().unwrap(), &a));
    assert_eq!(b.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loading_fallback_placeholder_then_fresh() {
    let gate = Arc::new(Semaphore::new(0));
    let b = Arc::new(Counting::gated(gate.clone()));
    let (p, _clock) = planner(BuildMode::EagerSubsetWithLoadingFallback, None, b.clone());

    let first = p.resolve_request(&id("5")).await.unwrap();
    let Resolution::Placeholder(pending) = first else { panic!("expected a placeholder") };
    assert_eq!(pending.params(), &id("5"));
    assert_eq!(p.state(&id("5")), BuildState::Building);

    // A second request while building also gets a placeholder and no new build.
    assert!(p.resolve_request(&id("5")).await.unwrap().is_placeholder());

    let mut rerender = pending.subscribe();
    gate.add_permits(1);
    rerender.changed().await.unwrap();
    let built = pending.wait().await.unwrap();

    let next = p.resolve_request(&id("5")).await.unwrap();
    assert!(matches!(&next, Resolution::Fresh(a) if Arc::ptr_eq(a, &built)));
    assert_eq!(b.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_new_params_single_flight() {
    let gate = Arc::new(Semaphore::new(0));
    let b = Arc::new(Counting::gated(gate.clone()));
    let (p, _clock) = planner(BuildMode::EagerSubsetWithBlockingFallback, None, b.clone());
    let p = Arc::new(p);

    let mut tasks = Vec::new();
    for _ in 0..24 {
        let p = Arc::clone(&p);
        tasks.push(tokio::spawn(async move { p.resolve_request(&id("42")).await }));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    gate.add_permits(1);

    let mut artifacts = Vec::new();
    for t in tasks {
        let r = t.await.unwrap().unwrap();
        artifacts.push(r.artifact().unwrap().clone());
    }
    assert_eq!(b.calls(), 1);
    assert!(artifacts.iter().all(|a| Arc::ptr_eq(a, &artifacts[0])));
    let stats = p.stats();
    assert_eq!(stats.builds_started, 1);
    assert!(stats.builds_collapsed >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_while_revalidate_timeline() {
    let b = Arc::new(Counting::default());
    let (p, clock) = planner(BuildMode::EagerSubsetWithBlockingFallback, Some(30), b.clone());
    assert!(p.prebuild(&ParamSet::new()).await.built.is_empty());

    // t=0: built on first request.
    let a = p.resolve_request(&id("7")).await.unwrap().artifact().unwrap().clone();
    assert_eq!(a.content, "id=7#1");

    // t=10: same artifact, no rebuild.
    clock.advance(Duration::from_secs(10));
    let r = p.resolve_request(&id("7")).await.unwrap();
    assert!(matches!(&r, Resolution::Fresh(x) if Arc::ptr_eq(x, &a)));
    assert_eq!(b.calls(), 1);

    // t=35: old artifact returned immediately, one rebuild scheduled.
    clock.advance(Duration::from_secs(25));
    let mut settled = p.subscribe(&id("7")).unwrap();
    let r = p.resolve_request(&id("7")).await.unwrap();
    assert!(r.is_stale());
    assert!(Arc::ptr_eq(r.artifact().unwrap(), &a));
    settled.changed().await.unwrap();
    assert_eq!(b.calls(), 2);

    // t=36: the rebuilt artifact.
    clock.advance(Duration::from_secs(1));
    let r = p.resolve_request(&id("7")).await.unwrap();
    let fresh = r.artifact().unwrap();
    assert!(matches!(r, Resolution::Fresh(_)));
    assert_eq!(fresh.content, "id=7#2");
    assert_eq!(fresh.generation, 2);
    assert_eq!(b.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_triggers_collapse_into_one_rebuild() {
    let gate = Arc::new(Semaphore::new(1));
    let b = Arc::new(Counting::gated(gate.clone()));
    let (p, clock) = planner(BuildMode::EagerAll, Some(30), b.clone());
    p.prebuild(&ParamSet::from_values("id", ["1"])).await;
    assert_eq!(b.calls(), 1);
    // The first permit was returned; take it so the rebuild blocks.
    let held = gate.clone().acquire_owned().await.unwrap();

    clock.advance(Duration::from_secs(31));
    for _ in 0..10 {
        let r = p.resolve_request(&id("1")).await.unwrap();
        assert!(matches!(r, Resolution::Stale { ref artifact, revalidating: true } if artifact.generation == 1));
    }
    assert_eq!(p.state(&id("1")), BuildState::Building);

    let mut settled = p.subscribe(&id("1")).unwrap();
    drop(held);
    settled.changed().await.unwrap();
    assert_eq!(b.calls(), 2, "one rebuild for many stale hits");
    assert_eq!(p.state(&id("1")), BuildState::Fresh);
    assert_eq!(p.store().get(&id("1")).unwrap().generation, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_builds_surface_and_allow_retry() {
    let b = Arc::new(Counting::default());
    let (p, clock) = planner(BuildMode::EagerSubsetWithBlockingFallback, Some(30), b.clone());

    b.failing.store(true, Ordering::SeqCst);
    let err = p.resolve_request(&id("1")).await.unwrap_err();
    assert!(matches!(err, PlanError::BuildFailed { .. }));
    assert_eq!(p.state(&id("1")), BuildState::Unbuilt);

    b.failing.store(false, Ordering::SeqCst);
    let a = p.resolve_request(&id("1")).await.unwrap().artifact().unwrap().clone();
    assert_eq!(a.generation, 1);

    // Background rebuild fails: stale artifact keeps being served.
    b.failing.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_secs(30));
    let mut settled = p.subscribe(&id("1")).unwrap();
    assert!(p.resolve_request(&id("1")).await.unwrap().is_stale());
    settled.changed().await.unwrap();
    assert_eq!(p.state(&id("1")), BuildState::Stale);
    assert_eq!(p.stats().builds_failed, 2);
    let r = p.resolve_request(&id("1")).await.unwrap();
    assert!(Arc::ptr_eq(r.artifact().unwrap(), &a));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_params_are_rejected_up_front() {
    let b = Arc::new(Counting::default());
    let (p, _clock) = planner(BuildMode::EagerSubsetWithBlockingFallback, None, b.clone());
    let err = p.resolve_request(&Params::single("slug", "x")).await.unwrap_err();
    assert!(matches!(err, PlanError::InvalidParams(_)));
    assert!(err.is_terminal());
    assert_eq!(b.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_builder_does_not_wedge_the_key() {
    let b = Arc::new(Counting::default());
    b.panicking.store(true, Ordering::SeqCst);
    let (p, _clock) = planner(BuildMode::EagerSubsetWithBlockingFallback, None, b.clone());

    let err = p.resolve_request(&id("1")).await.unwrap_err();
    assert!(matches!(err, PlanError::BuildFailed { ref reason, .. } if reason.contains("template error")));
    assert_eq!(p.state(&id("1")), BuildState::Unbuilt);

    let r = p.resolve_request(&id("1")).await.unwrap();
    assert_eq!(r.artifact().unwrap().content, "id=1#2");
    assert_eq!(p.state(&id("1")), BuildState::Fresh);
}
