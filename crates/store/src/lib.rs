//! ISR store: per-params slots with atomic artifact swap and single-flight builds

#![forbid(unsafe_code)]

use std::any::Any;
use std::hash::BuildHasherDefault;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use isr_core::{Artifact, BuildOutput, BuildState, Clock, Freshness, Params, PlanError, PlanResult, SlotView};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHasher;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A build that has not been started yet.
pub type BuildFuture = BoxFuture<'static, PlanResult<BuildOutput>>;

type SharedBuild = Shared<BoxFuture<'static, PlanResult<Arc<Artifact>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

/// State for one param combination.
struct Slot {
    current: ArcSwapOption<Artifact>,
    /// Per-key exclusion for UNBUILT->BUILDING and STALE->BUILDING.
    inflight: Mutex<Option<SharedBuild>>,
    /// Lock-free mirror of `inflight.is_some()` for readers.
    building: AtomicBool,
    retry_after: Mutex<Option<DateTime<Utc>>>,
    generation: AtomicU64,
    /// Ticks once per settled build (success or failure).
    settled: watch::Sender<u64>,
}

impl Slot {
    fn new() -> Self {
        let (settled, _) = watch::channel(0u64);
        Self {
            current: ArcSwapOption::empty(),
            inflight: Mutex::new(None),
            building: AtomicBool::new(false),
            retry_after: Mutex::new(None),
            generation: AtomicU64::new(0),
            settled,
        }
    }

    fn view(&self) -> SlotView {
        SlotView {
            artifact: self.current.load_full().map(|a| a.stamp()),
            in_flight: self.building.load(Ordering::Acquire),
            retry_after: *lock(&self.retry_after),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Build only if nothing is served yet.
    Missing,
    /// Rebuild only if the served artifact is stale and not backing off.
    Stale,
    /// Rebuild regardless of freshness.
    Forced,
}

/// Totals since the store was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub builds_collapsed: u64,
}

struct Inner {
    slots: DashMap<Params, Arc<Slot>, BuildHasherDefault<FxHasher>>,
    clock: Arc<dyn Clock>,
    default_window: Option<Duration>,
    retry_backoff: Option<Duration>,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    collapsed: AtomicU64,
}

/// Keyed artifact store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<Inner>,
}

enum Outcome {
    Pending(SharedBuild),
    /// No build was needed; the served outcome at trigger time.
    Settled(PlanResult<Arc<Artifact>>),
}

/// Handle on an in-flight (or already settled) build.
pub struct BuildHandle {
    params: Params,
    outcome: Outcome,
    joined: bool,
    settled: watch::Receiver<u64>,
}

impl BuildHandle {
    pub fn params(&self) -> &Params { &self.params }

    /// True when this handle joined a build someone else started.
    pub fn joined(&self) -> bool { self.joined }

    /// Receiver that changes once the build settles.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.settled.clone() }

    /// The outcome if it is already known, without waiting.
    pub fn outcome(&self) -> Option<PlanResult<Arc<Artifact>>> {
        match &self.outcome {
            Outcome::Pending(shared) => shared.peek().cloned(),
            Outcome::Settled(res) => Some(res.clone()),
        }
    }

    /// Await the shared outcome; every waiter sees the same artifact or error.
    pub async fn wait(self) -> PlanResult<Arc<Artifact>> {
        match self.outcome {
            Outcome::Pending(shared) => shared.await,
            Outcome::Settled(res) => res,
        }
    }
}

impl ArtifactStore {
    pub fn new(clock: Arc<dyn Clock>, default_window: Option<Duration>, retry_backoff: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::with_hasher(BuildHasherDefault::default()),
                clock,
                default_window,
                retry_backoff,
                started: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                collapsed: AtomicU64::new(0),
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> { self.inner.clock.now() }

    fn slot(&self, params: &Params) -> Option<Arc<Slot>> {
        self.inner.slots.get(params).map(|s| Arc::clone(s.value()))
    }

    fn slot_or_insert(&self, params: &Params) -> Arc<Slot> {
        if let Some(s) = self.slot(params) { return s; }
        Arc::clone(self.inner.slots.entry(params.clone()).or_insert_with(|| Arc::new(Slot::new())).value())
    }

    /// Current artifact, fresh or stale. Never blocks on a build.
    pub fn get(&self, params: &Params) -> Option<Arc<Artifact>> {
        self.slot(params).and_then(|s| s.current.load_full())
    }

    pub fn view(&self, params: &Params) -> SlotView {
        self.slot(params).map(|s| s.view()).unwrap_or_default()
    }

    pub fn state(&self, params: &Params) -> BuildState { self.view(params).state(self.now()) }

    /// Receiver ticking whenever a build for `params` settles. `None` for
    /// keys with neither an artifact nor a build in flight.
    pub fn subscribe(&self, params: &Params) -> Option<watch::Receiver<u64>> {
        self.slot(params).map(|s| s.settled.subscribe())
    }

    /// Whether `slot` is still the one registered for `params`.
    fn is_registered(&self, params: &Params, slot: &Arc<Slot>) -> bool {
        self.inner.slots.get(params).is_some_and(|s| Arc::ptr_eq(s.value(), slot))
    }

    /// Build unless an artifact is already served; joins an in-flight build.
    pub fn ensure_built<F>(&self, params: &Params, make: F) -> BuildHandle
    where
        F: FnOnce() -> BuildFuture,
    {
        match self.trigger(params, Trigger::Missing, make) {
            Ok(h) => h,
            Err(existing) => self.ready_handle(params, existing),
        }
    }

    /// Schedule one background rebuild of a stale artifact. `None` when the
    /// artifact is fresh, missing, backing off, or a build is already in flight.
    pub fn revalidate<F>(&self, params: &Params, make: F) -> Option<BuildHandle>
    where
        F: FnOnce() -> BuildFuture,
    {
        self.trigger(params, Trigger::Stale, make).ok().filter(|h| !h.joined)
    }

    /// Rebuild regardless of freshness; joins an in-flight build.
    pub fn rebuild<F>(&self, params: &Params, make: F) -> BuildHandle
    where
        F: FnOnce() -> BuildFuture,
    {
        match self.trigger(params, Trigger::Forced, make) {
            Ok(h) => h,
            Err(existing) => self.ready_handle(params, existing),
        }
    }

    fn ready_handle(&self, params: &Params, outcome: PlanResult<Arc<Artifact>>) -> BuildHandle {
        // An untracked key never ticks; hand out a receiver whose sender is gone.
        let settled = self.subscribe(params).unwrap_or_else(|| watch::channel(0u64).1);
        BuildHandle { params: params.clone(), outcome: Outcome::Settled(outcome), joined: true, settled }
    }

    /// `Err` carries the served outcome when no build was needed.
    fn trigger<F>(&self, params: &Params, trigger: Trigger, make: F) -> Result<BuildHandle, PlanResult<Arc<Artifact>>>
    where
        F: FnOnce() -> BuildFuture,
    {
        loop {
            let slot = match trigger {
                Trigger::Stale => match self.slot(params) {
                    Some(s) => s,
                    None => return Err(Err(PlanError::NotFound(params.clone()))),
                },
                Trigger::Missing | Trigger::Forced => self.slot_or_insert(params),
            };
            let mut guard = lock(&slot.inflight);
            // A settling build may have reclaimed the slot before we got its lock.
            if !self.is_registered(params, &slot) {
                continue;
            }
            if let Some(shared) = guard.as_ref() {
                self.inner.collapsed.fetch_add(1, Ordering::Relaxed);
                counter!("isr_builds_collapsed_total", 1u64);
                debug!(params = %params, ?trigger, "joining in-flight build");
                let outcome = Outcome::Pending(shared.clone());
                return Ok(BuildHandle { params: params.clone(), outcome, joined: true, settled: slot.settled.subscribe() });
            }
            // Re-check under the key lock: a build may have settled since the caller looked.
            let current = slot.current.load_full();
            let now = self.now();
            match (trigger, &current) {
                (Trigger::Missing, Some(a)) => return Err(Ok(Arc::clone(a))),
                (Trigger::Stale, None) => return Err(Err(PlanError::NotFound(params.clone()))),
                (Trigger::Stale, Some(a)) => {
                    let backing_off = lock(&slot.retry_after).is_some_and(|t| now < t);
                    if a.freshness(now) == Freshness::Fresh || backing_off { return Err(Ok(Arc::clone(a))); }
                }
                _ => {}
            }
            let shared = self.launch(params.clone(), Arc::clone(&slot), make());
            *guard = Some(shared.clone());
            slot.building.store(true, Ordering::Release);
            drop(guard);

            self.inner.started.fetch_add(1, Ordering::Relaxed);
            counter!("isr_builds_started_total", 1u64);
            debug!(params = %params, ?trigger, "build started");
            // Runs to completion even if every caller goes away.
            tokio::spawn(shared.clone());
            let settled = slot.settled.subscribe();
            return Ok(BuildHandle { params: params.clone(), outcome: Outcome::Pending(shared), joined: false, settled });
        }
    }

    fn launch(&self, params: Params, slot: Arc<Slot>, build: BuildFuture) -> SharedBuild {
        let inner = Arc::clone(&self.inner);
        async move {
            let started = Instant::now();
            let outcome = match AssertUnwindSafe(build).catch_unwind().await {
                Ok(res) => res,
                Err(panic) => Err(PlanError::build_failed(&params, format!("build panicked: {}", panic_message(&*panic)))),
            };
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            histogram!("isr_build_ms", elapsed_ms);
            let res = match outcome {
                Ok(out) => {
                    let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let art = Arc::new(Artifact::from_output(params.clone(), out, inner.clock.now(), inner.default_window, generation));
                    slot.current.store(Some(Arc::clone(&art)));
                    *lock(&slot.retry_after) = None;
                    inner.succeeded.fetch_add(1, Ordering::Relaxed);
                    info!(params = %params, generation, elapsed_ms, "artifact built");
                    Ok(art)
                }
                Err(PlanError::EntityNotFound(p)) => {
                    // Not cached either way: drop whatever was served.
                    if slot.current.swap(None).is_some() {
                        info!(params = %params, "entity gone upstream; artifact evicted");
                    }
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("isr_builds_failed_total", 1u64, "kind" => "entity_not_found");
                    Err(PlanError::EntityNotFound(p))
                }
                Err(e) => {
                    if slot.current.load().is_some() {
                        let retry_after = inner
                            .retry_backoff
                            .and_then(|b| chrono::Duration::from_std(b).ok())
                            .map(|b| inner.clock.now() + b);
                        *lock(&slot.retry_after) = retry_after;
                    }
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("isr_builds_failed_total", 1u64, "kind" => e.kind());
                    warn!(params = %params, error = %e, elapsed_ms, "build failed");
                    Err(e)
                }
            };
            {
                let mut g = lock(&slot.inflight);
                *g = None;
                slot.building.store(false, Ordering::Release);
                if slot.current.load().is_none() {
                    inner.reclaim(&params, &slot);
                }
            }
            slot.settled.send_modify(|n| *n += 1);
            gauge!("isr_artifacts", inner.artifact_count() as f64);
            res
        }
        .boxed()
        .shared()
    }

    /// Drop the served artifact for `params`. In-flight builds still land;
    /// otherwise the key is forgotten.
    pub fn evict(&self, params: &Params) -> Option<Arc<Artifact>> {
        let slot = self.slot(params)?;
        let old = {
            let guard = lock(&slot.inflight);
            let old = slot.current.swap(None);
            if guard.is_none() {
                self.inner.reclaim(params, &slot);
            }
            old
        };
        if old.is_some() {
            gauge!("isr_artifacts", self.inner.artifact_count() as f64);
        }
        old
    }

    /// Number of combinations currently serving an artifact.
    pub fn len(&self) -> usize { self.inner.artifact_count() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Combinations that currently serve an artifact, sorted.
    pub fn keys(&self) -> Vec<Params> {
        let mut out: Vec<Params> = self
            .inner
            .slots
            .iter()
            .filter(|e| e.value().current.load().is_some())
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    /// Count of tracked combinations per state.
    pub fn state_counts(&self) -> Vec<(BuildState, usize)> {
        let now = self.now();
        let mut counts = [0usize; 4];
        for e in self.inner.slots.iter() {
            let idx = match e.value().view().state(now) {
                BuildState::Unbuilt => 0,
                BuildState::Building => 1,
                BuildState::Fresh => 2,
                BuildState::Stale => 3,
            };
            counts[idx] += 1;
        }
        vec![
            (BuildState::Unbuilt, counts[0]),
            (BuildState::Building, counts[1]),
            (BuildState::Fresh, counts[2]),
            (BuildState::Stale, counts[3]),
        ]
    }

    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            builds_started: self.inner.started.load(Ordering::Relaxed),
            builds_succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            builds_failed: self.inner.failed.load(Ordering::Relaxed),
            builds_collapsed: self.inner.collapsed.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn artifact_count(&self) -> usize {
        self.slots.iter().filter(|e| e.value().current.load().is_some()).count()
    }

    /// Forget a key that serves nothing. Caller holds the slot's `inflight` lock.
    fn reclaim(&self, params: &Params, slot: &Arc<Slot>) {
        if self.slots.remove_if(params, |_, s| Arc::ptr_eq(s, slot)).is_some() {
            debug!(params = %params, "slot reclaimed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}
