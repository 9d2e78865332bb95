//! Request disposition: the pure part of the planner.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildMode, BuildState, Freshness};

/// Build time and window of a served artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stamp {
    pub built_at: DateTime<Utc>,
    pub revalidate: Option<Duration>,
}

impl Stamp {
    /// Clock skew (build time in the future) counts as zero age.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.built_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        match self.revalidate {
            Some(window) if self.age(now) >= window => Freshness::Stale,
            _ => Freshness::Fresh,
        }
    }
}

/// Snapshot of one key's slot, taken without blocking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotView {
    pub artifact: Option<Stamp>,
    pub in_flight: bool,
    /// Background rebuilds are suppressed until this instant after a failure.
    pub retry_after: Option<DateTime<Utc>>,
}

impl SlotView {
    pub fn state(&self, now: DateTime<Utc>) -> BuildState {
        match self.artifact {
            None if self.in_flight => BuildState::Building,
            None => BuildState::Unbuilt,
            Some(_) if self.in_flight => BuildState::Building,
            Some(s) => match s.freshness(now) {
                Freshness::Fresh => BuildState::Fresh,
                Freshness::Stale => BuildState::Stale,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    ServeFresh,
    /// Serve the stale artifact and schedule one background rebuild.
    ServeStaleAndRevalidate,
    /// Serve the stale artifact; a rebuild is in flight or backing off.
    ServeStale,
    Reject,
    ServePlaceholderAndBuild,
    PlaceholderInFlight,
    BuildAndWait,
    AwaitInFlight,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::ServeFresh => "serve_fresh",
            Disposition::ServeStaleAndRevalidate => "serve_stale_and_revalidate",
            Disposition::ServeStale => "serve_stale",
            Disposition::Reject => "reject",
            Disposition::ServePlaceholderAndBuild => "serve_placeholder_and_build",
            Disposition::PlaceholderInFlight => "placeholder_in_flight",
            Disposition::BuildAndWait => "build_and_wait",
            Disposition::AwaitInFlight => "await_in_flight",
        }
    }

    pub fn starts_build(&self) -> bool {
        matches!(self, Disposition::ServeStaleAndRevalidate | Disposition::ServePlaceholderAndBuild | Disposition::BuildAndWait)
    }
}

pub fn decide(view: SlotView, mode: BuildMode, now: DateTime<Utc>) -> Disposition {
    if let Some(stamp) = view.artifact {
        return match stamp.freshness(now) {
            Freshness::Fresh => Disposition::ServeFresh,
            Freshness::Stale if view.in_flight => Disposition::ServeStale,
            Freshness::Stale if view.retry_after.is_some_and(|t| now < t) => Disposition::ServeStale,
            Freshness::Stale => Disposition::ServeStaleAndRevalidate,
        };
    }
    match (mode, view.in_flight) {
        (BuildMode::EagerAll, _) => Disposition::Reject,
        (BuildMode::EagerSubsetWithLoadingFallback, true) => Disposition::PlaceholderInFlight,
        (BuildMode::EagerSubsetWithLoadingFallback, false) => Disposition::ServePlaceholderAndBuild,
        (BuildMode::EagerSubsetWithBlockingFallback, true) => Disposition::AwaitInFlight,
        (BuildMode::EagerSubsetWithBlockingFallback, false) => Disposition::BuildAndWait,
    }
}
