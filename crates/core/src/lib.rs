//! ISR core types: route templates, params, artifacts and build modes

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod clock;
mod config;
mod decision;
mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PlannerConfig;
pub use decision::{decide, Disposition, SlotView, Stamp};
pub use error::{PlanError, PlanResult};

pub mod prelude {
    pub use super::{
        decide, Artifact, BuildMode, BuildOutput, BuildState, Clock, Disposition, Freshness,
        ParamSet, Params, PlanError, PlanResult, PlannerConfig, RouteTemplate, SlotView, Stamp,
    };
}

/// One concrete parameter combination, e.g. `id=7`. Used as the store key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Params(SmallVec<[(String, String); 2]>);

impl Params {
    pub fn new() -> Self { Self(SmallVec::new()) }

    /// Single-parameter combination, the common `/items/[id]` case.
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut p = Self::new();
        p.push(name, value);
        p
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.0.iter().map(|(k, _)| k.as_str()) }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> { self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 { f.write_str("&")?; }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Ordered param combinations known at planning time. May hold duplicates;
/// planning dedups them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamSet(pub Vec<Params>);

impl ParamSet {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn push(&mut self, p: Params) { self.0.push(p); }
    pub fn iter(&self) -> std::slice::Iter<'_, Params> { self.0.iter() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Param set for a single-parameter template from a list of values.
    pub fn from_values<I, S>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(|v| Params::single(name, v)).collect())
    }
}

impl FromIterator<Params> for ParamSet {
    fn from_iter<T: IntoIterator<Item = Params>>(iter: T) -> Self { Self(iter.into_iter().collect()) }
}

impl<'a> IntoIterator for &'a ParamSet {
    type Item = &'a Params;
    type IntoIter = std::slice::Iter<'a, Params>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

/// Abstract page identity with named parameters, e.g. `/posts/[id]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteTemplate {
    pub pattern: String,
    pub params: Vec<String>,
}

impl RouteTemplate {
    /// Parse a path pattern; `[name]` and catch-all `[...name]` segments become params.
    pub fn parse(pattern: &str) -> PlanResult<Self> {
        let mut params = Vec::new();
        for seg in pattern.split('/').filter(|s| !s.is_empty()) {
            if let Some(inner) = seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let name = inner.trim_start_matches("...");
                if name.is_empty() {
                    return Err(PlanError::InvalidParams(format!("empty param segment in {}", pattern)));
                }
                if params.iter().any(|p: &String| p == name) {
                    return Err(PlanError::InvalidParams(format!("duplicate param {} in {}", name, pattern)));
                }
                params.push(name.to_string());
            }
        }
        if params.is_empty() {
            return Err(PlanError::InvalidParams(format!("{} has no dynamic segments", pattern)));
        }
        Ok(Self { pattern: pattern.to_string(), params })
    }

    /// Bind values positionally to this template's params.
    pub fn key_for(&self, values: &[&str]) -> PlanResult<Params> {
        if values.len() != self.params.len() {
            return Err(PlanError::InvalidParams(format!(
                "{} expects {} params, got {}",
                self.pattern,
                self.params.len(),
                values.len()
            )));
        }
        let mut p = Params::new();
        for (name, value) in self.params.iter().zip(values) { p.push(name.as_str(), *value); }
        Ok(p)
    }

    /// Check that `params` names exactly this template's params, in order.
    pub fn validate(&self, params: &Params) -> PlanResult<()> {
        if params.names().eq(self.params.iter().map(String::as_str)) {
            Ok(())
        } else {
            Err(PlanError::InvalidParams(format!("{} does not match {}", params, self.pattern)))
        }
    }

    /// Concrete path for a combination (`/posts/[id]` + `id=7` -> `/posts/7`).
    pub fn path_for(&self, params: &Params) -> String {
        let mut out = String::new();
        for seg in self.pattern.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            match seg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                Some(inner) => out.push_str(params.get(inner.trim_start_matches("...")).unwrap_or_default()),
                None => out.push_str(seg),
            }
        }
        if out.is_empty() { out.push('/'); }
        out
    }
}

/// How combinations outside the eagerly built set are treated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Only the planned set exists; anything else is not found.
    #[default]
    EagerAll,
    /// Unlisted combinations get a placeholder while the artifact builds.
    EagerSubsetWithLoadingFallback,
    /// Unlisted combinations are built while the requester waits.
    EagerSubsetWithBlockingFallback,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::EagerAll => "eager_all",
            BuildMode::EagerSubsetWithLoadingFallback => "eager_subset_with_loading_fallback",
            BuildMode::EagerSubsetWithBlockingFallback => "eager_subset_with_blocking_fallback",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for BuildMode {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "false" | "eager_all" => Ok(BuildMode::EagerAll),
            "loading" | "true" | "eager_subset_with_loading_fallback" => Ok(BuildMode::EagerSubsetWithLoadingFallback),
            "blocking" | "eager_subset_with_blocking_fallback" => Ok(BuildMode::EagerSubsetWithBlockingFallback),
            other => Err(PlanError::InvalidParams(format!("unknown build mode: {}", other))),
        }
    }
}

/// Per-combination lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Unbuilt,
    Building,
    Fresh,
    Stale,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

/// What a single build produces before the store stamps it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    pub content: String,
    pub data: serde_json::Value,
    /// Per-artifact window; overrides the configured one when set.
    pub revalidate: Option<Duration>,
}

/// Rendered output for one combination. Replaced whole, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub params: Params,
    pub content: String,
    /// Data snapshot the content was rendered from.
    pub data: serde_json::Value,
    pub built_at: DateTime<Utc>,
    /// Staleness window; `None` never goes stale.
    pub revalidate: Option<Duration>,
    /// Increases with every replacement for the same params.
    pub generation: u64,
}

impl Artifact {
    pub fn from_output(params: Params, out: BuildOutput, built_at: DateTime<Utc>, default_window: Option<Duration>, generation: u64) -> Self {
        Self {
            params,
            content: out.content,
            data: out.data,
            built_at,
            revalidate: out.revalidate.or(default_window),
            generation,
        }
    }

    pub fn stamp(&self) -> Stamp { Stamp { built_at: self.built_at, revalidate: self.revalidate } }

    pub fn age(&self, now: DateTime<Utc>) -> Duration { self.stamp().age(now) }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness { self.stamp().freshness(now) }
}
