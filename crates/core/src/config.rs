//! Host-supplied planner configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::BuildMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannerConfig {
    pub build_mode: BuildMode,
    /// Default staleness window; `None` means artifacts never go stale.
    pub revalidate: Option<Duration>,
    /// Quiet period after a failed background rebuild; `None` retries on the next request.
    pub retry_backoff: Option<Duration>,
    /// Cap on how many planned combinations are built eagerly.
    pub eager_limit: Option<usize>,
}

impl PlannerConfig {
    /// Read `ISR_BUILD_MODE`, `ISR_REVALIDATE_SECS`, `ISR_RETRY_BACKOFF_SECS`, `ISR_EAGER_LIMIT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(raw) = get("ISR_BUILD_MODE") {
            match raw.parse::<BuildMode>() {
                Ok(m) => cfg.build_mode = m,
                Err(e) => warn!(value = %raw, error = %e, "invalid ISR_BUILD_MODE; using eager_all"),
            }
        }
        cfg.revalidate = secs(&get, "ISR_REVALIDATE_SECS");
        cfg.retry_backoff = secs(&get, "ISR_RETRY_BACKOFF_SECS");
        if let Some(raw) = get("ISR_EAGER_LIMIT") {
            match raw.trim().parse::<usize>() {
                Ok(n) => cfg.eager_limit = Some(n),
                Err(_) => warn!(value = %raw, "invalid ISR_EAGER_LIMIT; building the whole param set"),
            }
        }
        cfg
    }

    pub fn with_build_mode(mut self, mode: BuildMode) -> Self { self.build_mode = mode; self }
    pub fn with_revalidate(mut self, window: Option<Duration>) -> Self { self.revalidate = window; self }
    pub fn with_retry_backoff(mut self, backoff: Option<Duration>) -> Self { self.retry_backoff = backoff; self }
    pub fn with_eager_limit(mut self, limit: Option<usize>) -> Self { self.eager_limit = limit; self }
}

/// Whole seconds; 0 reads as "unset".
fn secs(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = get(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(n) => Some(Duration::from_secs(n)),
        Err(_) => {
            warn!(key, value = %raw, "expected whole seconds; ignoring");
            None
        }
    }
}
