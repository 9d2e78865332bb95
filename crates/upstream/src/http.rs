//! HTTP collection/item endpoints returning JSON.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use metrics::{counter, histogram};
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::DataSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    /// Returns every entity: a JSON array, or an object holding one under `list_key`.
    pub collection_url: String,
    /// Item endpoint with an `{id}` placeholder; defaults to `<collection_url>/{id}`.
    pub item_url: Option<String>,
    pub id_field: String,
    pub list_key: Option<String>,
    pub timeout: Option<Duration>,
}

impl HttpSourceConfig {
    pub fn new(collection_url: impl Into<String>) -> Self {
        Self { collection_url: collection_url.into(), item_url: None, id_field: "id".to_string(), list_key: None, timeout: None }
    }

    /// Read `ISR_UPSTREAM_URL` (required), `ISR_UPSTREAM_ITEM_URL`,
    /// `ISR_UPSTREAM_ID_FIELD`, `ISR_UPSTREAM_LIST_KEY`, `ISR_UPSTREAM_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = get("ISR_UPSTREAM_URL").ok_or_else(|| anyhow!("ISR_UPSTREAM_URL is not set"))?;
        let mut cfg = Self::new(url);
        cfg.item_url = get("ISR_UPSTREAM_ITEM_URL");
        if let Some(f) = get("ISR_UPSTREAM_ID_FIELD") { cfg.id_field = f; }
        cfg.list_key = get("ISR_UPSTREAM_LIST_KEY");
        if let Some(ms) = get("ISR_UPSTREAM_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().with_context(|| format!("ISR_UPSTREAM_TIMEOUT_MS={}", ms))?;
            cfg.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(t) = cfg.item_url.as_deref() {
            if !t.contains("{id}") { bail!("ISR_UPSTREAM_ITEM_URL must contain {{id}}: {}", t); }
        }
        Ok(cfg)
    }
}

/// reqwest-backed source.
pub struct HttpDataSource {
    client: reqwest::Client,
    cfg: HttpSourceConfig,
}

impl HttpDataSource {
    pub fn new(cfg: HttpSourceConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(concat!("isr-planner/", env!("CARGO_PKG_VERSION")));
        if let Some(t) = cfg.timeout { builder = builder.timeout(t); }
        let client = builder.build().context("building upstream http client")?;
        info!(url = %cfg.collection_url, "upstream http source ready");
        Ok(Self { client, cfg })
    }

    pub fn config(&self) -> &HttpSourceConfig { &self.cfg }
}

#[async_trait::async_trait]
impl DataSource for HttpDataSource {
    async fn fetch_ids(&self) -> Result<Vec<String>> {
        let started = Instant::now();
        let url = &self.cfg.collection_url;
        let resp = self.client.get(url).send().await.with_context(|| format!("GET {}", url))?;
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let body: serde_json::Value = resp.json().await.with_context(|| format!("decoding {}", url))?;
        let ids = extract_ids(&body, &self.cfg.id_field, self.cfg.list_key.as_deref())?;
        histogram!("upstream_fetch_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "ids");
        counter!("upstream_fetch_total", 1u64, "op" => "ids");
        debug!(url = %url, count = ids.len(), "fetched candidate ids");
        Ok(ids)
    }

    async fn fetch_entity(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let started = Instant::now();
        let url = item_url(&self.cfg, id);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {}", url))?;
        counter!("upstream_fetch_total", 1u64, "op" => "entity");
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(url = %url, "entity not found upstream");
            return Ok(None);
        }
        let resp = resp.error_for_status().with_context(|| format!("GET {}", url))?;
        let body: serde_json::Value = resp.json().await.with_context(|| format!("decoding {}", url))?;
        histogram!("upstream_fetch_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "entity");
        // Some APIs answer 200 with `null` for missing items.
        Ok(if body.is_null() { None } else { Some(body) })
    }
}

/// Item URL for `id`, percent-encoded as one path segment.
pub fn item_url(cfg: &HttpSourceConfig, id: &str) -> String {
    let enc = urlencoding::encode(id);
    match cfg.item_url.as_deref() {
        Some(t) => t.replace("{id}", &enc),
        None => format!("{}/{}", cfg.collection_url.trim_end_matches('/'), enc),
    }
}

/// Pull ids out of a collection body. Accepts string and integer ids.
pub fn extract_ids(body: &serde_json::Value, id_field: &str, list_key: Option<&str>) -> Result<Vec<String>> {
    let list = match (body, list_key) {
        (serde_json::Value::Array(items), None) => items,
        (serde_json::Value::Object(obj), Some(key)) => obj
            .get(key)
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("collection body has no array under {:?}", key))?,
        (serde_json::Value::Object(_), None) => bail!("collection body is an object; set a list key"),
        _ => bail!("collection body is not a JSON array"),
    };
    list.iter()
        .enumerate()
        .map(|(i, item)| match item.get(id_field) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(anyhow!("entity #{} has no usable {:?} field", i, id_field)),
        })
        .collect()
}
