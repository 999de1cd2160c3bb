use anyhow::Result;
use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::debug;

use crate::choice::WeightedChoice;
use crate::config::{ActionConfig, TargetConfig};

/// Information shared by every entity of one instance (known channel ids,
/// team names, ...), filled in by actions as they discover it.
pub type InfoCache = Arc<RwLock<HashMap<String, Vec<String>>>>;

/// Ids kept per cache key; later discoveries past this are dropped.
const CACHE_CAP: usize = 1000;

/// A random id stored under `key`, if any was discovered yet.
pub async fn cached_id(cache: &InfoCache, key: &str) -> Option<String> {
    let cache = cache.read().await;
    let ids = cache.get(key).filter(|ids| !ids.is_empty())?;
    let pick = rand::rng().random_range(0..ids.len());
    Some(ids[pick].clone())
}

/// Add newly discovered ids under `key`, skipping ones already known.
pub async fn remember_ids(cache: &InfoCache, key: &str, ids: impl IntoIterator<Item = String>) {
    let mut cache = cache.write().await;
    let known = cache.entry(key.to_string()).or_default();
    for id in ids {
        if known.len() >= CACHE_CAP {
            break;
        }
        if !known.contains(&id) {
            known.push(id);
        }
    }
}

/// String `id` fields of a JSON object or of the objects in a JSON array.
pub fn ids_from_json(body: &serde_json::Value) -> Vec<String> {
    let id_of = |v: &serde_json::Value| v.get("id").and_then(|id| id.as_str()).map(str::to_string);
    match body {
        serde_json::Value::Array(items) => items.iter().filter_map(id_of).collect(),
        other => id_of(other).into_iter().collect(),
    }
}

/// Identity and shared handles an action runs with.
#[derive(Clone)]
pub struct EntityContext {
    pub entity_num: u64,
    pub username: String,
    pub email: String,
    pub cache: InfoCache,
}

impl EntityContext {
    pub fn new(entity_num: u64, cache: InfoCache) -> Self {
        Self {
            entity_num,
            username: format!("loadtest-user{entity_num}"),
            email: format!("loadtest-user{entity_num}@example.com"),
            cache,
        }
    }
}

/// Result of one action call against the target server.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// Concrete request path; normalised by the aggregator
    pub route: String,
    /// HTTP-equivalent result code
    pub status: u16,
}

pub type ActionFuture<'a> = Pin<Box<dyn std::future::Future<Output = Result<ActionOutcome>> + Send + 'a>>;

/// One thing a simulated user can do.
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, ctx: &'a EntityContext) -> ActionFuture<'a>;
}

/// Expand `{user}`, `{entity}` and `{id}` placeholders of a route template.
pub fn render_path(template: &str, ctx: &EntityContext, id: &str) -> String {
    template
        .replace("{user}", &ctx.username)
        .replace("{entity}", &ctx.entity_num.to_string())
        .replace("{id}", id)
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A random identifier in the server's 26-character shape.
pub fn random_id<R: Rng>(rng: &mut R) -> String {
    (0..26)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Simulated action with a fixed latency and a configurable error rate.
pub struct MockAction {
    name: String,
    path: String,
    delay: Duration,
    error_rate: f64,
    uses: Option<String>,
    discovers: Option<String>,
}

impl MockAction {
    pub fn new(name: impl Into<String>, path: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            delay,
            error_rate: 0.0,
            uses: None,
            discovers: None,
        }
    }

    pub fn with_error_rate(mut self, error_rate: f64) -> Self {
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    /// Read `{id}` from the cache under `uses`; store the id of each
    /// successful call under `discovers`.
    pub fn with_cache_keys(mut self, uses: Option<String>, discovers: Option<String>) -> Self {
        self.uses = uses;
        self.discovers = discovers;
        self
    }
}

impl Action for MockAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, ctx: &'a EntityContext) -> ActionFuture<'a> {
        Box::pin(async move {
            let cached = match &self.uses {
                Some(key) => cached_id(&ctx.cache, key).await,
                None => None,
            };
            let (id, failed) = {
                let mut rng = rand::rng();
                let id = cached.unwrap_or_else(|| random_id(&mut rng));
                (id, rng.random_bool(self.error_rate))
            };
            sleep(self.delay).await;

            if let (Some(key), false) = (&self.discovers, failed) {
                remember_ids(&ctx.cache, key, [id.clone()]).await;
            }

            Ok(ActionOutcome {
                route: render_path(&self.path, ctx, &id),
                status: if failed { 500 } else { 200 },
            })
        })
    }
}

/// Action issuing one HTTP request against the target server.
pub struct HttpAction {
    name: String,
    method: reqwest::Method,
    path: String,
    base_url: String,
    client: reqwest::Client,
    uses: Option<String>,
    discovers: Option<String>,
}

impl HttpAction {
    pub fn new(
        name: impl Into<String>,
        method: &str,
        path: impl Into<String>,
        base_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
        Ok(Self {
            name: name.into(),
            method,
            path: path.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            uses: None,
            discovers: None,
        })
    }

    /// Read `{id}` from the cache under `uses`; parse the ids of each
    /// successful JSON response into the cache under `discovers`.
    pub fn with_cache_keys(mut self, uses: Option<String>, discovers: Option<String>) -> Self {
        self.uses = uses;
        self.discovers = discovers;
        self
    }
}

impl Action for HttpAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, ctx: &'a EntityContext) -> ActionFuture<'a> {
        Box::pin(async move {
            let cached = match &self.uses {
                Some(key) => cached_id(&ctx.cache, key).await,
                None => None,
            };
            let id = match cached {
                Some(id) => id,
                None => random_id(&mut rand::rng()),
            };
            let route = render_path(&self.path, ctx, &id);
            let url = format!("{}{}", self.base_url, route);

            let response = self
                .client
                .request(self.method.clone(), &url)
                .header("X-Loadtest-User", ctx.username.as_str())
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if let (Some(key), true) = (&self.discovers, status.is_success()) {
                        match response.json::<serde_json::Value>().await {
                            Ok(body) => remember_ids(&ctx.cache, key, ids_from_json(&body)).await,
                            Err(e) => debug!(action = %self.name, "response body not usable for discovery: {e}"),
                        }
                    }
                    Ok(ActionOutcome {
                        route,
                        status: status.as_u16(),
                    })
                }
                // No response: recorded as a failed call rather than an error
                Err(e) if e.is_timeout() || e.is_connect() => Ok(ActionOutcome { route, status: 0 }),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("action '{0}' is not registered")]
    UnknownAction(String),
}

/// Named actions available to the scheduler, built explicitly by the caller.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: Arc<dyn Action>) -> &mut Self {
        self.actions.insert(action.name().to_string(), action);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Resolve a weight table into a choice list.
    pub fn weighted(
        &self,
        table: &[(String, u32)],
    ) -> Result<Vec<WeightedChoice<Arc<dyn Action>>>, RegistryError> {
        table
            .iter()
            .map(|(name, weight)| {
                self.get(name)
                    .map(|action| WeightedChoice::new(action, *weight))
                    .ok_or_else(|| RegistryError::UnknownAction(name.clone()))
            })
            .collect()
    }

    /// Registry of mock actions mirroring a configured action table.
    pub fn mock_from_config(actions: &[ActionConfig], delay: Duration) -> Self {
        let mut registry = Self::new();
        for a in actions {
            registry.register(Arc::new(
                MockAction::new(&a.name, &a.path, delay)
                    .with_cache_keys(a.uses.clone(), a.discovers.clone()),
            ));
        }
        registry
    }

    /// Registry of HTTP actions sharing one client.
    pub fn http_from_config(actions: &[ActionConfig], target: &TargetConfig) -> Result<Self> {
        let client = http_client(target)?;
        let mut registry = Self::new();
        for a in actions {
            let action = HttpAction::new(&a.name, &a.method, &a.path, &target.base_url, client.clone())?
                .with_cache_keys(a.uses.clone(), a.discovers.clone());
            registry.register(Arc::new(action));
        }
        Ok(registry)
    }
}

/// Client shared by every HTTP action of one instance.
pub fn http_client(target: &TargetConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(target.timeout_ms.max(1)))
        .tcp_keepalive(Duration::from_secs(30))
        .build()?;
    Ok(client)
}

/// Weight table of a configured action list.
pub fn weight_table(actions: &[ActionConfig]) -> Vec<(String, u32)> {
    actions.iter().map(|a| (a.name.clone(), a.weight)).collect()
}

/// Source of inbound server events for one entity (a websocket in a real
/// deployment).
pub trait EventSource: Send + Sync {
    fn connect<'a>(&'a self, ctx: &'a EntityContext) -> BoxStream<'a, Result<String>>;
}

/// Emits `count` synthetic events `every` interval, then ends the stream.
pub struct MockEventSource {
    pub every: Duration,
    pub count: usize,
}

impl EventSource for MockEventSource {
    fn connect<'a>(&'a self, ctx: &'a EntityContext) -> BoxStream<'a, Result<String>> {
        let every = self.every;
        stream::iter(0..self.count)
            .then(move |i| async move {
                sleep(every).await;
                Ok::<_, anyhow::Error>(format!("event {i} for {}", ctx.username))
            })
            .boxed()
    }
}
