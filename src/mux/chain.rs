use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode, Uri, Version};
use axum::response::Response;
use parking_lot::RwLock;

use crate::error::Result;
use crate::mux::endpoint::MuxEndpoint;

/// Mutable view of a request as it travels the middleware chain. Header
/// mutations made here are what the forwarder sends upstream; the location
/// snapshots and restores them between failover attempts.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub client_addr: SocketAddr,
    pub scheme: String,
    pub body_len: u64,
    /// 1-based attempt counter, bumped on each failover retry.
    pub attempt: usize,
    pub request_id: String,
}

impl ProxyRequest {
    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Outcome of a single forwarding attempt, handed to `on_response`.
#[derive(Debug, Clone, Default)]
pub struct Attempt {
    /// 1-based attempt number within the request.
    pub index: usize,
    pub endpoint: Option<Arc<MuxEndpoint>>,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl Attempt {
    pub fn is_network_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A request/response interceptor. Returning a response from `on_request`
/// short-circuits the chain; `on_response` fires once per attempt for every
/// middleware whose `on_request` ran in that attempt.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_request(&self, req: &mut ProxyRequest) -> Result<Option<Response<Body>>>;
    async fn on_response(&self, req: &ProxyRequest, attempt: &Attempt);
}

/// Side-effect-only middleware: sees both phases, can never short-circuit.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_request(&self, req: &ProxyRequest);
    async fn on_response(&self, req: &ProxyRequest, attempt: &Attempt);
}

/// Closure-backed middleware, handy for tests and one-off hooks.
pub struct MiddlewareFn<Req, Res>
where
    Req: Fn(&mut ProxyRequest) -> Result<Option<Response<Body>>> + Send + Sync,
    Res: Fn(&ProxyRequest, &Attempt) + Send + Sync,
{
    pub on_request: Req,
    pub on_response: Res,
}

#[async_trait]
impl<Req, Res> Middleware for MiddlewareFn<Req, Res>
where
    Req: Fn(&mut ProxyRequest) -> Result<Option<Response<Body>>> + Send + Sync,
    Res: Fn(&ProxyRequest, &Attempt) + Send + Sync,
{
    async fn on_request(&self, req: &mut ProxyRequest) -> Result<Option<Response<Body>>> {
        (self.on_request)(req)
    }

    async fn on_response(&self, req: &ProxyRequest, attempt: &Attempt) {
        (self.on_response)(req, attempt)
    }
}

/// Closure-backed observer.
pub struct ObserverFn<Req, Res>
where
    Req: Fn(&ProxyRequest) + Send + Sync,
    Res: Fn(&ProxyRequest, &Attempt) + Send + Sync,
{
    pub on_request: Req,
    pub on_response: Res,
}

#[async_trait]
impl<Req, Res> Observer for ObserverFn<Req, Res>
where
    Req: Fn(&ProxyRequest) + Send + Sync,
    Res: Fn(&ProxyRequest, &Attempt) + Send + Sync,
{
    async fn on_request(&self, req: &ProxyRequest) {
        (self.on_request)(req)
    }

    async fn on_response(&self, req: &ProxyRequest, attempt: &Attempt) {
        (self.on_response)(req, attempt)
    }
}

struct ChainEntry<T: ?Sized> {
    key: String,
    priority: i32,
    seq: u64,
    item: Arc<T>,
}

/// Ordered set of named items. Iteration order is ascending priority, ties
/// broken by insertion order. Upserting an existing key replaces the item in
/// place, keeping its position among equal priorities.
pub struct Chain<T: ?Sized> {
    entries: RwLock<Vec<ChainEntry<T>>>,
    seq: AtomicU64,
}

impl<T: ?Sized> Default for Chain<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T: ?Sized> Chain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, key: &str, priority: i32, item: Arc<T>) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| e.key == key) {
            existing.item = item;
            existing.priority = priority;
        } else {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            entries.push(ChainEntry {
                key: key.to_string(),
                priority,
                seq,
                item,
            });
        }
        entries.sort_by_key(|e| (e.priority, e.seq));
    }

    /// Removes the keyed entry; false when absent.
    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.key != key);
        entries.len() != before
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.item.clone())
    }

    /// Snapshot in chain order.
    pub fn sorted(&self) -> Vec<(String, Arc<T>)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.key.clone(), e.item.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

pub type MiddlewareChain = Chain<dyn Middleware>;
pub type ObserverChain = Chain<dyn Observer>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn test_request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            uri: "/".parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            client_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000),
            scheme: "http".into(),
            body_len: 0,
            attempt: 1,
            request_id: "test".into(),
        }
    }

    fn noop(priority_tag: &'static str) -> Arc<dyn Middleware> {
        Arc::new(MiddlewareFn {
            on_request: move |req: &mut ProxyRequest| {
                req.headers
                    .append("x-order", priority_tag.parse().unwrap());
                Ok(None)
            },
            on_response: |_: &ProxyRequest, _: &Attempt| {},
        })
    }

    #[test]
    fn orders_by_priority_then_insertion() {
        let chain = MiddlewareChain::new();
        chain.upsert("b.1", 5, noop("b"));
        chain.upsert("a.1", 0, noop("a"));
        chain.upsert("c.1", 5, noop("c"));

        let keys: Vec<_> = chain.sorted().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a.1", "b.1", "c.1"]);
    }

    #[test]
    fn upsert_replaces_on_key_collision() {
        let chain = MiddlewareChain::new();
        chain.upsert("ratelimit.rl1", 0, noop("first"));
        chain.upsert("ratelimit.rl1", 0, noop("second"));
        assert_eq!(chain.len(), 1);
        assert!(chain.get("ratelimit.rl1").is_some());
    }

    #[test]
    fn delete_leaves_other_entries() {
        let chain = MiddlewareChain::new();
        chain.upsert("ratelimit.r1", 0, noop("r1"));
        chain.upsert("ratelimit.r2", 0, noop("r2"));
        assert!(chain.delete("ratelimit.r1"));
        assert!(!chain.delete("ratelimit.r1"));
        assert!(chain.get("ratelimit.r1").is_none());
        assert!(chain.get("ratelimit.r2").is_some());
    }

    #[tokio::test]
    async fn middleware_fn_runs_closures() {
        let mw = MiddlewareFn {
            on_request: |req: &mut ProxyRequest| {
                req.headers.insert("x-seen", "yes".parse().unwrap());
                Ok(None)
            },
            on_response: |_: &ProxyRequest, _: &Attempt| {},
        };
        let mut req = test_request();
        assert!(mw.on_request(&mut req).await.unwrap().is_none());
        assert_eq!(req.header("x-seen"), Some("yes"));
    }
}
