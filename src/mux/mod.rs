pub mod balancer;
pub mod chain;
pub mod endpoint;
pub mod host;
pub mod listener;
pub mod location;
pub mod route;
pub mod trie;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::middleware::MiddlewareRegistry;
use crate::model::{
    normalize_host_name, Certificate, Endpoint, Host, Listener, ListenerKey, Location,
    MiddlewareInstance, Protocol, Upstream,
};
use crate::mux::host::SniStore;
use crate::mux::listener::{BoxedIo, ConnHandler, ConnectionWatcher, ListenerManager};
use crate::mux::location::{EngineDefaults, HttpLocation};
use crate::mux::route::{PathExpression, PathRouter};
use crate::stats::{PerfMonitor, RoundTripStats};

/// Process-wide options for one mux instance.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Listener used by hosts that declare none of their own.
    pub default_listener: Option<Listener>,
    pub engine: EngineDefaults,
    /// How long a graceful stop waits for in-flight requests.
    pub drain_timeout: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            default_listener: None,
            engine: EngineDefaults::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initial,
    Running,
    Stopping,
    Stopped,
}

/// The live dataplane: owns listeners, TLS state, the host/location routing
/// graph and per-location forwarders, and exposes the CRUD surface the
/// configurator drives. Cheap to clone; clones share the same graph.
#[derive(Clone)]
pub struct MuxServer {
    state: Arc<MuxState>,
}

struct MuxState {
    options: MuxOptions,
    lifecycle: Mutex<ServerState>,
    hosts: RwLock<HashMap<String, Host>>,
    routers: RwLock<HashMap<String, Arc<PathRouter>>>,
    locations: RwLock<HashMap<(String, String), Arc<HttpLocation>>>,
    upstreams: RwLock<HashMap<String, Upstream>>,
    listeners: ListenerManager,
    sni: Arc<SniStore>,
    tls_configs: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
    registry: MiddlewareRegistry,
    perf: Arc<PerfMonitor>,
    watcher: ConnectionWatcher,
    force_close: watch::Sender<bool>,
}

impl MuxServer {
    pub fn new(options: MuxOptions) -> Self {
        let watcher = ConnectionWatcher::new();
        let (force_close, _) = watch::channel(false);
        Self {
            state: Arc::new(MuxState {
                options,
                lifecycle: Mutex::new(ServerState::Initial),
                hosts: RwLock::new(HashMap::new()),
                routers: RwLock::new(HashMap::new()),
                locations: RwLock::new(HashMap::new()),
                upstreams: RwLock::new(HashMap::new()),
                listeners: ListenerManager::new(watcher.clone()),
                sni: SniStore::new(),
                tls_configs: Mutex::new(HashMap::new()),
                registry: MiddlewareRegistry::default(),
                perf: PerfMonitor::new(),
                watcher,
                force_close,
            }),
        }
    }

    pub fn server_state(&self) -> ServerState {
        *self.state.lifecycle.lock()
    }

    fn is_running(&self) -> bool {
        self.server_state() == ServerState::Running
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Binds every referenced listener and begins accepting. Idempotent
    /// while running; CRUD before `start` only primes the graph.
    pub fn start(&self) -> Result<()> {
        {
            let lifecycle = self.state.lifecycle.lock();
            match *lifecycle {
                ServerState::Running => return Ok(()),
                ServerState::Stopping | ServerState::Stopped => {
                    return Err(ProxyError::Internal("mux already stopped".into()));
                }
                ServerState::Initial => {}
            }
        }
        self.state.listeners.start_all(self.conn_handler())?;
        *self.state.lifecycle.lock() = ServerState::Running;
        info!("mux started");
        Ok(())
    }

    /// `stop(true)` stops accepting, waits for in-flight requests up to the
    /// drain deadline, then forces the rest; `stop(false)` closes
    /// everything immediately.
    pub async fn stop(&self, graceful: bool) {
        {
            let mut lifecycle = self.state.lifecycle.lock();
            if matches!(*lifecycle, ServerState::Stopping | ServerState::Stopped) {
                return;
            }
            *lifecycle = ServerState::Stopping;
        }
        self.state.listeners.close_all();
        if graceful {
            let drained = self
                .state
                .watcher
                .drain(self.state.options.drain_timeout)
                .await;
            if !drained {
                warn!(
                    active = self.state.watcher.active(),
                    "drain deadline expired, forcing connections closed"
                );
            }
        }
        let _ = self.state.force_close.send(true);
        *self.state.lifecycle.lock() = ServerState::Stopped;
        info!("mux stopped");
    }

    /// Takes over the other mux's bound sockets without closing them. The
    /// other mux stops accepting but keeps servicing in-flight requests;
    /// this mux begins accepting on the sockets at its own `start`.
    pub fn hijack_listeners_from(&self, other: &MuxServer) -> Result<()> {
        let detached = other.state.listeners.detach_all();
        let count = detached.len();
        for (key, socket) in detached {
            self.state.listeners.adopt(&key, socket);
        }
        info!(listeners = count, "hijacked listeners");
        Ok(())
    }

    pub fn active_connections(&self) -> usize {
        self.state.watcher.active()
    }

    // ---------------------------------------------------------------------
    // Host CRUD
    // ---------------------------------------------------------------------

    pub fn upsert_host(&self, host: &Host) -> Result<()> {
        host.validate()?;
        let name = normalize_host_name(&host.name);
        let new_listeners = self.effective_listeners(host);

        let old_keys = {
            let hosts = self.state.hosts.read();
            hosts
                .get(&name)
                .map(|h| listener_keys(&self.effective_listeners(h)))
                .unwrap_or_default()
        };
        let new_keys = listener_keys(&new_listeners);

        for key in new_keys.iter().filter(|k| !old_keys.contains(k)) {
            self.state.listeners.acquire(key);
            if self.is_running() {
                if let Err(e) = self.state.listeners.start(key, self.conn_handler()) {
                    self.state.listeners.release(key);
                    return Err(e);
                }
            }
        }
        for key in old_keys.iter().filter(|k| !new_keys.contains(k)) {
            self.state.listeners.release(key);
        }

        if let Some(cert) = &host.cert {
            self.state.sni.set_host_cert(&name, cert)?;
        }
        for listener in &new_listeners {
            if listener.protocol == Protocol::Https {
                if host.options.default {
                    self.state
                        .sni
                        .set_default(&listener.address.address, &name);
                } else {
                    self.state
                        .sni
                        .clear_default(&listener.address.address, &name);
                }
            }
        }

        self.state
            .routers
            .write()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(PathRouter::new()));
        self.state.hosts.write().insert(name, host.clone());
        Ok(())
    }

    /// Removes the host, its routes and its listener references. The last
    /// reference to a listener closes the socket.
    pub fn delete_host(&self, name: &str) -> Result<()> {
        let name = normalize_host_name(name);
        let Some(host) = self.state.hosts.write().remove(&name) else {
            return Ok(());
        };
        for key in listener_keys(&self.effective_listeners(&host)) {
            self.state.listeners.release(&key);
        }
        self.state.sni.remove_host(&name);
        self.state.routers.write().remove(&name);
        self.state
            .locations
            .write()
            .retain(|(hostname, _), _| hostname != &name);
        info!(host = %name, "host deleted");
        Ok(())
    }

    pub fn add_host_listener(&self, host: &Host, listener: &Listener) -> Result<()> {
        let name = normalize_host_name(&host.name);
        if !self.state.hosts.read().contains_key(&name) {
            let mut without = host.clone();
            without
                .listeners
                .retain(|l| !(l.id == listener.id && l.key() == listener.key()));
            self.upsert_host(&without)?;
        }

        let mut stored = self.state.hosts.read().get(&name).cloned().unwrap();
        let key = listener.key();
        let key_in_use = self
            .effective_listeners(&stored)
            .iter()
            .any(|l| l.key() == key);
        if !key_in_use {
            self.state.listeners.acquire(&key);
            if self.is_running() {
                if let Err(e) = self.state.listeners.start(&key, self.conn_handler()) {
                    self.state.listeners.release(&key);
                    return Err(e);
                }
            }
        }
        if !stored.listeners.iter().any(|l| l.id == listener.id) {
            stored.listeners.push(listener.clone());
        }
        if listener.protocol == Protocol::Https && stored.options.default {
            self.state
                .sni
                .set_default(&listener.address.address, &name);
        }
        self.state.hosts.write().insert(name, stored);
        Ok(())
    }

    pub fn delete_host_listener(&self, host: &Host, listener_id: &str) -> Result<()> {
        let name = normalize_host_name(&host.name);
        let Some(mut stored) = self.state.hosts.read().get(&name).cloned() else {
            return Ok(());
        };
        let Some(pos) = stored.listeners.iter().position(|l| l.id == listener_id) else {
            return Ok(());
        };
        let removed = stored.listeners.remove(pos);
        let key = removed.key();
        if !stored.listeners.iter().any(|l| l.key() == key) {
            self.state.listeners.release(&key);
            if removed.protocol == Protocol::Https {
                self.state
                    .sni
                    .clear_default(&removed.address.address, &name);
            }
        }
        self.state.hosts.write().insert(name, stored);
        Ok(())
    }

    /// Swaps the host's TLS key-pair. No socket is rebound; connections
    /// already established continue under the previous certificate.
    pub fn update_host_cert(&self, name: &str, cert: &Certificate) -> Result<()> {
        let name = normalize_host_name(name);
        if !self.state.hosts.read().contains_key(&name) {
            return Err(ProxyError::Config(format!("host {name} not found")));
        }
        self.state.sni.set_host_cert(&name, cert)?;
        if let Some(stored) = self.state.hosts.write().get_mut(&name) {
            stored.cert = Some(cert.clone());
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Location CRUD
    // ---------------------------------------------------------------------

    pub fn upsert_location(&self, host: &Host, location: &Location) -> Result<()> {
        location.validate()?;
        PathExpression::parse(&location.path)?;
        self.upsert_host(host)?;

        let hostname = normalize_host_name(&host.name);
        let key = (hostname.clone(), location.id.clone());
        let existing = self.state.locations.read().get(&key).cloned();

        match existing {
            Some(loc) => {
                loc.set_options(&location.options)?;
                loc.update_upstream(&location.upstream)?;
                let old_path = loc.path();
                if old_path != location.path {
                    self.router(&hostname)
                        .rebind(&old_path, &location.path, loc.clone())?;
                    loc.set_path(&location.path);
                }
                for instance in &location.middlewares {
                    self.install_middleware(&loc, instance)?;
                }
            }
            None => {
                let loc = HttpLocation::new(
                    &hostname,
                    &location.id,
                    &location.path,
                    &location.options,
                    self.state.options.engine.clone(),
                    self.state.perf.clone(),
                )?;
                loc.update_upstream(&location.upstream)?;
                for instance in &location.middlewares {
                    self.install_middleware(&loc, instance)?;
                }
                self.router(&hostname)
                    .set_location(&location.path, loc.clone())?;
                self.state.locations.write().insert(key, loc);
                debug!(host = %hostname, location = %location.id, path = %location.path, "location added");
            }
        }

        self.state
            .upstreams
            .write()
            .insert(location.upstream.id.clone(), location.upstream.clone());
        Ok(())
    }

    pub fn delete_location(&self, host: &Host, location_id: &str) -> Result<()> {
        let hostname = normalize_host_name(&host.name);
        let Some(loc) = self
            .state
            .locations
            .write()
            .remove(&(hostname.clone(), location_id.to_string()))
        else {
            return Ok(());
        };
        self.router(&hostname).remove_path(&loc.path())?;
        debug!(host = %hostname, location = %location_id, "location deleted");
        Ok(())
    }

    pub fn update_location_upstream(&self, host: &Host, location: &Location) -> Result<()> {
        let hostname = normalize_host_name(&host.name);
        let key = (hostname, location.id.clone());
        match self.state.locations.read().get(&key).cloned() {
            Some(loc) => {
                loc.update_upstream(&location.upstream)?;
                self.state
                    .upstreams
                    .write()
                    .insert(location.upstream.id.clone(), location.upstream.clone());
                Ok(())
            }
            None => self.upsert_location(host, location),
        }
    }

    /// Rebinds the location to a new path expression, creating the location
    /// if it does not exist yet.
    pub fn update_location_path(&self, host: &Host, location: &Location, path: &str) -> Result<()> {
        let hostname = normalize_host_name(&host.name);
        let key = (hostname.clone(), location.id.clone());
        match self.state.locations.read().get(&key).cloned() {
            Some(loc) => {
                let old_path = loc.path();
                self.router(&hostname).rebind(&old_path, path, loc.clone())?;
                loc.set_path(path);
                Ok(())
            }
            None => {
                let mut with_path = location.clone();
                with_path.path = path.to_string();
                self.upsert_location(host, &with_path)
            }
        }
    }

    pub fn update_location_options(&self, host: &Host, location: &Location) -> Result<()> {
        let hostname = normalize_host_name(&host.name);
        let key = (hostname, location.id.clone());
        match self.state.locations.read().get(&key).cloned() {
            Some(loc) => loc.set_options(&location.options),
            None => self.upsert_location(host, location),
        }
    }

    pub fn upsert_location_middleware(
        &self,
        host: &Host,
        location: &Location,
        instance: &MiddlewareInstance,
    ) -> Result<()> {
        let hostname = normalize_host_name(&host.name);
        let key = (hostname, location.id.clone());
        let loc = match self.state.locations.read().get(&key).cloned() {
            Some(loc) => loc,
            None => {
                self.upsert_location(host, location)?;
                self.state.locations.read().get(&key).cloned().unwrap()
            }
        };
        self.install_middleware(&loc, instance)
    }

    pub fn delete_location_middleware(
        &self,
        host: &Host,
        location: &Location,
        middleware_type: &str,
        middleware_id: &str,
    ) -> Result<()> {
        let hostname = normalize_host_name(&host.name);
        if let Some(loc) = self
            .state
            .locations
            .read()
            .get(&(hostname, location.id.clone()))
        {
            loc.middleware_chain()
                .delete(&format!("{middleware_type}.{middleware_id}"));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Upstream / endpoint CRUD
    // ---------------------------------------------------------------------

    pub fn upsert_upstream(&self, upstream: &Upstream) -> Result<()> {
        self.state
            .upstreams
            .write()
            .insert(upstream.id.clone(), upstream.clone());
        Ok(())
    }

    /// Deleting an upstream never touches locations still referencing it;
    /// they keep their current endpoint set until rebound.
    pub fn delete_upstream(&self, upstream_id: &str) -> Result<()> {
        self.state.upstreams.write().remove(upstream_id);
        Ok(())
    }

    pub fn upsert_endpoint(
        &self,
        upstream: &Upstream,
        endpoint: &Endpoint,
        affected: &[Location],
    ) -> Result<()> {
        // Parse up front so a malformed URL rejects the change with every
        // load balancer left untouched.
        crate::mux::endpoint::MuxEndpoint::new(endpoint, self.state.perf.clone())?;

        for location in affected {
            if let Some(loc) = self.get_location(&location.hostname, &location.id) {
                loc.upsert_endpoint(endpoint)?;
            }
        }

        let mut upstreams = self.state.upstreams.write();
        let entry = upstreams
            .entry(upstream.id.clone())
            .or_insert_with(|| upstream.clone());
        match entry.endpoints.iter_mut().find(|e| e.key() == endpoint.key()) {
            Some(existing) => *existing = endpoint.clone(),
            None => entry.endpoints.push(endpoint.clone()),
        }
        Ok(())
    }

    pub fn delete_endpoint(
        &self,
        upstream: &Upstream,
        endpoint_id: &str,
        affected: &[Location],
    ) -> Result<()> {
        for location in affected {
            if let Some(loc) = self.get_location(&location.hostname, &location.id) {
                loc.remove_endpoint(endpoint_id);
            }
        }
        if let Some(entry) = self.state.upstreams.write().get_mut(&upstream.id) {
            entry.endpoints.retain(|e| e.key() != endpoint_id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn get_location(&self, hostname: &str, location_id: &str) -> Option<Arc<HttpLocation>> {
        self.state
            .locations
            .read()
            .get(&(normalize_host_name(hostname), location_id.to_string()))
            .cloned()
    }

    pub fn host_router(&self, name: &str) -> Option<Arc<PathRouter>> {
        self.state
            .routers
            .read()
            .get(&normalize_host_name(name))
            .cloned()
    }

    pub fn get_host(&self, name: &str) -> Option<Host> {
        self.state
            .hosts
            .read()
            .get(&normalize_host_name(name))
            .cloned()
    }

    /// Round-trip stats for one endpoint of a location, resolved through
    /// the location's live balancer membership.
    pub fn get_stats(
        &self,
        hostname: &str,
        location_id: &str,
        endpoint: &Endpoint,
    ) -> Option<RoundTripStats> {
        let location = self.get_location(hostname, location_id)?;
        let key = endpoint.key();
        location
            .endpoints()
            .into_iter()
            .find(|e| e.id() == key)
            .and_then(|e| e.stats())
    }

    pub fn listener_refcount(&self, key: &ListenerKey) -> usize {
        self.state.listeners.refcount(key)
    }

    pub fn is_listener_bound(&self, key: &ListenerKey) -> bool {
        self.state.listeners.is_bound(key)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn effective_listeners(&self, host: &Host) -> Vec<Listener> {
        if !host.listeners.is_empty() {
            host.listeners.clone()
        } else if let Some(default) = &self.state.options.default_listener {
            vec![default.clone()]
        } else {
            Vec::new()
        }
    }

    fn router(&self, hostname: &str) -> Arc<PathRouter> {
        self.state
            .routers
            .write()
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(PathRouter::new()))
            .clone()
    }

    fn install_middleware(
        &self,
        loc: &Arc<HttpLocation>,
        instance: &MiddlewareInstance,
    ) -> Result<()> {
        let built = self.state.registry.build(instance)?;
        loc.middleware_chain()
            .upsert(&instance.chain_key(), instance.priority, built);
        Ok(())
    }

    fn conn_handler(&self) -> ConnHandler {
        let state = self.state.clone();
        Arc::new(move |io, peer, key| {
            let state = state.clone();
            Box::pin(async move { handle_connection(state, io, peer, key).await })
        })
    }
}

fn listener_keys(listeners: &[Listener]) -> Vec<ListenerKey> {
    let mut keys: Vec<ListenerKey> = Vec::new();
    for listener in listeners {
        let key = listener.key();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

impl MuxState {
    fn tls_config(self: &Arc<Self>, address: &str) -> Arc<rustls::ServerConfig> {
        let mut configs = self.tls_configs.lock();
        configs
            .entry(address.to_string())
            .or_insert_with(|| self.sni.server_config(address))
            .clone()
    }
}

async fn handle_connection(
    state: Arc<MuxState>,
    io: BoxedIo,
    peer: SocketAddr,
    key: ListenerKey,
) {
    let mut force_close = state.force_close.subscribe();

    let (stream, scheme): (BoxedIo, &'static str) = match key.protocol {
        Protocol::Https => {
            let config = state.tls_config(&key.address);
            let acceptor = tokio_rustls::TlsAcceptor::from(config);
            match acceptor.accept(io).await {
                Ok(tls) => (Box::new(tls), "https"),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
            }
        }
        Protocol::Http => (io, "http"),
    };

    let service_state = state.clone();
    let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = service_state.clone();
        async move {
            Ok::<_, std::convert::Infallible>(dispatch(state, req, peer, scheme).await)
        }
    });

    let conn = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "connection closed with error");
            }
        }
        _ = force_close.changed() => {
            debug!(peer = %peer, "connection force-closed");
        }
    }
}

/// Host lookup by Host header, then path dispatch within the host's router.
async fn dispatch(
    state: Arc<MuxState>,
    req: Request<hyper::body::Incoming>,
    peer: SocketAddr,
    scheme: &'static str,
) -> Response<Body> {
    let hostname = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(normalize_host_name)
        .or_else(|| {
            req.uri()
                .authority()
                .map(|a| normalize_host_name(a.as_str()))
        });

    let Some(hostname) = hostname else {
        return ProxyError::RouteMiss.into_response();
    };
    let Some(router) = state.routers.read().get(&hostname).cloned() else {
        debug!(host = %hostname, "no such host");
        return ProxyError::RouteMiss.into_response();
    };
    let Some(location) = router.route(req.uri().path()) else {
        debug!(host = %hostname, path = %req.uri().path(), "no route matched");
        return ProxyError::RouteMiss.into_response();
    };
    location.serve(req.map(Body::new), peer, scheme).await
}
