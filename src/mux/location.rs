use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{self, HeaderName};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::model::{parse_duration_or, Endpoint, LocationOptions, Upstream};
use crate::mux::balancer::RoundRobin;
use crate::mux::chain::{
    Attempt, Middleware, MiddlewareChain, Observer, ObserverChain, ProxyRequest,
};
use crate::mux::endpoint::MuxEndpoint;
use crate::predicate::FailoverPredicate;
use crate::stats::PerfMonitor;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_SERVER: &str = "x-forwarded-server";

/// Engine-wide forwarding defaults a location falls back to when its own
/// options leave a knob empty.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub max_mem_body_bytes: i64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(50),
            max_mem_body_bytes: 4 << 20,
        }
    }
}

/// Parsed, runtime form of a location's options.
#[derive(Debug, Clone)]
pub struct Options {
    pub timeouts: Timeouts,
    pub limits: Limits,
    pub failover: FailoverPredicate,
    pub hostname: String,
    pub trust_forward_header: bool,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
    pub tls_handshake: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_mem_body_bytes: i64,
    pub max_body_bytes: i64,
}

impl Options {
    fn parse(raw: &LocationOptions, defaults: &EngineDefaults) -> Result<Self> {
        let dial = parse_duration_or(&raw.timeouts.dial, defaults.dial_timeout)?;
        let read = parse_duration_or(&raw.timeouts.read, defaults.read_timeout)?;
        let write = parse_duration_or(&raw.timeouts.write, defaults.read_timeout)?;
        let tls_handshake = parse_duration_or(&raw.timeouts.tls_handshake, dial)?;
        let failover = if raw.failover_predicate.trim().is_empty() {
            FailoverPredicate::network_error()
        } else {
            FailoverPredicate::parse(&raw.failover_predicate)?
        };
        let max_mem = if raw.limits.max_mem_body_bytes > 0 {
            raw.limits.max_mem_body_bytes
        } else {
            defaults.max_mem_body_bytes
        };
        Ok(Self {
            timeouts: Timeouts {
                dial,
                read,
                write,
                tls_handshake,
            },
            limits: Limits {
                max_mem_body_bytes: max_mem,
                max_body_bytes: raw.limits.max_body_bytes,
            },
            failover,
            hostname: raw.hostname.clone(),
            trust_forward_header: raw.trust_forward_header,
        })
    }
}

struct OptionsState {
    options: Options,
    /// One forwarder per location. Swapped when options change; replacing
    /// the upstream never recreates it. In-flight attempts keep the client
    /// they captured, so a timeout update applies to new attempts only.
    forwarder: Arc<reqwest::Client>,
}

/// Per-path forwarding unit: a load balancer, a middleware chain and the
/// options governing one hop to the upstream pool.
pub struct HttpLocation {
    hostname: String,
    id: String,
    path: RwLock<String>,
    state: RwLock<OptionsState>,
    balancer: RoundRobin,
    middlewares: MiddlewareChain,
    observers: ObserverChain,
    perf: Arc<PerfMonitor>,
    defaults: EngineDefaults,
}

impl HttpLocation {
    pub fn new(
        hostname: impl Into<String>,
        id: impl Into<String>,
        path: impl Into<String>,
        raw_options: &LocationOptions,
        defaults: EngineDefaults,
        perf: Arc<PerfMonitor>,
    ) -> Result<Arc<Self>> {
        let options = Options::parse(raw_options, &defaults)?;
        let forwarder = Arc::new(build_forwarder(&options)?);
        Ok(Arc::new(Self {
            hostname: hostname.into(),
            id: id.into(),
            path: RwLock::new(path.into()),
            state: RwLock::new(OptionsState { options, forwarder }),
            balancer: RoundRobin::new(),
            middlewares: MiddlewareChain::new(),
            observers: ObserverChain::new(),
            perf,
            defaults,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    pub fn set_path(&self, path: impl Into<String>) {
        *self.path.write() = path.into();
    }

    pub fn options(&self) -> Options {
        self.state.read().options.clone()
    }

    /// Re-parses and swaps the options, rebuilding the forwarder so new
    /// timeouts take effect for subsequent attempts.
    pub fn set_options(&self, raw: &LocationOptions) -> Result<()> {
        let options = Options::parse(raw, &self.defaults)?;
        let forwarder = Arc::new(build_forwarder(&options)?);
        let mut state = self.state.write();
        state.options = options;
        state.forwarder = forwarder;
        Ok(())
    }

    pub fn middleware_chain(&self) -> &MiddlewareChain {
        &self.middlewares
    }

    pub fn observer_chain(&self) -> &ObserverChain {
        &self.observers
    }

    pub fn balancer(&self) -> &RoundRobin {
        &self.balancer
    }

    pub fn endpoints(&self) -> Vec<Arc<MuxEndpoint>> {
        self.balancer.endpoints()
    }

    /// Replaces the endpoint membership with the upstream's. All URLs are
    /// parsed up front; any malformed endpoint rejects the whole update and
    /// leaves the balancer untouched.
    pub fn update_upstream(&self, upstream: &Upstream) -> Result<()> {
        let parsed: Vec<Arc<MuxEndpoint>> = upstream
            .endpoints
            .iter()
            .map(|e| MuxEndpoint::new(e, self.perf.clone()).map(Arc::new))
            .collect::<Result<_>>()?;

        let keep: Vec<String> = parsed.iter().map(|e| e.id().to_string()).collect();
        for existing in self.balancer.endpoints() {
            if !keep.iter().any(|id| id == existing.id()) {
                self.balancer.remove_endpoint(existing.id());
            }
        }
        for endpoint in parsed {
            self.balancer.upsert_endpoint(endpoint);
        }
        Ok(())
    }

    pub fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let parsed = Arc::new(MuxEndpoint::new(endpoint, self.perf.clone())?);
        self.balancer.upsert_endpoint(parsed);
        Ok(())
    }

    pub fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        self.balancer.remove_endpoint(endpoint_id)
    }

    /// Serves one request: admission, body staging, the middleware forward
    /// pass, endpoint selection and the failover loop, then the response
    /// pass in reverse.
    pub async fn serve(
        self: &Arc<Self>,
        req: Request<Body>,
        client_addr: SocketAddr,
        scheme: &str,
    ) -> Response<Body> {
        match self.serve_inner(req, client_addr, scheme).await {
            Ok(response) => response,
            Err(e) => {
                debug!(location = %self.id, error = %e, "request rejected");
                e.into_response()
            }
        }
    }

    async fn serve_inner(
        self: &Arc<Self>,
        req: Request<Body>,
        client_addr: SocketAddr,
        scheme: &str,
    ) -> Result<Response<Body>> {
        let (options, forwarder) = {
            let state = self.state.read();
            (state.options.clone(), state.forwarder.clone())
        };

        let (parts, body) = req.into_parts();

        // Admission: a declared length over the cap fails fast, before any
        // of the body is read.
        let max_body = options.limits.max_body_bytes;
        if max_body > 0 {
            if let Some(declared) = parts
                .headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
            {
                if declared > max_body {
                    return Err(ProxyError::Admission {
                        got: declared,
                        limit: max_body,
                    });
                }
            }
        }

        // Chunked bodies are measured as they are de-chunked; the staged
        // copy is what every forwarding attempt replays.
        let staged = StagedBody::stage(body, options.limits.max_mem_body_bytes, max_body).await?;

        let mut preq = ProxyRequest {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
            client_addr,
            scheme: scheme.to_string(),
            body_len: staged.len(),
            attempt: 0,
            request_id: Uuid::new_v4().to_string(),
        };
        set_forward_headers(&mut preq, &options);

        // Everything a middleware writes on attempt N is rolled back to
        // this snapshot before attempt N+1 runs.
        let header_snapshot = preq.headers.clone();

        let middlewares = self.middlewares.sorted();
        let observers: Vec<_> = self.observers.sorted();

        let max_attempts = self.balancer.len().max(1);
        let mut attempt_no = 0;
        loop {
            attempt_no += 1;
            preq.attempt = attempt_no;
            if attempt_no > 1 {
                preq.headers = header_snapshot.clone();
            }

            for (_, observer) in &observers {
                observer.on_request(&preq).await;
            }

            let mut ran: Vec<&Arc<dyn Middleware>> = Vec::with_capacity(middlewares.len());
            let mut short_circuit: Option<Response<Body>> = None;
            for (key, mw) in &middlewares {
                match mw.on_request(&mut preq).await {
                    Ok(None) => ran.push(mw),
                    Ok(Some(response)) => {
                        ran.push(mw);
                        short_circuit = Some(response);
                        break;
                    }
                    Err(e) => {
                        warn!(middleware = %key, error = %e, "middleware failed");
                        ran.push(mw);
                        short_circuit = Some(e.into_response());
                        break;
                    }
                }
            }

            if let Some(response) = short_circuit {
                let attempt = Attempt {
                    index: attempt_no,
                    status: Some(response.status()),
                    ..Attempt::default()
                };
                run_response_pass(&ran, &observers, &preq, &attempt).await;
                return Ok(response);
            }

            let Some(endpoint) = self.balancer.next_endpoint() else {
                let attempt = Attempt {
                    index: attempt_no,
                    status: Some(StatusCode::BAD_GATEWAY),
                    ..Attempt::default()
                };
                run_response_pass(&ran, &observers, &preq, &attempt).await;
                return Err(ProxyError::NoEndpoints);
            };

            let start = Instant::now();
            let outcome = forward(&forwarder, &preq, &endpoint, &staged).await;
            let duration = start.elapsed();

            match outcome {
                Ok(upstream_response) => {
                    let attempt = Attempt {
                        index: attempt_no,
                        endpoint: Some(endpoint.clone()),
                        status: Some(upstream_response.status()),
                        error: None,
                        duration,
                    };
                    self.perf.record(endpoint.id(), &attempt);
                    let retry =
                        attempt_no < max_attempts && options.failover.should_failover(&attempt);
                    run_response_pass(&ran, &observers, &preq, &attempt).await;
                    if retry {
                        debug!(
                            endpoint = %endpoint.id(),
                            status = %upstream_response.status(),
                            attempt = attempt_no,
                            "failing over"
                        );
                        continue;
                    }
                    return Ok(into_client_response(upstream_response));
                }
                Err(e) => {
                    let attempt = Attempt {
                        index: attempt_no,
                        endpoint: Some(endpoint.clone()),
                        status: None,
                        error: Some(e.to_string()),
                        duration,
                    };
                    self.perf.record(endpoint.id(), &attempt);
                    let retry =
                        attempt_no < max_attempts && options.failover.should_failover(&attempt);
                    run_response_pass(&ran, &observers, &preq, &attempt).await;
                    if retry {
                        debug!(endpoint = %endpoint.id(), error = %e, attempt = attempt_no, "failing over");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

async fn run_response_pass(
    ran: &[&Arc<dyn Middleware>],
    observers: &[(String, Arc<dyn Observer>)],
    preq: &ProxyRequest,
    attempt: &Attempt,
) {
    for mw in ran.iter().rev() {
        mw.on_response(preq, attempt).await;
    }
    for (_, observer) in observers {
        observer.on_response(preq, attempt).await;
    }
}

fn build_forwarder(options: &Options) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(options.timeouts.dial)
        .read_timeout(options.timeouts.read)
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build forwarder: {e}")))
}

fn set_forward_headers(preq: &mut ProxyRequest, options: &Options) {
    let hop_ip = preq.client_addr.ip().to_string();
    let existing_for = preq.header(X_FORWARDED_FOR).map(str::to_string);
    let forwarded_for = match existing_for {
        Some(prior) if options.trust_forward_header => format!("{prior}, {hop_ip}"),
        _ => hop_ip,
    };
    if let Ok(value) = forwarded_for.parse() {
        preq.headers.insert(X_FORWARDED_FOR, value);
    }

    let keep_proto = options.trust_forward_header && preq.header(X_FORWARDED_PROTO).is_some();
    if !keep_proto {
        if let Ok(value) = preq.scheme.parse() {
            preq.headers.insert(X_FORWARDED_PROTO, value);
        }
    }

    if let Some(host) = preq.host_header().map(str::to_string) {
        if let Ok(value) = host.parse() {
            preq.headers.insert(X_FORWARDED_HOST, value);
        }
    }

    if !options.hostname.is_empty() {
        if let Ok(value) = options.hostname.parse() {
            preq.headers.insert(X_FORWARDED_SERVER, value);
        }
    }
}

async fn forward(
    client: &reqwest::Client,
    preq: &ProxyRequest,
    endpoint: &MuxEndpoint,
    staged: &StagedBody,
) -> Result<reqwest::Response> {
    let mut url = endpoint.url().clone();
    url.set_path(preq.uri.path());
    url.set_query(preq.uri.query());

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in preq.headers.iter() {
        if is_hop_by_hop_header(name) || name == &header::HOST {
            continue;
        }
        headers.append(name, value.clone());
    }

    let mut builder = client
        .request(preq.method.clone(), url)
        .headers(headers);
    if staged.len() > 0 {
        builder = builder.body(staged.to_body().await?);
    }

    builder.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::Timeout(e.to_string())
        } else {
            ProxyError::Transport(e.to_string())
        }
    })
}

fn into_client_response(upstream: reqwest::Response) -> Response<Body> {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop_header(name) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            error!("failed to build response: {e}");
            ProxyError::Internal(e.to_string()).into_response()
        })
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// A request body staged for replay: held in memory up to the memory limit,
/// spilled to a temporary file beyond it. Each forwarding attempt reads a
/// fresh copy, so failover can resend the body.
pub struct StagedBody {
    mem: Bytes,
    spill: Option<tempfile::TempPath>,
    len: u64,
}

impl StagedBody {
    pub async fn stage(body: Body, max_mem: i64, max_body: i64) -> Result<Self> {
        let mut stream = body.into_data_stream();
        let mut mem = BytesMut::new();
        let mut spill: Option<tokio::fs::File> = None;
        let mut spill_path: Option<tempfile::TempPath> = None;
        let mut total: i64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ProxyError::Internal(format!("failed to read body: {e}")))?;
            total += chunk.len() as i64;
            if max_body > 0 && total > max_body {
                return Err(ProxyError::Admission {
                    got: total,
                    limit: max_body,
                });
            }
            match spill.as_mut() {
                Some(file) => file.write_all(&chunk).await?,
                None => {
                    mem.extend_from_slice(&chunk);
                    if (mem.len() as i64) > max_mem {
                        let named = tempfile::NamedTempFile::new()?;
                        let (std_file, path) = named.into_parts();
                        let mut file = tokio::fs::File::from_std(std_file);
                        file.write_all(&mem).await?;
                        mem.clear();
                        spill_path = Some(path);
                        spill = Some(file);
                    }
                }
            }
        }
        if let Some(file) = spill.as_mut() {
            file.flush().await?;
        }

        Ok(Self {
            mem: mem.freeze(),
            spill: spill_path,
            len: total.max(0) as u64,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub async fn to_body(&self) -> Result<reqwest::Body> {
        match &self.spill {
            None => Ok(reqwest::Body::from(self.mem.clone())),
            Some(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        }
    }
}
