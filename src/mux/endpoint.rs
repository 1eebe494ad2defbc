use std::fmt;
use std::sync::Arc;

use reqwest::Url;

use crate::error::{ProxyError, Result};
use crate::model::Endpoint;
use crate::stats::{PerfMonitor, RoundTripStats};

/// Immutable description of an upstream target: parsed URL, stable id and a
/// handle to the per-endpoint round-trip stats.
#[derive(Clone)]
pub struct MuxEndpoint {
    id: String,
    url: Url,
    perf: Arc<PerfMonitor>,
}

impl MuxEndpoint {
    pub fn new(endpoint: &Endpoint, perf: Arc<PerfMonitor>) -> Result<Self> {
        let url = Url::parse(&endpoint.url)
            .map_err(|e| ProxyError::Config(format!("bad endpoint url '{}': {e}", endpoint.url)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::Config(format!(
                    "bad endpoint scheme '{other}' in '{}'",
                    endpoint.url
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(ProxyError::Config(format!(
                "endpoint url '{}' has no host",
                endpoint.url
            )));
        }
        Ok(Self {
            id: endpoint.key(),
            url,
            perf,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn stats(&self) -> Option<RoundTripStats> {
        self.perf.endpoint_stats(&self.id)
    }

    pub fn reset_stats(&self) {
        self.perf.reset_endpoint(&self.id)
    }
}

impl fmt::Debug for MuxEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MuxEndpoint(id={}, url={})", self.id, self.url)
    }
}
