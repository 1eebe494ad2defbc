pub mod connlimit;
pub mod ratelimit;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::model::MiddlewareInstance;
use crate::mux::chain::{Middleware, ProxyRequest};

type Factory = fn(&MiddlewareInstance) -> Result<Arc<dyn Middleware>>;

/// Builds concrete middlewares from typed chain instances. Each registered
/// type owns its payload schema; an unknown type is a configuration error
/// and the event carrying it is rejected.
pub struct MiddlewareRegistry {
    factories: HashMap<String, Factory>,
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("ratelimit", ratelimit::RateLimit::from_instance);
        registry.register("connlimit", connlimit::ConnLimit::from_instance);
        registry
    }
}

impl MiddlewareRegistry {
    pub fn register(&mut self, kind: &str, factory: Factory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn build(&self, instance: &MiddlewareInstance) -> Result<Arc<dyn Middleware>> {
        let factory = self.factories.get(&instance.kind).ok_or_else(|| {
            ProxyError::Config(format!("unsupported middleware type: {}", instance.kind))
        })?;
        factory(instance)
    }
}

/// The dimension a limiter counts against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    ClientIp,
    RequestHost,
    RequestHeader(String),
}

impl Variable {
    /// Parses `client.ip`, `request.host` or `request.header.<Name>`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "client.ip" => Ok(Variable::ClientIp),
            "request.host" => Ok(Variable::RequestHost),
            other => match other.strip_prefix("request.header.") {
                Some(name) if !name.is_empty() => Ok(Variable::RequestHeader(name.to_string())),
                _ => Err(ProxyError::Config(format!("unsupported variable: {raw}"))),
            },
        }
    }

    pub fn extract(&self, req: &ProxyRequest) -> String {
        match self {
            Variable::ClientIp => req.client_addr.ip().to_string(),
            Variable::RequestHost => req.host_header().unwrap_or_default().to_string(),
            Variable::RequestHeader(name) => req.header(name).unwrap_or_default().to_string(),
        }
    }
}
