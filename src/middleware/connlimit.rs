use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Variable;
use crate::error::{ProxyError, Result};
use crate::model::MiddlewareInstance;
use crate::mux::chain::{Attempt, Middleware, ProxyRequest};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnLimitSettings {
    pub connections: i64,
    pub variable: String,
}

/// Caps concurrent in-flight requests per client dimension. The slot taken
/// in `on_request` is returned in `on_response`, which the chain fires once
/// per attempt for every middleware whose request phase ran.
pub struct ConnLimit {
    settings: ConnLimitSettings,
    variable: Variable,
    active: DashMap<String, i64>,
}

impl ConnLimit {
    pub fn from_instance(instance: &MiddlewareInstance) -> Result<Arc<dyn Middleware>> {
        let settings: ConnLimitSettings = serde_json::from_value(instance.payload.clone())
            .map_err(|e| ProxyError::Config(format!("bad connlimit payload: {e}")))?;
        Ok(Self::new(settings)?)
    }

    pub fn new(settings: ConnLimitSettings) -> Result<Arc<Self>> {
        let variable = Variable::parse(&settings.variable)?;
        if settings.connections <= 0 {
            return Err(ProxyError::Config(format!(
                "connections should be > 0, got {}",
                settings.connections
            )));
        }
        Ok(Arc::new(Self {
            settings,
            variable,
            active: DashMap::new(),
        }))
    }

    pub fn settings(&self) -> &ConnLimitSettings {
        &self.settings
    }

    pub fn active_for(&self, key: &str) -> i64 {
        self.active.get(key).map(|v| *v).unwrap_or(0)
    }
}

#[async_trait]
impl Middleware for ConnLimit {
    async fn on_request(&self, req: &mut ProxyRequest) -> Result<Option<Response<Body>>> {
        let key = self.variable.extract(req);
        let count = {
            let mut entry = self.active.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count > self.settings.connections {
            debug!(key = %key, count, "connection limit reached");
            return Ok(Some(
                (StatusCode::TOO_MANY_REQUESTS, "connection limit reached").into_response(),
            ));
        }
        Ok(None)
    }

    async fn on_response(&self, req: &ProxyRequest, _attempt: &Attempt) {
        let key = self.variable.extract(req);
        let mut remove = false;
        if let Some(mut entry) = self.active.get_mut(&key) {
            *entry -= 1;
            remove = *entry <= 0;
        }
        if remove {
            self.active.remove_if(&key, |_, v| *v <= 0);
        }
    }
}
