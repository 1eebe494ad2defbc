use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error kinds recognized by the proxy core.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("request body over limit: got {got} bytes, limit {limit}")]
    Admission { got: i64, limit: i64 },

    #[error("no route matched")]
    RouteMiss,

    #[error("no available endpoints")]
    NoEndpoints,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("middleware error: {0}")]
    Middleware(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Admission { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::RouteMiss => StatusCode::NOT_FOUND,
            ProxyError::NoEndpoints => StatusCode::BAD_GATEWAY,
            ProxyError::Transport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Middleware(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Bind(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "CONFIG_ERROR",
            ProxyError::Bind(_) => "BIND_ERROR",
            ProxyError::Admission { .. } => "BODY_OVER_LIMIT",
            ProxyError::RouteMiss => "ROUTE_MISS",
            ProxyError::NoEndpoints => "NO_ENDPOINTS",
            ProxyError::Transport(_) => "TRANSPORT_ERROR",
            ProxyError::Timeout(_) => "UPSTREAM_TIMEOUT",
            ProxyError::Middleware(_) => "MIDDLEWARE_ERROR",
            ProxyError::Internal(_) => "INTERNAL_ERROR",
            ProxyError::Io(_) => "IO_ERROR",
            ProxyError::Json(_) => "JSON_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ProxyError::Admission { got: 42, limit: 8 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ProxyError::RouteMiss.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyError::NoEndpoints.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::Timeout("read".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
