//! Error taxonomy for the gateway.
//!
//! Internal plumbing uses `anyhow::Result`; this module defines the typed
//! boundary errors that map onto HTTP responses. Clients always receive a
//! JSON body of the shape `{"code": <status>, "message": <text>}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid deployment configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected client payload.
    #[error("{0}")]
    Validation(String),

    /// Invalid webhook signature or API key.
    #[error("{0}")]
    Authorization(String),

    /// Authenticated but not allowed (permission handshake denied).
    #[error("{0}")]
    Forbidden(String),

    /// Unknown call id / session id.
    #[error("{0}")]
    NotFound(String),

    /// An external collaborator failed (provider, merger, storage).
    #[error("{0}")]
    Dependency(String),

    /// Malformed SDP or JSON.
    #[error("{0}")]
    Protocol(String),

    /// A deadline passed.
    #[error("{0}")]
    Timeout(String),

    /// Anything else; details stay in the logs.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) | Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::Authorization(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Dependency(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let message = match &self {
            // Internal details never reach the client.
            Self::Internal(_) => "internal error".to_owned(),
            other => other.to_string(),
        };
        (
            status,
            Json(serde_json::json!({
                "code": status.as_u16(),
                "message": message,
            })),
        )
            .into_response()
    }
}

/// Convenience body for success responses that only carry a message.
pub fn ok_body(message: &str) -> serde_json::Value {
    serde_json::json!({"code": 200, "message": message})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Authorization("no".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden("denied".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::NotFound("gone".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Timeout("late".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Dependency("down".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_error_message_is_opaque() {
        let err = GatewayError::Internal(anyhow::anyhow!("secret database detail"));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn ok_body_shape() {
        let body = ok_body("Call accepted successfully");
        assert_eq!(body["code"], 200);
        assert_eq!(body["message"], "Call accepted successfully");
    }
}
