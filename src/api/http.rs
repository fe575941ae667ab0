//! HTTP API Server
//!
//! Local administration endpoints: collective view, invitations, joining,
//! member removal and status.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::collective::Collective;
use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    collective: Arc<Collective>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, collective: Arc<Collective>) -> Self {
        Self { config, collective }
    }

    /// Create the router
    pub fn create_router(collective: Arc<Collective>) -> Router {
        Router::new()
            .route("/collective", get(handle_show))
            .route("/collective/invite", post(handle_invite))
            .route("/collective/join", post(handle_join))
            .route("/collective/members/:name", delete(handle_delete))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(collective)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.collective));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Invite request
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteRequest {
    pub name: String,
}

/// Invite response
#[derive(Debug, Deserialize, Serialize)]
pub struct InviteResponse {
    pub name: String,
    pub invitation: String,
}

/// Join request
#[derive(Debug, Deserialize, Serialize)]
pub struct JoinRequest {
    pub invitation: String,
    pub server: String,
}

/// Outcome of an operation with nothing else to report
#[derive(Debug, Deserialize, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub name: String,
}

/// Error response
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper mapping collective errors onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            e if e.is_degraded() => (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED"),
            Error::UnknownMember(_) => (StatusCode::NOT_FOUND, "UNKNOWN_MEMBER"),
            e if e.is_security_event() => (StatusCode::FORBIDDEN, "UNTRUSTED"),
            Error::NotLeader(_) => (StatusCode::CONFLICT, "NOT_LEADER"),
            Error::MemberActive(_) => (StatusCode::CONFLICT, "MEMBER_ACTIVE"),
            Error::NotInCollective => (StatusCode::BAD_REQUEST, "NOT_IN_COLLECTIVE"),
            e if e.is_retryable() => (StatusCode::BAD_GATEWAY, "UNREACHABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_show(
    State(collective): State<Arc<Collective>>,
) -> ApiResult<crate::replication::CollectiveInfo> {
    Ok(Json(collective.show().await?))
}

async fn handle_invite(
    State(collective): State<Arc<Collective>>,
    Json(req): Json<InviteRequest>,
) -> ApiResult<InviteResponse> {
    let invitation = collective.invite(&req.name).await?;
    Ok(Json(InviteResponse {
        name: req.name,
        invitation,
    }))
}

async fn handle_join(
    State(collective): State<Arc<Collective>>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<MessageResponse> {
    let message = collective.join(&req.invitation, &req.server).await?;
    Ok(Json(MessageResponse { message }))
}

async fn handle_delete(
    State(collective): State<Arc<Collective>>,
    Path(name): Path<String>,
) -> ApiResult<MessageResponse> {
    let message = collective.delete(&name).await?;
    Ok(Json(MessageResponse { message }))
}

async fn handle_status(
    State(collective): State<Arc<Collective>>,
) -> ApiResult<crate::collective::StatusReport> {
    Ok(Json(collective.status().await))
}

async fn handle_health(State(collective): State<Arc<Collective>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: !collective.is_stopped(),
        name: collective.myname().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let status = |e: Error| ApiError(e).status().0;

        assert_eq!(status(Error::DegradedCollective), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(Error::CertificateMismatch("mgt2".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(Error::InvalidProof("mgt2".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(Error::UnknownMember("mgt9".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::NotLeader("10.0.0.1".into())), StatusCode::CONFLICT);
        assert_eq!(status(Error::ConnectionTimeout("10.0.0.1".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status(Error::Store("disk".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
