//! HTTP 控制面：把请求翻译为 ProxyManager / StreamSupervisor 调用，
//! 结果统一包装为 `{status, data|message}`。

pub mod admin;
pub mod proxy;

use crate::error::Error;
use crate::state::SharedState;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

/// 处理函数的统一返回类型
pub type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

pub fn success<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(json!({ "status": "success", "data": data })))
}

/// 请求体解析失败同样按校验错误返回
pub fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError(Error::Validation(e.body_text())))
}

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UnknownChannel(_) | Error::UnknownProfile(_) | Error::UnknownTarget(_) => {
                StatusCode::NOT_FOUND
            }
            Error::AlreadyRunning(_) | Error::NotRunning(_) => StatusCode::CONFLICT,
            Error::ProbeFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::ProbeTimeout { .. }
            | Error::StartupTimeout { .. }
            | Error::ShutdownTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::CrashLoopExceeded { .. }
            | Error::Spawn { .. }
            | Error::InsufficientMemory { .. }
            | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = json!({ "status": "error", "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/sys/status", get(admin::sys_status))
        .route("/api/stats", get(admin::stats))
        .route(
            "/api/channels",
            get(admin::list_channels).post(admin::add_channel),
        )
        .route(
            "/api/channels/:id",
            get(admin::channel_status).delete(admin::remove_channel),
        )
        .route("/api/channels/:id/start", post(admin::handle_start))
        .route("/api/channels/:id/stop", post(admin::handle_stop))
        .route("/api/channels/:id/restart", post(admin::handle_restart))
        .route("/api/proxy/status", get(proxy::status))
        .route("/api/proxy/config", post(proxy::update_config))
        .route("/api/proxy/test", post(proxy::test))
        .route("/api/proxy/control", post(proxy::control))
        .route("/api/proxy/profiles/:id", axum::routing::delete(proxy::delete_profile))
        .with_state(state)
}
