use super::{body, success, ApiResult};
use crate::error::Error;
use crate::proxy::{ProbeSample, ProxyAction, ProxyProfile};
use crate::state::SharedState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ConfigRequest {
    pub profiles: Vec<ProxyProfile>,
    #[serde(default)]
    pub active_profile_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    /// 不传时测试直连
    #[serde(default)]
    pub profile: Option<ProxyProfile>,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: ProxyAction,
    #[serde(default)]
    pub profile_id: Option<String>,
}

pub async fn status(State(state): State<SharedState>) -> ApiResult {
    success(state.proxy.status().await)
}

pub async fn update_config(
    State(state): State<SharedState>,
    payload: Result<Json<ConfigRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    success(
        state
            .proxy
            .update_config(req.profiles, req.active_profile_id)
            .await?,
    )
}

/// 一次性探测；网络层失败作为探测结果返回，而不是请求错误
pub async fn test(
    State(state): State<SharedState>,
    payload: Result<Json<TestRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    match state
        .proxy
        .test_proxy_config(req.profile.as_ref(), req.target.as_deref())
        .await
    {
        Ok(sample) => success(sample),
        Err(e @ (Error::ProbeFailure { .. } | Error::ProbeTimeout { .. })) => {
            success(ProbeSample::from_result(&Err(e)))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn control(
    State(state): State<SharedState>,
    payload: Result<Json<ControlRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    success(
        state
            .proxy
            .control(req.action, req.profile_id.as_deref())
            .await?,
    )
}

pub async fn delete_profile(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    success(state.proxy.delete_profile(&id).await?)
}
