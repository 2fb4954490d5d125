use super::{body, success, ApiResult};
use crate::channel::Channel;
use crate::state::SharedState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};

/// 获取系统状态 API
/// 返回宿主机的内存和负载信息
pub async fn sys_status(State(state): State<SharedState>) -> ApiResult {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    success(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// worker 与代理探测的统计
pub async fn stats(State(state): State<SharedState>) -> ApiResult {
    let proxy = state.proxy.status().await;
    success(serde_json::json!({
        "workers": state.supervisor.stats(),
        "proxy": proxy.statistics,
    }))
}

pub async fn list_channels(State(state): State<SharedState>) -> ApiResult {
    success(state.supervisor.statuses())
}

pub async fn channel_status(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    success(state.supervisor.status(&id)?)
}

pub async fn add_channel(
    State(state): State<SharedState>,
    payload: Result<Json<Channel>, JsonRejection>,
) -> ApiResult {
    let channel = body(payload)?;
    success(state.supervisor.add_channel(channel)?)
}

pub async fn remove_channel(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    state.supervisor.remove_channel(&id).await?;
    success(serde_json::json!({ "removed": id }))
}

/// 手动启动流 API
pub async fn handle_start(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    success(state.supervisor.start_channel(&id).await?)
}

/// 手动停止流 API
pub async fn handle_stop(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    success(state.supervisor.stop_channel(&id).await?)
}

pub async fn handle_restart(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    success(state.supervisor.restart_channel(&id).await?)
}
