use crate::error::AppError;
use crate::monitor;
use crate::state::SharedState;
use crate::supervisor::{StartRequest, StopReason, Supervisor};
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

/// 提供内嵌的控制台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// 返回系统的内存、负载与存活会话数，作为 JSON 响应
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let mem = sys_info::mem_info()
        .map(|m| (m.total, m.avail))
        .unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "live_sessions": state.registry.list().len(),
    }))
}

/// 启动推流 API
pub async fn handle_start(
    State(state): State<SharedState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stream_key = Supervisor::start_session(&state, req).await?;
    Ok(Json(serde_json::json!({ "stream_key": stream_key })))
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub stream_key: Option<String>,
}

/// 停止推流 API
/// 对未知 key 返回 404，调用方应将其视为"已经停止"
pub async fn handle_stop(
    State(state): State<SharedState>,
    Json(body): Json<StopBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let key = body
        .stream_key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            AppError::InvalidRequest("Missing required field: stream_key".to_string())
        })?;

    Supervisor::stop_session(&state, &key, StopReason::Requested).await?;
    Ok(Json(serde_json::json!({})))
}

/// 推流状态 SSE
/// 每个 tick 推送一条状态快照；会话结束后补发一条 auto_stopped
/// 事件并关闭连接。客户端断开即丢弃底层序列，不残留定时器。
pub async fn stream_status(
    State(state): State<SharedState>,
    Path(stream_key): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let every = state.config.server.status_interval();
    let events = monitor::watch(state, stream_key, every).map(|snapshot| {
        let data = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// 活跃会话摘要：持久化的 active 记录，叠加注册表的实时状态
#[derive(Debug, Serialize)]
pub struct ActiveSessionView {
    pub stream_key: String,
    pub title: String,
    pub video_path: String,
    pub stream_url: String,
    pub schedule_duration: i64,
    pub is_streaming: bool,
    /// 本实例注册表中是否存在对应的活跃会话
    pub live: bool,
    pub uptime_seconds: u64,
}

/// 活跃会话列表 API
pub async fn active_sessions(
    State(state): State<SharedState>,
) -> Result<Json<Vec<ActiveSessionView>>, AppError> {
    let containers = state.store.active_containers().await?;
    let now = Utc::now();

    let views = containers
        .into_iter()
        .map(|c| {
            let live = state.registry.get(&c.stream_key);
            let uptime_seconds = live
                .as_ref()
                .map(|s| (now - s.started_at).num_seconds().max(0) as u64)
                .unwrap_or(0);
            ActiveSessionView {
                stream_key: c.stream_key,
                title: c.title,
                video_path: c.video_path,
                stream_url: c.stream_url,
                schedule_duration: c.schedule_duration,
                is_streaming: c.is_streaming == 1,
                live: live.is_some(),
                uptime_seconds,
            }
        })
        .collect();

    Ok(Json(views))
}

/// 推流历史 API
pub async fn history(
    State(state): State<SharedState>,
) -> Result<Json<Vec<crate::store::HistoryEntry>>, AppError> {
    let entries = state.store.history().await?;
    Ok(Json(entries))
}

/// 删除一条推流历史
pub async fn delete_history(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.store.delete_history(id).await? {
        return Err(AppError::StreamNotFound(format!("history #{}", id)));
    }
    Ok(Json(serde_json::json!({ "message": "History entry deleted" })))
}
