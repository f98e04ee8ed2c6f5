use crate::error::AppError;
use crate::launcher::ExitReason;
use crate::registry::{ActiveSession, SessionState};
use crate::state::SharedState;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};

/// 会话进入终态的原因，落入历史表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 显式停止请求
    Requested,
    /// 计划时长到期
    Scheduled,
    /// 推流自然播完
    NormalEnd,
    /// 进程异常崩溃
    Crash,
    /// 服务停机兜底终止
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::Scheduled => "scheduled",
            StopReason::NormalEnd => "ended",
            StopReason::Crash => "crash",
            StopReason::Shutdown => "shutdown",
        }
    }
}

/// 启动请求载荷 (字段沿用面板前端的命名)
///
/// 字段全部可选，缺失校验由 Supervisor 统一给出 `InvalidRequest`，
/// 而不是交给反序列化层直接 422。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    pub rtmp_url: Option<String>,
    pub stream_key: Option<String>,
    #[serde(default, rename = "loop")]
    pub loop_enabled: bool,
    pub title: Option<String>,
    pub video_path: Option<String>,
    pub duration_minutes: Option<u64>,
}

/// 校验后的启动参数
struct ValidStart {
    rtmp_url: String,
    stream_key: String,
    loop_enabled: bool,
    title: String,
    video_path: String,
    duration_minutes: u64,
}

fn require(field: Option<String>, name: &str) -> Result<String, AppError> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AppError::InvalidRequest(format!(
            "Missing required field: {}",
            name
        ))),
    }
}

fn validate(req: StartRequest) -> Result<ValidStart, AppError> {
    let rtmp_url = require(req.rtmp_url, "rtmp_url")?;
    let stream_key = require(req.stream_key, "stream_key")?;
    let title = require(req.title, "title")?;
    let video_path = require(req.video_path, "video_path")?;
    let duration_minutes = req.duration_minutes.ok_or_else(|| {
        AppError::InvalidRequest("Missing required field: duration_minutes".to_string())
    })?;

    // 时长区间与调度器约束一致，进程拉起之前快速失败
    if !(crate::scheduler::MIN_DURATION_MINUTES..=crate::scheduler::MAX_DURATION_MINUTES)
        .contains(&duration_minutes)
    {
        return Err(AppError::InvalidDuration(duration_minutes));
    }

    // 素材路径不允许逃逸出素材根目录
    if Path::new(&video_path)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return Err(AppError::InvalidRequest(format!(
            "Illegal video path: {}",
            video_path
        )));
    }

    Ok(ValidStart {
        rtmp_url,
        stream_key,
        loop_enabled: req.loop_enabled,
        title,
        video_path,
        duration_minutes,
    })
}

pub struct Supervisor;

impl Supervisor {
    /// 启动一次推流会话
    ///
    /// 校验 → 注册表预占位 → 拉起进程 → 落库 → 补齐句柄 →
    /// 布置定时器，并为进程退出派生一个守望任务。
    /// 拉起失败时回滚预占位，不留下孤儿 `Starting` 条目；
    /// 占位在拉起期间被并发停止移除时，进程就地回收。
    pub async fn start_session(state: &SharedState, req: StartRequest) -> Result<String, AppError> {
        let v = validate(req)?;

        let destination_url = format!(
            "{}/{}",
            v.rtmp_url.trim_end_matches('/'),
            v.stream_key
        );

        // 注册表比较并插入：同 key 并发启动只允许一个成功
        let reserved = state.registry.try_insert(ActiveSession {
            key: v.stream_key.clone(),
            title: v.title.clone(),
            video_path: v.video_path.clone(),
            destination_url: destination_url.clone(),
            handle: None,
            started_at: Utc::now(),
            duration_minutes: v.duration_minutes,
            state: SessionState::Starting,
        });
        if !reserved {
            return Err(AppError::DuplicateStreamKey(v.stream_key));
        }

        let source = PathBuf::from(&state.config.server.media_root).join(&v.video_path);
        let handle = match state
            .launcher
            .launch(&source, &destination_url, v.loop_enabled)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                // 回滚预占位
                state.registry.remove(&v.stream_key);
                return Err(e);
            }
        };

        // 先落库再布置定时器与守望任务：两者驱动的任何一次停止
        // 都必然看到这条记录，翻转不会落空
        if let Err(e) = state
            .store
            .record_start(
                &v.stream_key,
                &v.title,
                &v.video_path,
                &v.rtmp_url,
                v.duration_minutes,
            )
            .await
        {
            error!("Failed to persist stream start [{}]: {}", v.stream_key, e);
        }

        // 占位在拉起窗口期内可能已被并发停止移除；那次停止翻转不到
        // 刚写入的记录，由这里补一次翻转并回收进程
        if !state.registry.set_running(&v.stream_key, handle.clone()) {
            info!(
                "Stream [{}] was stopped while starting. Reclaiming process.",
                v.stream_key
            );
            handle.terminate();
            if let Err(e) = state
                .store
                .record_stop(&v.stream_key, StopReason::Requested.as_str())
                .await
            {
                error!("Failed to persist stream stop [{}]: {}", v.stream_key, e);
            }
            return Err(AppError::StreamNotFound(v.stream_key));
        }

        // 计划到期与显式停止共用同一条幂等停止路径
        let arm_result = {
            let fire_state = state.clone();
            let key = v.stream_key.clone();
            state.scheduler.arm(&v.stream_key, v.duration_minutes, async move {
                info!(
                    "Scheduled duration elapsed for [{}]. Stopping automatically.",
                    key
                );
                if let Err(e) =
                    Supervisor::stop_session(&fire_state, &key, StopReason::Scheduled).await
                {
                    debug!("Auto-stop for [{}] found no session: {:?}", key, e);
                }
            })
        };
        if let Err(e) = arm_result {
            state.registry.remove(&v.stream_key);
            handle.terminate();
            let _ = state
                .store
                .record_stop(&v.stream_key, StopReason::Requested.as_str())
                .await;
            return Err(e);
        }

        // 守望任务：进程自行退出时驱动同一条停止路径
        {
            let state = state.clone();
            let key = v.stream_key.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.wait().await {
                    // 停止路径自己发出的终止，无需再走一遍
                    ExitReason::KilledByRequest => {}
                    ExitReason::NormalExit => {
                        info!("Stream [{}] finished playback.", key);
                        let _ =
                            Supervisor::stop_session(&state, &key, StopReason::NormalEnd).await;
                    }
                    ExitReason::CrashExit => {
                        warn!("Stream [{}] process exited unexpectedly.", key);
                        let _ = Supervisor::stop_session(&state, &key, StopReason::Crash).await;
                    }
                }
            });
        }

        info!(
            "Stream [{}] started -> {} ({} min)",
            v.stream_key, destination_url, v.duration_minutes
        );
        Ok(v.stream_key)
    }

    /// 停止一次推流会话
    ///
    /// 唯一能把会话迁入终态并写历史的代码路径；显式停止、定时到期、
    /// 进程退出三种触发全部汇聚到这里。注册表移除是线性化点：
    /// 只有成功移除的调用方才会写历史，重复停止得到 `StreamNotFound`。
    pub async fn stop_session(
        state: &SharedState,
        key: &str,
        reason: StopReason,
    ) -> Result<(), AppError> {
        state.scheduler.cancel(key);

        let session = match state.registry.remove(key) {
            Some(session) => session,
            None => {
                // 良性：会话已处于终态
                debug!("Stop requested for unknown stream [{}]", key);
                return Err(AppError::StreamNotFound(key.to_string()));
            }
        };

        if let Some(handle) = &session.handle {
            handle.terminate();
        }

        let terminal = match reason {
            StopReason::Crash => SessionState::Failed,
            _ => SessionState::Stopped,
        };
        debug!("Session [{}] entered terminal state {:?}", key, terminal);

        // 锁早已释放，慢速的持久化写不会卡住注册表
        let persisted = match reason {
            StopReason::Crash => state.store.record_crash(key).await,
            _ => state.store.record_stop(key, reason.as_str()).await,
        };
        match persisted {
            Ok(true) => {}
            Ok(false) => debug!("Stream [{}] was already marked stopped in storage", key),
            Err(e) => error!("Failed to persist stream stop [{}]: {}", key, e),
        }

        info!("Stream [{}] stopped ({})", key, reason.as_str());
        Ok(())
    }

    /// 停机兜底：终止所有存活会话并落库
    pub async fn teardown(state: &SharedState) {
        let sessions = state.registry.drain();
        if sessions.is_empty() {
            return;
        }
        info!("Tearing down {} live session(s)", sessions.len());

        for session in sessions {
            state.scheduler.cancel(&session.key);
            if let Some(handle) = &session.handle {
                handle.terminate();
            }
            if let Err(e) = state
                .store
                .record_stop(&session.key, StopReason::Shutdown.as_str())
                .await
            {
                error!(
                    "Failed to persist shutdown stop [{}]: {}",
                    session.key, e
                );
            }
        }
    }
}
