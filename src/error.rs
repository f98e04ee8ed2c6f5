use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// 应用统一错误类型
///
/// 校验类错误在任何子进程被拉起之前同步返回；
/// `StreamNotFound` 属于良性错误 (重复停止视为已停止)。
#[derive(Debug)]
pub enum AppError {
    /// 请求字段缺失或非法
    InvalidRequest(String),
    /// 时长超出 1..=1440 分钟
    InvalidDuration(u64),
    /// 流密钥已被占用
    DuplicateStreamKey(String),
    /// 源视频文件不存在
    SourceNotFound(String),
    /// 外部进程启动失败
    LaunchFailure(String),
    /// 未找到对应的活跃流
    StreamNotFound(String),
    /// 其他内部错误
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::InvalidDuration(minutes) => (
                StatusCode::BAD_REQUEST,
                format!(
                    "duration_minutes must be between 1 and 1440, got {}",
                    minutes
                ),
            ),
            AppError::DuplicateStreamKey(key) => (
                StatusCode::CONFLICT,
                format!("Stream key [{}] is already streaming", key),
            ),
            AppError::SourceNotFound(path) => (
                StatusCode::NOT_FOUND,
                format!("Source video not found: {}", path),
            ),
            AppError::LaunchFailure(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to launch streaming process: {}", msg),
            ),
            AppError::StreamNotFound(key) => (
                StatusCode::NOT_FOUND,
                format!("Stream [{}] not found", key),
            ),
            AppError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError::Internal(err.into())
    }
}
