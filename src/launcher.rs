use crate::error::AppError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// 子进程退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// 正常退出 (推流自然结束)
    NormalExit,
    /// 被显式终止
    KilledByRequest,
    /// 异常崩溃
    CrashExit,
}

/// 推流子进程句柄
///
/// 句柄是子进程生命周期的唯一所有者，其他组件只能通过
/// `wait` / `terminate` / `is_alive` 与进程交互。
/// 句柄可廉价克隆，所有克隆共享同一个退出通知。
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitReason>>,
}

impl ProcessHandle {
    /// 接管一个已启动的子进程，由内部任务独占等待其退出
    fn monitor(mut child: Child) -> Self {
        let kill = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        let token = kill.clone();

        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => match status {
                    Ok(s) if s.success() => ExitReason::NormalExit,
                    Ok(_) => ExitReason::CrashExit,
                    Err(e) => {
                        error!("Process wait failed: {}", e);
                        ExitReason::CrashExit
                    }
                },
                _ = token.cancelled() => {
                    // 强制终止，随后回收僵尸进程
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    ExitReason::KilledByRequest
                }
            };
            let _ = tx.send(Some(reason));
        });

        Self { kill, exit: rx }
    }

    /// 阻塞当前任务直到进程退出 (自然退出或被终止)
    pub async fn wait(&self) -> ExitReason {
        let mut rx = self.exit.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ExitReason::CrashExit;
            }
        }
    }

    /// 发送强制终止信号；可重复调用，第二次及以后为空操作
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// 非阻塞探测进程是否仍在运行
    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// 构造一个不绑定真实进程的句柄，退出时机由测试方脚本控制
    #[cfg(test)]
    pub(crate) fn scripted() -> (Self, tokio::sync::oneshot::Sender<ExitReason>) {
        let kill = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let token = kill.clone();

        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = token.cancelled() => ExitReason::KilledByRequest,
                r = exit_rx => r.unwrap_or(ExitReason::CrashExit),
            };
            let _ = tx.send(Some(reason));
        });

        (Self { kill, exit: rx }, exit_tx)
    }
}

/// 推流进程启动器
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// 为给定源文件与推流地址启动一个外部进程
    async fn launch(
        &self,
        source: &Path,
        dest_url: &str,
        loop_enabled: bool,
    ) -> Result<ProcessHandle, AppError>;
}

/// 基于 FFmpeg 的启动器实现
///
/// 音视频直接透传 (`-c copy`) 不做转码；循环播放与透传
/// 均为启动期参数，运行期不可变更。
pub struct FfmpegLauncher {
    binary: String,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ProcessLauncher for FfmpegLauncher {
    async fn launch(
        &self,
        source: &Path,
        dest_url: &str,
        loop_enabled: bool,
    ) -> Result<ProcessHandle, AppError> {
        // 1. 校验源文件存在
        if !source.exists() {
            return Err(AppError::SourceNotFound(
                source.to_string_lossy().into_owned(),
            ));
        }

        // 2. 检查系统内存是否足够
        match sys_info::mem_info() {
            Ok(mem) => {
                // 可用内存小于 5MB 时拒绝启动
                if mem.avail < 5120 {
                    return Err(AppError::LaunchFailure(format!(
                        "insufficient system memory ({} KB available)",
                        mem.avail
                    )));
                }
            }
            Err(e) => {
                // 无法获取内存信息时仅记录警告，不阻断流程
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 3. 构建 FFmpeg 命令: 按原始帧率读取并透传复制到 RTMP
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-nostdin").arg("-re");
        if loop_enabled {
            cmd.arg("-stream_loop").arg("-1");
        }
        cmd.arg("-i").arg(source);
        cmd.arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("copy")
            .arg("-f")
            .arg("flv")
            .arg(dest_url);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn FFmpeg process: {}", e);
            AppError::LaunchFailure(e.to_string())
        })?;

        // 4. 持续消费 stderr，仅记录疑似故障的行
        if let Some(stderr) = child.stderr.take() {
            let dest = dest_url.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let lower = line.to_lowercase();
                    if ["error", "failed", "disconnect", "broken"]
                        .iter()
                        .any(|kw| lower.contains(kw))
                    {
                        warn!("FFmpeg [{}]: {}", dest, line);
                    }
                }
            });
        }

        Ok(ProcessHandle::monitor(child))
    }
}
