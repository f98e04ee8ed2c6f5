use crate::error::AppError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 允许的计划时长下限 (分钟)
pub const MIN_DURATION_MINUTES: u64 = 1;
/// 允许的计划时长上限 (分钟，24 小时)
pub const MAX_DURATION_MINUTES: u64 = 1440;

/// 自动停播调度器
///
/// 每个会话一支一次性定时器，按 key 引用而非持有会话句柄，
/// 避免会话先行移除后出现悬空定时器。
///
/// `cancel` 与定时器触发天然存在竞争：取消可能到达在触发已经
/// 派发之后。调度器不试图让两者原子化，而是依赖终态停止路径
/// 的幂等性吸收这次竞争。
pub struct TerminationScheduler {
    timers: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TerminationScheduler {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 启动一支一次性定时器；到期后在调度器自有的任务上下文中
    /// 恰好执行一次 `on_fire`，绝不重入调用方的调用栈
    pub fn arm<F>(&self, key: &str, minutes: u64, on_fire: F) -> Result<(), AppError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&minutes) {
            return Err(AppError::InvalidDuration(minutes));
        }

        let token = CancellationToken::new();
        if let Some(old) = self
            .timers
            .lock()
            .unwrap()
            .insert(key.to_string(), token.clone())
        {
            // 同 key 不应存在旧定时器；保险起见先取消
            old.cancel();
        }

        let timers = self.timers.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
            }
            // 先解除登记再派发：此后到达的 cancel 对本次触发无效
            timers.lock().unwrap().remove(&key);
            debug!("Scheduled termination fired for [{}]", key);
            on_fire.await;
        });

        Ok(())
    }

    /// 撤销尚未触发的定时器；对已触发或正在触发的定时器无效果
    pub fn cancel(&self, key: &str) {
        if let Some(token) = self.timers.lock().unwrap().remove(key) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn fired_probe() -> (mpsc::UnboundedSender<()>, mpsc::UnboundedReceiver<()>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let scheduler = TerminationScheduler::new();
        let (tx, mut rx) = fired_probe();

        scheduler
            .arm("abc", 1, async move {
                tx.send(()).unwrap();
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());

        // 触发后的取消是空操作
        scheduler.cancel("abc");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let scheduler = TerminationScheduler::new();
        let (tx, mut rx) = fired_probe();

        scheduler
            .arm("abc", 1, async move {
                tx.send(()).unwrap();
            })
            .unwrap();
        scheduler.cancel("abc");

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_bounds_are_enforced() {
        let scheduler = TerminationScheduler::new();

        assert!(matches!(
            scheduler.arm("a", 0, async {}),
            Err(AppError::InvalidDuration(0))
        ));
        assert!(matches!(
            scheduler.arm("b", 1441, async {}),
            Err(AppError::InvalidDuration(1441))
        ));
        assert!(scheduler.arm("c", 1, async {}).is_ok());
        assert!(scheduler.arm("d", 1440, async {}).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn independent_keys_do_not_interfere() {
        let scheduler = TerminationScheduler::new();
        let (tx_a, mut rx_a) = fired_probe();
        let (tx_b, mut rx_b) = fired_probe();

        scheduler
            .arm("a", 1, async move {
                tx_a.send(()).unwrap();
            })
            .unwrap();
        scheduler
            .arm("b", 2, async move {
                tx_b.send(()).unwrap();
            })
            .unwrap();
        scheduler.cancel("a");

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(rx_a.try_recv().is_err());
        rx_b.recv().await.unwrap();
    }
}
