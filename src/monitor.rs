use crate::state::SharedState;
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// 推送给观察者的一次状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub is_streaming: bool,
    pub auto_stopped: bool,
}

/// 观察指定 key 的存活状态，返回惰性事件序列
///
/// 每个 tick 只读取注册表的一次快照，存活探测在锁外完成；
/// 会话消失后补发一条 `auto_stopped` 终结事件，此后序列结束，
/// 绝不在终结之后继续产出。
///
/// 序列是纯拉取式的，没有为观察者派生任何后台任务：
/// 客户端断开即丢弃序列，对应的定时器随之释放。
pub fn watch(
    state: SharedState,
    key: String,
    every: Duration,
) -> impl Stream<Item = StatusEvent> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold(
        (state, key, interval, false),
        |(state, key, mut interval, done)| async move {
            if done {
                return None;
            }
            interval.tick().await;

            // 预占位 (Starting, 尚无句柄) 视为存活
            let alive = state
                .registry
                .get(&key)
                .map(|s| s.handle.map(|h| h.is_alive()).unwrap_or(true))
                .unwrap_or(false);

            let event = StatusEvent {
                is_streaming: alive,
                auto_stopped: !alive,
            };
            Some((event, (state, key, interval, !alive)))
        },
    )
}
