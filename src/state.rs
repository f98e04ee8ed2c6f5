use crate::config::AppConfig;
use crate::launcher::ProcessLauncher;
use crate::registry::SessionRegistry;
use crate::scheduler::TerminationScheduler;
use crate::store::StreamStore;
use std::sync::Arc;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    /// 活跃会话注册表 (唯一共享可变结构)
    pub registry: SessionRegistry,
    /// 自动停播定时器
    pub scheduler: TerminationScheduler,
    /// 持久化桥 (容器表 + 历史表)
    pub store: StreamStore,
    /// 推流进程启动器
    pub launcher: Arc<dyn ProcessLauncher>,
}

pub type SharedState = Arc<AppState>;
