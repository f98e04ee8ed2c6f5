use crate::launcher::ProcessHandle;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// 会话状态机
///
/// `Stopped` / `Failed` 为终态；终态迁移在整个生命周期内恰好发生一次，
/// 由注册表移除操作作为唯一的线性化点保证。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    StoppingRequested,
    Stopped,
    Failed,
}

/// 一次在途推流会话
///
/// 插入时处于 `Starting` 且尚无进程句柄 (预占位)；
/// 进程拉起成功后经由 `set_running` 补齐句柄并进入 `Running`。
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub key: String,
    pub title: String,
    pub video_path: String,
    pub destination_url: String,
    pub handle: Option<ProcessHandle>,
    pub started_at: DateTime<Utc>,
    pub duration_minutes: u64,
    pub state: SessionState,
}

/// 活跃会话注册表
///
/// 整个核心唯一的共享可变结构。所有读写都经过同一把锁，
/// 锁内不做任何 await，其他组件一律读取快照而非缓存会话状态。
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 原子比较并插入：该 key 已有会话时返回 false，调用方须以
    /// `DuplicateStreamKey` 拒绝本次启动
    pub fn try_insert(&self, session: ActiveSession) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session.key) {
            return false;
        }
        sessions.insert(session.key.clone(), session);
        true
    }

    /// 进程拉起成功，补齐句柄并迁移到 `Running`
    ///
    /// 返回 false 表示预占位已被并发停止移除；此时调用方持有的进程
    /// 句柄是它的最后一个引用，必须立即终止回收
    pub fn set_running(&self, key: &str, handle: ProcessHandle) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(key) {
            Some(session) => {
                session.handle = Some(handle);
                session.state = SessionState::Running;
                true
            }
            None => false,
        }
    }

    /// 读取会话快照 (克隆，不持锁外泄)
    pub fn get(&self, key: &str) -> Option<ActiveSession> {
        self.sessions.lock().unwrap().get(key).cloned()
    }

    /// 移除会话并交还其记录；返回 None 表示该 key 已处于终态
    pub fn remove(&self, key: &str) -> Option<ActiveSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut session = sessions.remove(key)?;
        session.state = SessionState::StoppingRequested;
        Some(session)
    }

    /// 全量快照，用于回答"当前活跃会话"查询
    pub fn list(&self) -> Vec<ActiveSession> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// 清空注册表并交还全部会话 (进程退出前的兜底终止)
    pub fn drain(&self) -> Vec<ActiveSession> {
        self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(key: &str) -> ActiveSession {
        ActiveSession {
            key: key.to_string(),
            title: "Test".to_string(),
            video_path: "demo.mp4".to_string(),
            destination_url: format!("rtmp://localhost/live/{}", key),
            handle: None,
            started_at: Utc::now(),
            duration_minutes: 10,
            state: SessionState::Starting,
        }
    }

    #[test]
    fn try_insert_rejects_occupied_key() {
        let registry = SessionRegistry::new();
        assert!(registry.try_insert(session("abc")));
        assert!(!registry.try_insert(session("abc")));
        assert!(registry.try_insert(session("def")));
    }

    #[test]
    fn remove_frees_key_for_reuse() {
        let registry = SessionRegistry::new();
        assert!(registry.try_insert(session("abc")));

        let removed = registry.remove("abc").unwrap();
        assert_eq!(removed.state, SessionState::StoppingRequested);
        assert!(registry.remove("abc").is_none());
        assert!(registry.try_insert(session("abc")));
    }

    #[tokio::test]
    async fn set_running_attaches_handle() {
        let registry = SessionRegistry::new();
        assert!(registry.try_insert(session("abc")));
        assert_eq!(registry.get("abc").unwrap().state, SessionState::Starting);
        assert!(registry.get("abc").unwrap().handle.is_none());

        let (handle, _exit_tx) = crate::launcher::ProcessHandle::scripted();
        assert!(registry.set_running("abc", handle));

        let snapshot = registry.get("abc").unwrap();
        assert_eq!(snapshot.state, SessionState::Running);
        assert!(snapshot.handle.unwrap().is_alive());
    }

    #[tokio::test]
    async fn set_running_on_removed_key_reports_failure() {
        let registry = SessionRegistry::new();
        assert!(registry.try_insert(session("abc")));
        registry.remove("abc");

        let (handle, _exit_tx) = crate::launcher::ProcessHandle::scripted();
        assert!(!registry.set_running("abc", handle));
        assert!(registry.get("abc").is_none());
    }

    #[tokio::test]
    async fn concurrent_insert_admits_exactly_one() {
        let registry = Arc::new(SessionRegistry::new());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.try_insert(session("abc"))
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.list().len(), 1);
    }
}
