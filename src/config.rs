use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// FFmpeg 可执行文件路径
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,

    /// SQLite 数据库连接串
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// 视频素材根目录
    /// 所有推流源文件按相对路径从这里解析
    #[serde(default = "default_media_root")]
    pub media_root: String,

    /// 状态监视器的探测间隔 (毫秒)
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

impl ServerConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_database_url() -> String {
    "sqlite://flowcast.db".to_string()
}

fn default_media_root() -> String {
    "./media".to_string()
}

fn default_status_interval_ms() -> u64 {
    5000
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
