mod config;
mod error;
mod launcher;
mod monitor;
mod registry;
mod scheduler;
mod state;
mod store;
mod supervisor;
mod web;

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use launcher::FfmpegLauncher;
use registry::SessionRegistry;
use scheduler::TerminationScheduler;
use state::AppState;
use std::sync::Arc;
use store::StreamStore;
use supervisor::Supervisor;
use tracing::{info, warn};

/// FlowCast - RTMP Restream Console
/// 解析命令行参数，初始化服务，加载配置文件，并启动HTTP服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "flowcast.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，设置格式
    tracing_subscriber::fmt::init();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!(
        "FlowCast initialized. Media root: {}",
        config.server.media_root
    );

    // 连接数据库并建表
    let store = StreamStore::connect(&config.server.database_url).await?;

    // 开机对账：进程重启后不可能有存活的推流，
    // 把所有仍标记为 streaming 的持久化记录翻转为 stopped
    let stale = store.reconcile_stale().await?;
    if stale > 0 {
        warn!(
            "Reconciled {} stale streaming record(s) left over from a previous run",
            stale
        );
    }

    // 初始化全局状态
    let state = Arc::new(AppState {
        registry: SessionRegistry::new(),
        scheduler: TerminationScheduler::new(),
        store,
        launcher: Arc::new(FfmpegLauncher::new(&config.server.ffmpeg_binary)),
        config: config.clone(),
    });

    // 注册HTTP路由
    let app = Router::new()
        .route("/", get(web::api::index_handler)) // 控制台页面
        .route("/sys/status", get(web::api::sys_status)) // 系统状态
        .route("/api/streams/start", post(web::api::handle_start)) // 启动推流
        .route("/api/streams/stop", post(web::api::handle_stop)) // 停止推流
        .route("/api/streams/active", get(web::api::active_sessions)) // 活跃会话
        .route(
            "/api/streams/:stream_key/status",
            get(web::api::stream_status), // 状态 SSE
        )
        .route("/api/history", get(web::api::history)) // 推流历史
        .route("/api/history/:id", delete(web::api::delete_history)) // 删除历史
        .route("/media/:file_name", get(web::media::serve_media_file)) // 素材文件
        .with_state(state.clone());

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 退出前兜底终止所有存活会话
    Supervisor::teardown(&state).await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
