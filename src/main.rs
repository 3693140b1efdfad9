mod config;
mod notify;
mod scheduler;
mod state;
mod upstream;
mod web;

use clap::Parser;
use config::AppConfig;
use notify::WebhookNotifier;
use scheduler::{RotationScheduler, SchedulerSettings};
use state::{AppState, StateStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upstream::UpstreamClient;

/// Cam Rotator - 摄像头轮播切换服务
/// 按计划在上游切换台的摄像头之间轮播，提供远程控制接口，并在重启后恢复配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "cam-rotator.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 加载配置文件；上游地址不可用时直接退出
    let config = AppConfig::load(&args.config)?;
    info!(
        "Cam Rotator initialized. Upstream: {}, state file: {}",
        config.upstream.base_url, config.server.state_file
    );

    // 加载持久化状态
    let store = Arc::new(StateStore::load(&config.server.state_file)?);
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);

    let mut scheduler = RotationScheduler::new(
        store.clone(),
        upstream.clone(),
        upstream.clone(),
        SchedulerSettings::from(&config),
    );
    if let Some(notify_cfg) = &config.notify {
        let timeout = Duration::from_millis(config.upstream.timeout_ms);
        scheduler = scheduler.with_notifier(Arc::new(WebhookNotifier::new(notify_cfg, timeout)?));
        info!("Downstream notify enabled: {}", notify_cfg.url);
    }

    let state = Arc::new(AppState {
        store,
        provider: upstream,
        scheduler: scheduler.status(),
        started_at: Instant::now(),
    });

    // 启动后台调度任务
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let app = web::router(state);

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    scheduler_task.await?;
    info!("Shutdown complete");

    Ok(())
}

/// 等待 Ctrl-C，随后取消调度器
async fn shutdown_signal(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        // 无法监听信号时保持运行，直到其它路径取消
        shutdown.cancelled().await;
        return;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
