mod channel;
mod config;
mod coordinator;
mod engine;
mod error;
mod output;
mod proxy;
mod scheduler;
mod state;
mod stats;
mod store;
mod supervisor;
mod web;

use anyhow::Context;
use clap::Parser;
use config::AppConfig;
use coordinator::Coordinator;
use engine::CommandLauncher;
use proxy::{HttpProbe, ProxyManager};
use state::AppState;
use std::sync::Arc;
use store::{ConfigStore, JsonFileStore, MemoryStore};
use supervisor::StreamSupervisor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Relay Gate - 代理感知的推流进程守护
/// 解析命令行参数，加载配置，启动代理健康检查、worker 守护及 HTTP 控制面
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "relay-gate.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!(
        "Relay Gate initialized with {} channel(s), restart policy {:?}",
        config.channels.len(),
        config.proxy.restart_policy
    );

    // 配置存储：未指定路径时仅保存在内存中
    let store: Arc<dyn ConfigStore> = match &config.server.store_path {
        Some(path) => Arc::new(
            JsonFileStore::open(path).with_context(|| format!("opening store {}", path))?,
        ),
        None => {
            warn!("No store_path configured, runtime changes will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let probe = Arc::new(HttpProbe::new(config.proxy.probe_timeout()));
    let proxy = Arc::new(
        ProxyManager::new(config.proxy.clone(), probe, store.clone())
            .context("restoring proxy configuration")?,
    );
    let supervisor = StreamSupervisor::new(
        config.server.clone(),
        config.supervisor.clone(),
        proxy.clone(),
        Arc::new(CommandLauncher),
        store,
        config.channels.clone(),
    )
    .context("restoring channel catalog")?;

    // 后台任务：健康检查与出口变更协调
    let cancel = CancellationToken::new();
    let coordinator = Arc::new(Coordinator::new(
        proxy.clone(),
        supervisor.clone(),
        config.proxy.restart_policy,
    ));
    let coordinator_task = tokio::spawn(coordinator.run(proxy.subscribe(), cancel.clone()));
    let health_task = tokio::spawn(proxy.clone().run_health_loop(cancel.clone()));

    let mut alerts = supervisor.subscribe_alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            error!("ALERT [{}]: {}", alert.channel_id, alert.message);
        }
    });

    supervisor.start_auto_channels().await;

    let state = Arc::new(AppState {
        proxy,
        supervisor: supervisor.clone(),
        started_at: std::time::Instant::now(),
    });
    let app = web::router(state);

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    cancel.cancel();
    let _ = tokio::join!(coordinator_task, health_task);
    supervisor.shutdown().await;
    info!("Bye");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
