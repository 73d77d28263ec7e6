//! DICOM Veil 网关主程序
//!
//! 装配并启动三个长驻服务：影像接收、完成监视器、Web服务。

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use veil_core::config::VeilConfig;
use veil_core::{EventBus, VeilError};
use veil_dicom::StoreServer;
use veil_pipeline::{CompletionMonitor, PipelineEngine, SeriesFilter, StudyFinalizer, StudyRegistry};
use veil_storage::{BlobStore, RemoteUploader, StudyArchiver};
use veil_web::{AppContext, WebServer};

/// 网关命令行参数
#[derive(Parser, Debug)]
#[command(name = "veil-server")]
#[command(about = "DICOM研究装配与匿名化网关")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别（覆盖配置文件）
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = VeilConfig::load(args.config.as_deref())?;

    // 初始化日志，命令行 > 环境变量 > 配置文件
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    info!("启动DICOM Veil网关...");
    info!("  接收端: {}:{} (AE={})", config.dicom.host, config.dicom.port, config.dicom.ae_title);
    info!("  Web服务: {}:{}", config.web.host, config.web.port);
    info!("  完成超时: {}秒", config.study.completion_timeout_secs);
    info!("  匿名化规则集: {}", config.anonymization.profile);
    info!("  归档目录: {}", config.storage.base_path);

    // 共享组件
    let store = Arc::new(BlobStore::open(&config.storage.base_path).await?);
    let events = Arc::new(EventBus::default());
    let registry = Arc::new(StudyRegistry::new(SeriesFilter::new(&config.series_filter)));
    let uploader = RemoteUploader::from_config(&config.remote).map(Arc::new);
    if uploader.is_none() {
        info!("未配置远端存储，上传已禁用");
    }

    let engine = Arc::new(PipelineEngine::new(
        Arc::clone(&registry),
        StudyArchiver::new(Arc::clone(&store)),
        uploader,
        Arc::clone(&events),
        &config,
    ));

    // 完成监视器
    let monitor = Arc::new(CompletionMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&engine) as Arc<dyn StudyFinalizer>,
        &config.study,
    ));
    tokio::spawn(Arc::clone(&monitor).run());

    // 影像接收服务
    let store_server = StoreServer::new(config.dicom.clone(), engine);
    tokio::spawn(async move {
        if let Err(e) = store_server.run().await {
            error!("影像接收服务退出: {}", e);
        }
    });

    // Web服务
    let web_addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port)
        .parse()
        .map_err(|e| VeilError::Config(format!("Web监听地址无效: {}", e)))?;
    let web_server = WebServer::new(
        web_addr,
        AppContext {
            registry,
            store,
            events,
        },
    );
    tokio::spawn(async move {
        if let Err(e) = web_server.run().await {
            error!("Web服务退出: {}", e);
        }
    });

    info!("网关已就绪，Ctrl+C退出");
    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，网关关闭");
    Ok(())
}
