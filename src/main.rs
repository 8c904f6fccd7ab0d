#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use tracing::{info, error};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use asr_jobs::{
    asr::{command::CommandAsr, AsrEngine},
    config::{self, EngineKind, Settings},
    schedule::{create_scheduler, TranscribeProcessor},
    storage::{artifact::ArtifactStore, task::InMemoryTaskStorage},
    utils::logger,
    AppContext, SETTINGS,
};

fn build_engine(settings: &Settings) -> Result<Arc<dyn AsrEngine>> {
    match settings.engine {
        EngineKind::WhisperX => {
            info!("Using whisperx command: {}", settings.whisperx_cmd);
            Ok(Arc::new(CommandAsr::new(settings.command_config())))
        }
        #[cfg(feature = "whisper")]
        EngineKind::Whisper => {
            info!("Initializing Whisper ASR model: {}", settings.model_path);
            let asr = asr_jobs::asr::whisper::WhisperAsr::new(settings.model_path.clone())?;
            Ok(Arc::new(asr))
        }
        #[cfg(not(feature = "whisper"))]
        EngineKind::Whisper => Err(anyhow::anyhow!(
            "ASR_ENGINE=whisper requires building with the `whisper` feature"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    // 初始化日志系统
    let _guard = logger::init(config::log_dir())?;
    asr_jobs::init_env()?;
    let settings = &*SETTINGS;

    info!("Starting ASR service...");

    // 初始化 ASR 引擎
    let engine = build_engine(settings)?;
    let processor = Arc::new(TranscribeProcessor::new(engine));

    // 初始化任务管理器与调度器
    info!("Initializing Task Manager...");
    let storage = Arc::new(InMemoryTaskStorage::new());
    let (task_manager, scheduler) = create_scheduler(storage, processor, settings.scheduler_config());

    // 创建应用上下文
    let ctx = Arc::new(AppContext {
        task_manager,
        artifacts: ArtifactStore::new(settings.upload_dir.clone(), settings.max_file_size_mb),
    });

    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move {
            if let Err(e) = scheduler.run().await {
                error!("Scheduler error: {}", e);
            }
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    // 启动 HTTP 服务器
    let addr = settings.addr();
    info!("Starting HTTP server at http://{}", addr);
    let served = asr_jobs::web::start_server(ctx.clone(), addr, shutdown).await;

    // 优雅关闭
    info!("Shutting down...");
    scheduler.shutdown();
    let _ = scheduler_handle.await;

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e)
        }
    }
}
