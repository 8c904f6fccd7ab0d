pub mod asr;
pub mod audio;
pub mod config;
pub mod schedule;
pub mod storage;
pub mod utils;
pub mod web;

use std::sync::Arc;
use config::Settings;
use schedule::TaskManager;
use storage::artifact::ArtifactStore;
use once_cell::sync::Lazy;

pub struct AppContext {
    pub task_manager: Arc<TaskManager>,
    pub artifacts: ArtifactStore,
}

pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

pub fn init_env() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 确保数据目录存在
    std::fs::create_dir_all(&SETTINGS.upload_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create upload directory {}: {}", SETTINGS.upload_dir.display(), e))?;
    Ok(())
}
