use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".mp3", ".wav", ".m4a", ".flac", ".ogg", ".webm", ".mp4", ".mpeg", ".mpga", ".oga", ".opus",
];

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("filename is required")]
    MissingFilename,

    #[error("unsupported file format '{0}'")]
    UnsupportedFormat(String),

    #[error("file too large, maximum size is {limit_mb}MB")]
    TooLarge { limit_mb: u64 },

    #[error("failed to download audio: {0}")]
    Download(String),

    #[error("failed to store audio: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns the lowercased extension (with the dot) if the format is accepted.
pub fn check_extension(filename: &str) -> Result<String, ArtifactError> {
    if filename.trim().is_empty() {
        return Err(ArtifactError::MissingFilename);
    }
    let ext = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();

    if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(ArtifactError::UnsupportedFormat(ext))
    }
}

/// Removes a stored audio file. Missing files are not an error, so this can
/// run from every cleanup path.
pub async fn release(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => info!("Removed audio file: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove audio file {}: {}", path.display(), e),
    }
}

/// Where submitted audio lives until its task is done with it.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    max_file_size_mb: u64,
}

impl ArtifactStore {
    pub fn new(upload_dir: impl Into<PathBuf>, max_file_size_mb: u64) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            max_file_size_mb,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Opens `<upload_dir>/<uuid><ext>` for a client file named `filename`.
    pub async fn create(&self, filename: &str) -> Result<ArtifactWriter, ArtifactError> {
        let ext = check_extension(filename)?;
        fs::create_dir_all(&self.upload_dir).await?;

        let path = self.upload_dir.join(format!("{}{}", Uuid::new_v4(), ext));
        let file = fs::File::create(&path).await?;
        Ok(ArtifactWriter {
            path,
            file,
            written: 0,
            limit: self.max_file_size(),
            limit_mb: self.max_file_size_mb,
        })
    }

    /// Fetches `url` into the upload directory, enforcing the same format and
    /// size rules as uploads.
    pub async fn download(&self, url: &str) -> Result<PathBuf, ArtifactError> {
        info!("Starting download from URL: {}", url);

        let parsed = reqwest::Url::parse(url).map_err(|e| ArtifactError::Download(format!("invalid URL: {}", e)))?;
        let filename = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        let mut writer = self.create(&filename).await?;

        let mut response = match reqwest::get(parsed).await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                writer.abort().await;
                return Err(ArtifactError::Download(format!(
                    "HTTP request failed with status: {}",
                    response.status()
                )));
            }
            Err(e) => {
                writer.abort().await;
                return Err(ArtifactError::Download(e.to_string()));
            }
        };

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    writer.abort().await;
                    return Err(ArtifactError::Download(e.to_string()));
                }
            };
            if let Err(e) = writer.write_chunk(&chunk).await {
                writer.abort().await;
                return Err(e);
            }
        }

        let path = writer.finish().await?;
        info!("Download completed: {}", path.display());
        Ok(path)
    }
}

/// Streams one artifact to disk with a size ceiling. Call [`abort`](Self::abort)
/// on any error to remove the partial file.
pub struct ArtifactWriter {
    path: PathBuf,
    file: fs::File,
    written: u64,
    limit: u64,
    limit_mb: u64,
}

impl ArtifactWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ArtifactError> {
        self.written += chunk.len() as u64;
        if self.written > self.limit {
            return Err(ArtifactError::TooLarge { limit_mb: self.limit_mb });
        }
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<PathBuf, ArtifactError> {
        if let Err(e) = self.file.flush().await {
            self.abort().await;
            return Err(e.into());
        }
        Ok(self.path)
    }

    pub async fn abort(self) {
        drop(self.file);
        release(&self.path).await;
    }
}
