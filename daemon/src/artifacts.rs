use common::JobRequest;
use std::path::{Path, PathBuf};

pub const INTERMEDIATE_EXT: &str = "mkv";
pub const FINAL_EXT: &str = "mp4";

/// The two files a job may create. Both are deleted when this is dropped.
#[derive(Debug)]
pub struct JobArtifacts {
    pub base_name: String,
    pub intermediate: PathBuf,
    pub final_path: PathBuf,
}

impl JobArtifacts {
    /// Files live under `root/<requester>/` so equal windows of two requesters never clash.
    pub fn new(root: &Path, request: &JobRequest) -> Self {
        let base_name = request.base_name();
        let dir = root.join(request.requester.file_safe());
        Self {
            intermediate: dir.join(format!("{}_temp.{}", base_name, INTERMEDIATE_EXT)),
            final_path: dir.join(format!("{}.{}", base_name, FINAL_EXT)),
            base_name,
        }
    }

    pub fn final_name(&self) -> String {
        format!("{}.{}", self.base_name, FINAL_EXT)
    }

    pub fn remove_all(&self) {
        remove_file_quietly(&self.intermediate);
        remove_file_quietly(&self.final_path);
    }
}

impl Drop for JobArtifacts {
    fn drop(&mut self) {
        self.remove_all();
    }
}

pub fn remove_file_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed {:?}", path);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            log::warn!("Failed to remove {:?}: {}", path, e);
            false
        }
    }
}

pub fn size_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Tells a real recording apart from an empty or stub file.
#[derive(Debug, Clone, Copy)]
pub struct OutputValidator {
    min_bytes: u64,
}

impl OutputValidator {
    pub fn new(min_bytes: u64) -> Self {
        Self { min_bytes }
    }

    pub async fn validate(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() >= self.min_bytes => true,
            Ok(meta) => {
                log::warn!(
                    "{:?} too small ({} bytes, need {})",
                    path,
                    meta.len(),
                    self.min_bytes
                );
                false
            }
            Err(e) => {
                log::warn!("No output at {:?}: {}", path, e);
                false
            }
        }
    }
}
