use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use crate::artifacts::{remove_file_quietly, OutputValidator};
use crate::config::{EngineConfig, RecordingConfig};
use crate::error::{Failure, Outcome};

/// Stream-copy remux into a seek-optimised mp4.
pub fn remux_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

pub struct ConversionStage {
    program: PathBuf,
    timeout: Duration,
    validator: OutputValidator,
}

impl ConversionStage {
    pub fn new(engine: &EngineConfig, recording: &RecordingConfig) -> Self {
        Self {
            program: engine.program.clone(),
            timeout: recording.conversion_timeout(),
            validator: OutputValidator::new(recording.min_output_bytes),
        }
    }

    /// Remux `intermediate` into `output`. On success the intermediate is deleted.
    pub async fn convert(
        &self,
        intermediate: &Path,
        output: &Path,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Outcome {
        log::info!("[{}] Converting to mp4...", tag);

        let mut cmd = Command::new(&self.program);
        cmd.args(remux_args(intermediate, output));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("[{}] Failed to spawn converter: {}", tag, e);
                return Outcome::Failed(Failure::Conversion(e.to_string()));
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("[{}] Cancelled during conversion", tag);
                let _ = child.kill().await;
                remove_file_quietly(output);
                remove_file_quietly(intermediate);
                return Outcome::Cancelled;
            }
            status = child.wait() => match status {
                Ok(status) if !status.success() => log::warn!("[{}] Converter exited with {}", tag, status),
                Ok(_) => {}
                Err(e) => log::error!("[{}] Failed to wait for converter: {}", tag, e),
            },
            _ = tokio::time::sleep(self.timeout) => {
                log::error!("[{}] Conversion timeout after {}s", tag, self.timeout.as_secs());
                let _ = child.kill().await;
                remove_file_quietly(output);
                return Outcome::Failed(Failure::ConversionTimeout);
            }
        }

        if !self.validator.validate(output).await {
            log::error!("[{}] Converted file missing or too small", tag);
            remove_file_quietly(output);
            return Outcome::Failed(Failure::Conversion("output missing or too small".to_string()));
        }

        if let Ok(meta) = tokio::fs::metadata(output).await {
            log::info!("[{}] Success! Final: {:.1}MB", tag, crate::artifacts::size_mb(meta.len()));
        }
        remove_file_quietly(intermediate);
        Outcome::Completed(output.to_path_buf())
    }
}
