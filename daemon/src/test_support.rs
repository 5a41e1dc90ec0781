use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::{local_now, Action, JobRequest, MessageRef, RequesterId, Window};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::config::Config;
use crate::messenger::Messenger;

/// Stand-in encoder. Network inputs produce 4 KiB of output, file inputs are copied.
pub const COPY_INPUT_SCRIPT: &str = r#"in=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then in="$a"; fi
  prev="$a"
  out="$a"
done
case "$in" in
  http*) head -c 4096 /dev/zero > "$out" ;;
  *) cp "$in" "$out" ;;
esac"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.server.socket_path = root.join("test.sock");
    config.recording.output_dir = root.join("recordings");
    config.recording.delivery_dir = root.join("delivered");
    config.recording.min_output_bytes = 1024;
    config.recording.safety_margin_secs = 5;
    config.recording.stop_grace_secs = 1;
    config.recording.conversion_timeout_secs = 10;
    config.notifications.webhook_timeout_secs = 1;
    config.notifications.message_timeout_secs = 1;
    config.notifications.upload_timeout_secs = 1;
    config
}

pub fn request_starting_in(requester: &RequesterId, start_in_secs: i64, duration_secs: i64) -> JobRequest {
    let start = local_now(None) + ChronoDuration::seconds(start_in_secs);
    let window = Window {
        start,
        end: start + ChronoDuration::seconds(duration_secs),
    };
    JobRequest::new(requester.clone(), "https://example.com/live.m3u8".to_string(), window)
}

/// Every regular file below `dir`, recursively. Missing directories count as empty.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(files_under(&path));
        } else {
            files.push(path);
        }
    }
    files
}

pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// Chat transport that is down: every call fails.
pub struct FailingMessenger;

#[async_trait]
impl Messenger for FailingMessenger {
    async fn send(&self, _to: &RequesterId, _text: &str) -> Result<MessageRef> {
        Err(anyhow!("transport down"))
    }

    async fn edit(&self, _to: &RequesterId, _msg: MessageRef, _text: &str, _actions: &[Action]) -> Result<()> {
        Err(anyhow!("transport down"))
    }

    async fn delete(&self, _to: &RequesterId, _msg: MessageRef) -> Result<()> {
        Err(anyhow!("transport down"))
    }

    async fn send_file(&self, _to: &RequesterId, _path: &Path, _caption: &str) -> Result<()> {
        Err(anyhow!("transport down"))
    }
}

/// Chat transport that never answers.
pub struct HangingMessenger;

#[async_trait]
impl Messenger for HangingMessenger {
    async fn send(&self, _to: &RequesterId, _text: &str) -> Result<MessageRef> {
        std::future::pending().await
    }

    async fn edit(&self, _to: &RequesterId, _msg: MessageRef, _text: &str, _actions: &[Action]) -> Result<()> {
        std::future::pending().await
    }

    async fn delete(&self, _to: &RequesterId, _msg: MessageRef) -> Result<()> {
        std::future::pending().await
    }

    async fn send_file(&self, _to: &RequesterId, _path: &Path, _caption: &str) -> Result<()> {
        std::future::pending().await
    }
}

/// Accepts TCP connections and never writes a byte back.
pub async fn silent_http_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}/hook", addr)
}
