use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use common::{Action, Message, MessageRef, RequesterId};
use dashmap::DashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outbound chat operations the core relies on.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, to: &RequesterId, text: &str) -> Result<MessageRef>;
    async fn edit(&self, to: &RequesterId, msg: MessageRef, text: &str, actions: &[Action]) -> Result<()>;
    async fn delete(&self, to: &RequesterId, msg: MessageRef) -> Result<()>;
    async fn send_file(&self, to: &RequesterId, path: &Path, caption: &str) -> Result<()>;
}

// Best-effort wrappers: a failed notification must never abort a job.

pub async fn notify(messenger: &dyn Messenger, to: &RequesterId, text: &str) -> Option<MessageRef> {
    match messenger.send(to, text).await {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::error!("Failed to notify {}: {:#}", to, e);
            None
        }
    }
}

pub async fn edit_or_send(
    messenger: &dyn Messenger,
    to: &RequesterId,
    msg: Option<MessageRef>,
    text: &str,
    actions: &[Action],
) -> Option<MessageRef> {
    if let Some(msg) = msg {
        match messenger.edit(to, msg, text, actions).await {
            Ok(()) => return Some(msg),
            Err(e) => log::warn!("Failed to edit {} for {}: {:#}", msg, to, e),
        }
    }
    let msg = notify(messenger, to, text).await?;
    if !actions.is_empty() {
        if let Err(e) = messenger.edit(to, msg, text, actions).await {
            log::warn!("Failed to attach actions for {}: {:#}", to, e);
        }
    }
    Some(msg)
}

pub async fn retract(messenger: &dyn Messenger, to: &RequesterId, msg: Option<MessageRef>) {
    if let Some(msg) = msg {
        if let Err(e) = messenger.delete(to, msg).await {
            log::warn!("Failed to delete {} for {}: {:#}", msg, to, e);
        }
    }
}

const HISTORY_LIMIT: usize = 50;

/// In-daemon chat store the CLI reads from. Files are "uploaded" by copying
/// them into the delivery directory.
pub struct Mailbox {
    next_id: AtomicU64,
    boxes: DashMap<RequesterId, Vec<Message>>,
    delivery_dir: PathBuf,
}

impl Mailbox {
    pub fn new(delivery_dir: PathBuf) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            boxes: DashMap::new(),
            delivery_dir,
        }
    }

    pub fn messages(&self, to: &RequesterId) -> Vec<Message> {
        self.boxes.get(to).map(|b| b.clone()).unwrap_or_default()
    }

    fn push(&self, to: &RequesterId, text: &str, attachment: Option<PathBuf>) -> MessageRef {
        let id = MessageRef(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = self.boxes.entry(to.clone()).or_default();
        entry.push(Message {
            id,
            text: text.to_string(),
            actions: Vec::new(),
            attachment,
            updated_at: Utc::now(),
        });
        let len = entry.len();
        if len > HISTORY_LIMIT {
            entry.drain(0..len - HISTORY_LIMIT);
        }
        id
    }
}

#[async_trait]
impl Messenger for Mailbox {
    async fn send(&self, to: &RequesterId, text: &str) -> Result<MessageRef> {
        Ok(self.push(to, text, None))
    }

    async fn edit(&self, to: &RequesterId, msg: MessageRef, text: &str, actions: &[Action]) -> Result<()> {
        let mut entry = self.boxes
            .get_mut(to)
            .ok_or_else(|| anyhow!("No messages for {}", to))?;
        let message = entry
            .iter_mut()
            .find(|m| m.id == msg)
            .ok_or_else(|| anyhow!("Message {} not found", msg))?;
        message.text = text.to_string();
        message.actions = actions.to_vec();
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, to: &RequesterId, msg: MessageRef) -> Result<()> {
        if let Some(mut entry) = self.boxes.get_mut(to) {
            entry.retain(|m| m.id != msg);
        }
        Ok(())
    }

    async fn send_file(&self, to: &RequesterId, path: &Path, caption: &str) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("Not a file: {:?}", path))?;
        let requester_dir = self.delivery_dir.join(to.file_safe());
        tokio::fs::create_dir_all(&requester_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", requester_dir))?;
        let target = requester_dir.join(name);
        tokio::fs::copy(path, &target)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", path, target))?;
        self.push(to, caption, Some(target));
        Ok(())
    }
}

/// Forwards to an inner messenger and mirrors what is sent to a webhook.
///
/// Posts run in their own task so a slow endpoint never holds up the caller.
pub struct WebhookMirror {
    inner: Arc<dyn Messenger>,
    url: String,
    client: reqwest::Client,
}

impl WebhookMirror {
    pub fn new(inner: Arc<dyn Messenger>, url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self { inner, url, client })
    }

    fn post(&self, to: &RequesterId, event: &str, text: &str, file: Option<&Path>) {
        let payload = webhook_payload(to, event, text, file);
        let request = self.client.post(&self.url).json(&payload);
        let to = to.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    log::debug!("Webhook notified for {} ({})", to, event);
                }
                Ok(response) => log::error!("Webhook failed with status: {}", response.status()),
                Err(e) => log::error!("Webhook request failed: {}", e),
            }
        });
    }
}

pub fn webhook_payload(to: &RequesterId, event: &str, text: &str, file: Option<&Path>) -> serde_json::Value {
    serde_json::json!({
        "requester": to.0,
        "event": event,
        "text": text,
        "file": file.map(|f| f.to_string_lossy().into_owned()),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl Messenger for WebhookMirror {
    async fn send(&self, to: &RequesterId, text: &str) -> Result<MessageRef> {
        let msg = self.inner.send(to, text).await?;
        self.post(to, "message", text, None);
        Ok(msg)
    }

    async fn edit(&self, to: &RequesterId, msg: MessageRef, text: &str, actions: &[Action]) -> Result<()> {
        self.inner.edit(to, msg, text, actions).await
    }

    async fn delete(&self, to: &RequesterId, msg: MessageRef) -> Result<()> {
        self.inner.delete(to, msg).await
    }

    async fn send_file(&self, to: &RequesterId, path: &Path, caption: &str) -> Result<()> {
        self.inner.send_file(to, path, caption).await?;
        self.post(to, "file", caption, Some(path));
        Ok(())
    }
}

/// Puts an upper bound on every call of an inner messenger.
pub struct TimeoutMessenger {
    inner: Arc<dyn Messenger>,
    message_timeout: Duration,
    upload_timeout: Duration,
}

impl TimeoutMessenger {
    pub fn new(inner: Arc<dyn Messenger>, message_timeout: Duration, upload_timeout: Duration) -> Self {
        Self {
            inner,
            message_timeout,
            upload_timeout,
        }
    }
}

async fn bounded<T>(limit: Duration, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {}s", what, limit.as_secs_f32())),
    }
}

#[async_trait]
impl Messenger for TimeoutMessenger {
    async fn send(&self, to: &RequesterId, text: &str) -> Result<MessageRef> {
        bounded(self.message_timeout, "send", self.inner.send(to, text)).await
    }

    async fn edit(&self, to: &RequesterId, msg: MessageRef, text: &str, actions: &[Action]) -> Result<()> {
        bounded(self.message_timeout, "edit", self.inner.edit(to, msg, text, actions)).await
    }

    async fn delete(&self, to: &RequesterId, msg: MessageRef) -> Result<()> {
        bounded(self.message_timeout, "delete", self.inner.delete(to, msg)).await
    }

    async fn send_file(&self, to: &RequesterId, path: &Path, caption: &str) -> Result<()> {
        bounded(self.upload_timeout, "upload", self.inner.send_file(to, path, caption)).await
    }
}
