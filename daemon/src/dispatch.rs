use chrono_tz::Tz;
use common::{local_now, Action, JobStatus, Message, MessageRef, Request, RequesterId, Response};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use crate::config::Config;
use crate::conversation::{ConversationSession, Prompt, Step};
use crate::error::ScheduleError;
use crate::messenger::{edit_or_send, notify, Mailbox, Messenger, TimeoutMessenger, WebhookMirror};
use crate::metrics::MetricsCollector;
use crate::recorder::Recorder;
use crate::registry::{CancelResult, Registry};
use crate::scheduler::JobScheduler;

/// Routes chat events to the conversation sessions and the scheduler.
pub struct Dispatcher {
    sessions: DashMap<RequesterId, ConversationSession>,
    scheduler: JobScheduler,
    mailbox: Arc<Mailbox>,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<MetricsCollector>,
    max_minutes: i64,
    timezone: Option<Tz>,
}

impl Dispatcher {
    pub fn from_config(config: &Config, timezone: Option<Tz>) -> anyhow::Result<Self> {
        let notifications = &config.notifications;
        let mailbox = Arc::new(Mailbox::new(config.recording.delivery_dir.clone()));
        let transport: Arc<dyn Messenger> = match &notifications.webhook_url {
            Some(url) => {
                log::info!("Mirroring notifications to {}", url);
                Arc::new(WebhookMirror::new(mailbox.clone(), url.clone(), notifications.webhook_timeout())?)
            }
            None => mailbox.clone(),
        };
        let messenger: Arc<dyn Messenger> = Arc::new(TimeoutMessenger::new(
            transport,
            notifications.message_timeout(),
            notifications.upload_timeout(),
        ));
        let metrics = Arc::new(MetricsCollector::new());
        let recorder = Arc::new(Recorder::new(config, messenger.clone(), metrics.clone()));
        let scheduler = JobScheduler::new(
            Arc::new(Registry::new()),
            recorder,
            messenger.clone(),
            metrics.clone(),
            timezone,
        );

        Ok(Self {
            sessions: DashMap::new(),
            scheduler,
            mailbox,
            messenger,
            metrics,
            max_minutes: config.recording.max_duration_minutes,
            timezone,
        })
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Menu(id) => {
                self.menu(id).await;
                Response::Ok
            }
            Request::Press(id, action) => self.press(id, action).await,
            Request::Say(id, text) => self.say(id, text).await,
            Request::Cancel(id) => {
                self.cancel_command(&id).await;
                Response::Ok
            }
            Request::Status(id) => Response::Status(self.scheduler.status(&id)),
            Request::Inbox(id) => Response::Inbox(self.inbox(&id)),
            Request::Metrics => Response::Metrics(self.metrics.export()),
        }
    }

    pub fn inbox(&self, id: &RequesterId) -> Vec<Message> {
        self.mailbox.messages(id)
    }

    pub async fn shutdown(&self, wait: Duration) {
        self.sessions.clear();
        self.scheduler.shutdown(wait).await;
    }

    async fn menu(&self, id: RequesterId) {
        let prompt = Prompt::menu();
        let msg = edit_or_send(&*self.messenger, &id, None, &prompt.text, &prompt.actions).await;
        let mut session = ConversationSession::new(id.clone());
        session.last_prompt = msg;
        self.sessions.insert(id, session);
    }

    async fn press(&self, id: RequesterId, action: Action) -> Response {
        match action {
            Action::NewRecording => {
                if self.scheduler.is_busy(&id) {
                    return Response::Notice(ScheduleError::Conflict.to_string());
                }
                let prompt = self
                    .sessions
                    .entry(id.clone())
                    .or_insert_with(|| ConversationSession::new(id.clone()))
                    .begin();
                self.show(&id, &prompt).await;
            }
            Action::CancelJob => {
                let last = self.last_prompt(&id);
                let text = match self.scheduler.cancel(&id) {
                    CancelResult::Signalled => "Cancelling recording...",
                    CancelResult::Unscheduled => {
                        self.sessions.remove(&id);
                        "Job cancelled"
                    }
                    CancelResult::NoActiveJob => "No active job",
                };
                self.replace(&id, last, text).await;
            }
            Action::Status => return Response::Notice(status_text(&self.scheduler.status(&id))),
            Action::CancelConversation => {
                let last = self.sessions.remove(&id).and_then(|(_, s)| s.last_prompt);
                self.replace(&id, last, "Cancelled").await;
            }
            Action::Confirm => return self.confirm(id).await,
        }
        Response::Ok
    }

    async fn confirm(&self, id: RequesterId) -> Response {
        let Some((_, session)) = self
            .sessions
            .remove_if(&id, |_, s| s.step() == Step::ReadyToStart)
        else {
            let last = self.last_prompt(&id);
            self.replace(&id, last, "Error: Restart with /menu").await;
            return Response::Ok;
        };

        let Some(request) = session.confirm(local_now(self.timezone)) else {
            self.replace(&id, session.last_prompt, "Error: Restart with /menu").await;
            return Response::Ok;
        };

        self.replace(&id, session.last_prompt, "Scheduling...").await;
        match self.scheduler.schedule(request).await {
            Ok(()) => Response::Ok,
            Err(e) => {
                log::warn!("Rejected job for {}: {}", id, e);
                notify(&*self.messenger, &id, &e.to_string()).await;
                Response::Notice(e.to_string())
            }
        }
    }

    async fn say(&self, id: RequesterId, text: String) -> Response {
        let text = text.trim();
        match text {
            "/start" | "/menu" => {
                self.menu(id).await;
                return Response::Ok;
            }
            "/cancel" => {
                self.cancel_command(&id).await;
                return Response::Ok;
            }
            "/status" => return Response::Status(self.scheduler.status(&id)),
            _ if text.starts_with('/') => return Response::Ok,
            _ => {}
        }

        let now = local_now(self.timezone);
        let result = match self.sessions.get_mut(&id) {
            Some(mut session) => session.accept_text(text, now, self.max_minutes),
            None => return Response::Ok,
        };

        match result {
            Ok(Some(prompt)) => self.show(&id, &prompt).await,
            Ok(None) => {}
            Err(e) => {
                log::debug!("Rejected input from {}: {}", id, e);
                notify(&*self.messenger, &id, &e.to_string()).await;
            }
        }
        Response::Ok
    }

    async fn cancel_command(&self, id: &RequesterId) {
        let text = match self.scheduler.cancel(id) {
            CancelResult::Signalled => "Cancelling...",
            CancelResult::Unscheduled => "Job cancelled",
            CancelResult::NoActiveJob => "No active job",
        };
        notify(&*self.messenger, id, text).await;
    }

    fn last_prompt(&self, id: &RequesterId) -> Option<MessageRef> {
        self.sessions.get(id).and_then(|s| s.last_prompt)
    }

    /// Render `prompt` into the session's evolving message.
    async fn show(&self, id: &RequesterId, prompt: &Prompt) {
        let last = self.last_prompt(id);
        let msg = edit_or_send(&*self.messenger, id, last, &prompt.text, &prompt.actions).await;
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.last_prompt = msg;
        }
    }

    async fn replace(&self, id: &RequesterId, last: Option<MessageRef>, text: &str) {
        edit_or_send(&*self.messenger, id, last, text, &[]).await;
    }
}

pub fn status_text(status: &JobStatus) -> String {
    match status {
        JobStatus::Recording { elapsed_secs } => {
            format!("Recording in progress\nElapsed: {} min", (elapsed_secs + 30) / 60)
        }
        JobStatus::Scheduled { start, .. } => format!(
            "Job scheduled, waiting to start\nStart: {}",
            start.format("%d/%m %H:%M")
        ),
        JobStatus::Idle => "No active recordings".to_string(),
    }
}
