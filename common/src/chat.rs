use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageRef(pub u64);

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Inline buttons a prompt can offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Action {
    NewRecording,
    CancelJob,
    Status,
    Confirm,
    CancelConversation,
}

impl Action {
    pub const MENU: [Action; 3] = [Action::NewRecording, Action::CancelJob, Action::Status];
    pub const REVIEW: [Action; 2] = [Action::Confirm, Action::CancelConversation];

    pub fn label(&self) -> &'static str {
        match self {
            Action::NewRecording => "New Recording",
            Action::CancelJob => "Cancel Job",
            Action::Status => "Status",
            Action::Confirm => "Confirm",
            Action::CancelConversation => "Cancel",
        }
    }

    /// Name used on the command line.
    pub fn key(&self) -> &'static str {
        match self {
            Action::NewRecording => "new-recording",
            Action::CancelJob => "cancel-job",
            Action::Status => "status",
            Action::Confirm => "confirm",
            Action::CancelConversation => "cancel-conversation",
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "new-recording" | "new" => Ok(Action::NewRecording),
            "cancel-job" => Ok(Action::CancelJob),
            "status" => Ok(Action::Status),
            "confirm" | "start-job" => Ok(Action::Confirm),
            "cancel-conversation" => Ok(Action::CancelConversation),
            _ => Err(anyhow::anyhow!("Unknown action: {}", s)),
        }
    }
}

/// One message as the requester currently sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageRef,
    pub text: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub attachment: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}
