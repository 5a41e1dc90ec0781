use serde::{Deserialize, Serialize};
use crate::chat::{Action, Message};
use crate::job::{JobStatus, RequesterId};

/// One chat event sent by the client. Framed as a single JSON line.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    /// `/start` or `/menu`
    Menu(RequesterId),
    /// An inline button press.
    Press(RequesterId, Action),
    /// Free text typed into the chat.
    Say(RequesterId, String),
    /// `/cancel`
    Cancel(RequesterId),
    Status(RequesterId),
    Inbox(RequesterId),
    Metrics,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    /// Short alert shown to the requester instead of a chat message.
    Notice(String),
    Error(String),
    Inbox(Vec<Message>),
    Status(JobStatus),
    Metrics(String),
}
