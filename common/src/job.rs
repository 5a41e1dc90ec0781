use crate::schedule::Window;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Identifies the person a job, conversation or notification belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequesterId(pub String);

impl RequesterId {
    /// Usable as a single path component.
    pub fn file_safe(&self) -> String {
        let name: String = self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if name.is_empty() { "_".to_string() } else { name }
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fully resolved recording request. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub requester: RequesterId,
    pub stream_url: String,
    pub window: Window,
}

impl JobRequest {
    pub fn new(requester: RequesterId, stream_url: impl Into<String>, window: Window) -> Self {
        Self {
            requester,
            stream_url: stream_url.into(),
            window,
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.window.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.window.end
    }

    pub fn duration_minutes(&self) -> i64 {
        self.window.duration_minutes()
    }

    /// Requested capture length as a std duration (zero for a degenerate window).
    pub fn duration(&self) -> std::time::Duration {
        self.window.duration().to_std().unwrap_or_default()
    }

    pub fn base_name(&self) -> String {
        self.window.base_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Idle,
    Scheduled { start: NaiveDateTime, end: NaiveDateTime },
    Recording { elapsed_secs: u64 },
}
