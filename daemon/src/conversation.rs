use chrono::{NaiveDateTime, NaiveTime};
use common::{calculate_schedule, parse_time, Action, JobRequest, MessageRef, RequesterId, Window};
use crate::error::InputError;

pub const MENU_TEXT: &str = "Stream Recorder\n\nSchedule recordings from live streams";
const URL_PROMPT: &str = "Step 1/3: Send stream URL\n\nSupported: m3u8, YouTube, most formats";
const START_PROMPT: &str = "Step 2/3: Send start time (HH:MM)\n\nExample: 14:30";
const END_PROMPT: &str = "Step 3/3: Send end time (HH:MM)\n\nExample: 15:30";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Start,
    WaitingUrl,
    WaitingStartTime,
    WaitingEndTime,
    ReadyToStart,
}

/// What the requester's single evolving prompt should now show.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub actions: Vec<Action>,
}

impl Prompt {
    fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            actions: Vec::new(),
        }
    }

    pub fn menu() -> Self {
        Self {
            text: MENU_TEXT.to_string(),
            actions: Action::MENU.to_vec(),
        }
    }
}

/// Per-requester intake of a stream URL and a time window.
///
/// Steps only move forward one at a time, or back to `Start` via [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub requester: RequesterId,
    step: Step,
    url: Option<String>,
    start_time: Option<NaiveTime>,
    end_time: Option<NaiveTime>,
    pub last_prompt: Option<MessageRef>,
}

impl ConversationSession {
    pub fn new(requester: RequesterId) -> Self {
        Self {
            requester,
            step: Step::Start,
            url: None,
            start_time: None,
            end_time: None,
            last_prompt: None,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn reset(&mut self) {
        self.step = Step::Start;
        self.url = None;
        self.start_time = None;
        self.end_time = None;
    }

    /// Restart the intake and ask for the URL.
    pub fn begin(&mut self) -> Prompt {
        self.reset();
        self.step = Step::WaitingUrl;
        Prompt::plain(URL_PROMPT)
    }

    /// Feed free text into the current step.
    ///
    /// `Ok(None)` means the step does not take text. Errors leave the step unchanged.
    pub fn accept_text(
        &mut self,
        text: &str,
        now: NaiveDateTime,
        max_minutes: i64,
    ) -> Result<Option<Prompt>, InputError> {
        let text = text.trim();
        match self.step {
            Step::WaitingUrl => {
                if !looks_like_url(text) {
                    return Err(InputError::InvalidUrl);
                }
                self.url = Some(text.to_string());
                self.step = Step::WaitingStartTime;
                Ok(Some(Prompt::plain(START_PROMPT)))
            }
            Step::WaitingStartTime => {
                let start = parse_time(text).ok_or(InputError::InvalidTime)?;
                self.start_time = Some(start);
                self.step = Step::WaitingEndTime;
                Ok(Some(Prompt::plain(END_PROMPT)))
            }
            Step::WaitingEndTime => {
                let end = parse_time(text).ok_or(InputError::InvalidTime)?;
                let start = self.start_time.ok_or(InputError::InvalidTime)?;
                let window = calculate_schedule(start, end, now);
                check_duration(&window, max_minutes)?;

                self.end_time = Some(end);
                self.step = Step::ReadyToStart;
                Ok(Some(review_prompt(&window)))
            }
            Step::Start | Step::ReadyToStart => Ok(None),
        }
    }

    /// Turn a reviewed session into a job, resolving the window against `now`.
    pub fn confirm(&self, now: NaiveDateTime) -> Option<JobRequest> {
        if self.step != Step::ReadyToStart {
            return None;
        }
        let url = self.url.clone()?;
        let window = calculate_schedule(self.start_time?, self.end_time?, now);
        Some(JobRequest::new(self.requester.clone(), url, window))
    }
}

fn check_duration(window: &Window, max_minutes: i64) -> Result<(), InputError> {
    let minutes = window.duration_minutes();
    if minutes <= 0 {
        return Err(InputError::NonPositiveDuration);
    }
    if minutes > max_minutes {
        return Err(InputError::DurationTooLong { max_minutes });
    }
    Ok(())
}

fn review_prompt(window: &Window) -> Prompt {
    Prompt {
        text: format!(
            "Review:\n\nStart: {}\nEnd: {}\nDuration: {} min",
            window.start.format("%d/%m %H:%M"),
            window.end.format("%d/%m %H:%M"),
            window.duration_minutes()
        ),
        actions: Action::REVIEW.to_vec(),
    }
}

/// Absolute http(s) URL with a host.
pub fn looks_like_url(text: &str) -> bool {
    match url::Url::parse(text) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn session() -> ConversationSession {
        ConversationSession::new(RequesterId("frank".to_string()))
    }

    #[test]
    fn test_full_progression() {
        let mut s = session();
        assert_eq!(s.step(), Step::Start);
        assert!(s.begin().text.starts_with("Step 1/3"));
        assert_eq!(s.step(), Step::WaitingUrl);

        let p = s.accept_text("https://cdn.example.com/live/index.m3u8", now(), 720).unwrap().unwrap();
        assert!(p.text.starts_with("Step 2/3"));
        assert_eq!(s.step(), Step::WaitingStartTime);

        let p = s.accept_text("14:30", now(), 720).unwrap().unwrap();
        assert!(p.text.starts_with("Step 3/3"));

        let p = s.accept_text("15:00", now(), 720).unwrap().unwrap();
        assert_eq!(s.step(), Step::ReadyToStart);
        assert_eq!(p.actions, Action::REVIEW.to_vec());
        assert!(p.text.contains("Start: 02/05 14:30"));
        assert!(p.text.contains("Duration: 30 min"));

        let request = s.confirm(now()).unwrap();
        assert_eq!(request.stream_url, "https://cdn.example.com/live/index.m3u8");
        assert_eq!(request.duration_minutes(), 30);
        assert_eq!(request.requester, RequesterId("frank".to_string()));
    }

    #[test]
    fn test_bad_url_keeps_step() {
        let mut s = session();
        s.begin();
        for bad in ["not a url", "ftp://example.com/x", "example.com/live.m3u8", "http://"] {
            assert_eq!(s.accept_text(bad, now(), 720), Err(InputError::InvalidUrl), "{}", bad);
            assert_eq!(s.step(), Step::WaitingUrl);
        }
    }

    #[test]
    fn test_bad_time_keeps_step() {
        let mut s = session();
        s.begin();
        s.accept_text("http://example.com/a.m3u8", now(), 720).unwrap();
        assert_eq!(s.accept_text("2pm", now(), 720), Err(InputError::InvalidTime));
        assert_eq!(s.step(), Step::WaitingStartTime);

        s.accept_text("11:00", now(), 720).unwrap();
        assert_eq!(s.accept_text("25:61", now(), 720), Err(InputError::InvalidTime));
        assert_eq!(s.step(), Step::WaitingEndTime);
    }

    #[test]
    fn test_over_cap_rejected() {
        let mut s = session();
        s.begin();
        s.accept_text("http://example.com/a.m3u8", now(), 720).unwrap();
        s.accept_text("11:00", now(), 720).unwrap();

        let err = s.accept_text("23:01", now(), 720).unwrap_err();
        assert_eq!(err, InputError::DurationTooLong { max_minutes: 720 });
        assert_eq!(err.to_string(), "Max duration: 12 hours");
        assert_eq!(s.step(), Step::WaitingEndTime);

        // exactly at the cap is fine
        assert!(s.accept_text("23:00", now(), 720).unwrap().is_some());
    }

    #[test]
    fn test_overnight_review() {
        let mut s = session();
        s.begin();
        s.accept_text("http://example.com/a.m3u8", now(), 720).unwrap();
        s.accept_text("23:50", now(), 720).unwrap();
        let p = s.accept_text("00:10", now(), 720).unwrap().unwrap();
        assert!(p.text.contains("Duration: 20 min"));
        assert!(p.text.contains("End: 03/05 00:10"));
    }

    #[test]
    fn test_text_ignored_outside_input_steps() {
        let mut s = session();
        assert_eq!(s.accept_text("hello", now(), 720), Ok(None));
        assert_eq!(s.step(), Step::Start);
    }

    #[test]
    fn test_confirm_only_when_ready() {
        let mut s = session();
        assert!(s.confirm(now()).is_none());
        s.begin();
        s.accept_text("http://example.com/a.m3u8", now(), 720).unwrap();
        assert!(s.confirm(now()).is_none());
    }

    #[test]
    fn test_begin_resets_collected_fields() {
        let mut s = session();
        s.begin();
        s.accept_text("http://example.com/a.m3u8", now(), 720).unwrap();
        s.accept_text("11:00", now(), 720).unwrap();
        s.begin();
        assert_eq!(s.step(), Step::WaitingUrl);
        assert_eq!(s.accept_text("12:00", now(), 720), Err(InputError::InvalidUrl));
    }
}
