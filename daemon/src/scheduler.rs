use chrono_tz::Tz;
use common::{local_now, JobRequest, JobStatus, RequesterId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::error::ScheduleError;
use crate::messenger::{notify, Messenger};
use crate::metrics::MetricsCollector;
use crate::recorder::Recorder;
use crate::registry::{CancelResult, Registration, Registry};

/// Defers each job until its start time, then hands it to the recorder.
pub struct JobScheduler {
    registry: Arc<Registry>,
    recorder: Arc<Recorder>,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<MetricsCollector>,
    timezone: Option<Tz>,
}

impl JobScheduler {
    pub fn new(
        registry: Arc<Registry>,
        recorder: Arc<Recorder>,
        messenger: Arc<dyn Messenger>,
        metrics: Arc<MetricsCollector>,
        timezone: Option<Tz>,
    ) -> Self {
        Self {
            registry,
            recorder,
            messenger,
            metrics,
            timezone,
        }
    }

    pub fn is_busy(&self, requester: &RequesterId) -> bool {
        self.registry.is_busy(requester)
    }

    pub fn status(&self, requester: &RequesterId) -> JobStatus {
        self.registry.status(requester)
    }

    /// Accept a job. A start in the past runs at once.
    pub async fn schedule(&self, request: JobRequest) -> Result<(), ScheduleError> {
        let token = CancellationToken::new();
        let serial = self.registry.reserve(request.clone(), token.clone())?;
        self.metrics.record_scheduled();

        let requester = request.requester.clone();
        let delay = (request.start() - local_now(self.timezone))
            .to_std()
            .unwrap_or(Duration::ZERO);
        log::info!(
            "Scheduled {} for {} in {}s ({} min)",
            request.base_name(),
            requester,
            delay.as_secs(),
            request.duration_minutes()
        );

        notify(
            &*self.messenger,
            &requester,
            &format!(
                "Recording Scheduled\n\nStart: {}\nEnd: {}\nDuration: {} minutes\n\nUse /cancel to cancel",
                request.start().format("%d/%m/%Y %H:%M"),
                request.end().format("%d/%m/%Y %H:%M"),
                request.duration_minutes()
            ),
        )
        .await;

        let registry = self.registry.clone();
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            let registration = Registration::new(registry.clone(), requester.clone(), serial);

            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Job {} for {} cancelled before start", serial, requester);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(cancel) = registry.promote(&requester, serial) else {
                log::info!("Job {} for {} no longer scheduled", serial, requester);
                return;
            };
            recorder.run(request, cancel, registration).await;
        });

        Ok(())
    }

    pub fn cancel(&self, requester: &RequesterId) -> CancelResult {
        let result = self.registry.cancel(requester);
        match result {
            CancelResult::Unscheduled => {
                self.metrics.record_unscheduled();
                log::info!("Unscheduled job for {}", requester);
            }
            CancelResult::Signalled => log::info!("Stopping recording for {}", requester),
            CancelResult::NoActiveJob => {}
        }
        result
    }

    /// Cancel everything and wait up to `wait` for running jobs to clean up.
    pub async fn shutdown(&self, wait: Duration) {
        let signalled = self.registry.cancel_all();
        if signalled == 0 {
            return;
        }
        log::info!("Cancelling {} job(s)", signalled);

        let deadline = tokio::time::Instant::now() + wait;
        while self.registry.len() > 0 {
            if tokio::time::Instant::now() >= deadline {
                log::warn!("{} job(s) still running at shutdown", self.registry.len());
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        log::info!("All jobs stopped");
    }
}
