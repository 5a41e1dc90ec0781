use common::{JobRequest, JobStatus, RequesterId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::error::ScheduleError;

/// Distinguishes successive jobs of the same requester.
pub type Serial = u64;

pub struct ScheduledJob {
    pub serial: Serial,
    pub request: JobRequest,
    pub armed_at: Instant,
    pub cancel: CancellationToken,
}

pub struct ActiveRecording {
    pub serial: Serial,
    pub request: JobRequest,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

#[derive(Default)]
struct Inner {
    next_serial: Serial,
    scheduled: HashMap<RequesterId, ScheduledJob>,
    active: HashMap<RequesterId, ActiveRecording>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The deferred start was disarmed; nothing ever ran.
    Unscheduled,
    /// The running recording was told to stop.
    Signalled,
    NoActiveJob,
}

/// Bookkeeping for scheduled and running jobs.
///
/// Both maps sit behind one lock so "at most one job per requester across
/// both" is checked and updated atomically.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self, requester: &RequesterId) -> bool {
        let inner = self.lock();
        inner.scheduled.contains_key(requester) || inner.active.contains_key(requester)
    }

    /// Register a pending job, failing if the requester already has one.
    pub fn reserve(&self, request: JobRequest, cancel: CancellationToken) -> Result<Serial, ScheduleError> {
        let mut inner = self.lock();
        let requester = request.requester.clone();
        if inner.scheduled.contains_key(&requester) || inner.active.contains_key(&requester) {
            return Err(ScheduleError::Conflict);
        }

        inner.next_serial += 1;
        let serial = inner.next_serial;
        inner.scheduled.insert(requester, ScheduledJob {
            serial,
            request,
            armed_at: Instant::now(),
            cancel,
        });
        Ok(serial)
    }

    /// Move a scheduled job into the active set. `None` if it was cancelled meanwhile.
    pub fn promote(&self, requester: &RequesterId, serial: Serial) -> Option<CancellationToken> {
        let mut inner = self.lock();
        match inner.scheduled.get(requester) {
            Some(job) if job.serial == serial && !job.cancel.is_cancelled() => {}
            _ => return None,
        }
        let job = inner.scheduled.remove(requester)?;
        let cancel = job.cancel.clone();
        inner.active.insert(requester.clone(), ActiveRecording {
            serial,
            request: job.request,
            cancel: job.cancel,
            started_at: Instant::now(),
        });
        Some(cancel)
    }

    pub fn cancel(&self, requester: &RequesterId) -> CancelResult {
        let mut inner = self.lock();
        if let Some(active) = inner.active.get(requester) {
            log::debug!("Signalling {} for {}", active.request.base_name(), requester);
            active.cancel.cancel();
            return CancelResult::Signalled;
        }
        if let Some(job) = inner.scheduled.remove(requester) {
            log::debug!(
                "Disarming {} for {} (armed {}s ago)",
                job.request.base_name(),
                requester,
                job.armed_at.elapsed().as_secs()
            );
            job.cancel.cancel();
            return CancelResult::Unscheduled;
        }
        CancelResult::NoActiveJob
    }

    /// Drop whatever entry `serial` still owns.
    pub fn release(&self, requester: &RequesterId, serial: Serial) {
        let mut inner = self.lock();
        if inner.scheduled.get(requester).map_or(false, |j| j.serial == serial) {
            inner.scheduled.remove(requester);
        }
        if inner.active.get(requester).map_or(false, |a| a.serial == serial) {
            inner.active.remove(requester);
        }
    }

    pub fn status(&self, requester: &RequesterId) -> JobStatus {
        let inner = self.lock();
        if let Some(active) = inner.active.get(requester) {
            return JobStatus::Recording {
                elapsed_secs: active.started_at.elapsed().as_secs(),
            };
        }
        if let Some(job) = inner.scheduled.get(requester) {
            return JobStatus::Scheduled {
                start: job.request.start(),
                end: job.request.end(),
            };
        }
        JobStatus::Idle
    }

    /// Signal every job. Scheduled ones are removed at once, active ones clean up themselves.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.lock();
        let scheduled: Vec<ScheduledJob> = inner.scheduled.drain().map(|(_, job)| job).collect();
        for job in &scheduled {
            job.cancel.cancel();
        }
        for active in inner.active.values() {
            active.cancel.cancel();
        }
        scheduled.len() + inner.active.len()
    }

    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.scheduled.len() + inner.active.len()
    }
}

/// Removes a job from the registry when the job's task ends, however it ends.
pub struct Registration {
    registry: Arc<Registry>,
    requester: RequesterId,
    serial: Serial,
}

impl Registration {
    pub fn new(registry: Arc<Registry>, requester: RequesterId, serial: Serial) -> Self {
        Self { registry, requester, serial }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.requester, self.serial);
    }
}
