use std::sync::atomic::{AtomicU64, Ordering};
use crate::error::Outcome;

/// Metrics collector for Prometheus-compatible output
#[derive(Default)]
pub struct MetricsCollector {
    jobs_scheduled: AtomicU64,
    jobs_unscheduled: AtomicU64,
    recordings_started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    ceiling_kills: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scheduled(&self) {
        self.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unscheduled(&self) {
        self.jobs_unscheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_started(&self) {
        self.recordings_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ceiling_kill(&self) {
        self.ceiling_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Completed(_) => &self.completed,
            Outcome::Failed(_) => &self.failed,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, ok: bool) {
        if ok {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn export(&self) -> String {
        let mut output = String::new();

        counter(&mut output, "streamrec_jobs_scheduled_total", "Jobs accepted by the scheduler", &self.jobs_scheduled);
        counter(&mut output, "streamrec_jobs_unscheduled_total", "Jobs cancelled before they started", &self.jobs_unscheduled);
        counter(&mut output, "streamrec_recordings_started_total", "Capture processes started", &self.recordings_started);
        counter(&mut output, "streamrec_ceiling_kills_total", "Captures stopped by the wall-clock ceiling", &self.ceiling_kills);

        output.push_str("# HELP streamrec_recordings_total Finished recordings by outcome\n");
        output.push_str("# TYPE streamrec_recordings_total counter\n");
        for (label, value) in [
            ("completed", &self.completed),
            ("failed", &self.failed),
            ("cancelled", &self.cancelled),
        ] {
            output.push_str(&format!(
                "streamrec_recordings_total{{outcome=\"{}\"}} {}\n",
                label,
                value.load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP streamrec_deliveries_total Delivery attempts by result\n");
        output.push_str("# TYPE streamrec_deliveries_total counter\n");
        output.push_str(&format!(
            "streamrec_deliveries_total{{result=\"ok\"}} {}\n",
            self.deliveries.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "streamrec_deliveries_total{{result=\"failed\"}} {}\n",
            self.delivery_failures.load(Ordering::Relaxed)
        ));

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {} {}\n", name, help));
    output.push_str(&format!("# TYPE {} counter\n", name));
    output.push_str(&format!("{} {}\n\n", name, value.load(Ordering::Relaxed)));
}
