use common::JobRequest;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use crate::artifacts::{size_mb, JobArtifacts};
use crate::config::Config;
use crate::convert::ConversionStage;
use crate::error::{Failure, Outcome};
use crate::messenger::{notify, retract, Messenger};
use crate::metrics::MetricsCollector;
use crate::registry::Registration;
use crate::supervisor::ProcessSupervisor;

/// Runs a job once its start time has come: capture, convert, deliver.
pub struct Recorder {
    supervisor: ProcessSupervisor,
    converter: ConversionStage,
    output_dir: PathBuf,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<MetricsCollector>,
}

impl Recorder {
    pub fn new(config: &Config, messenger: Arc<dyn Messenger>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(config.engine.clone(), &config.recording),
            converter: ConversionStage::new(&config.engine, &config.recording),
            output_dir: config.recording.output_dir.clone(),
            messenger,
            metrics,
        }
    }

    /// `registration` is released as soon as nothing runs any more, before
    /// delivery. Every file the job created is gone when this returns.
    pub async fn run(
        &self,
        request: JobRequest,
        cancel: CancellationToken,
        registration: Registration,
    ) -> Outcome {
        let to = &request.requester;
        let artifacts = JobArtifacts::new(&self.output_dir, &request);
        self.metrics.record_started();

        let started = format!(
            "Recording Started\n\nFile: {}\nDuration: {} minutes\n\nYou will be notified when complete.",
            artifacts.final_name(),
            request.duration_minutes()
        );
        tokio::select! {
            _ = notify(&*self.messenger, to, &started) => {}
            _ = cancel.cancelled() => log::info!("[{}] Cancelled before capture", artifacts.base_name),
        }

        let outcome = self.capture_and_convert(&request, &artifacts, &cancel).await;
        drop(registration);
        self.metrics.record_outcome(&outcome);
        log::info!("[{}] Job for {} {}", artifacts.base_name, to, outcome.label());

        match &outcome {
            Outcome::Completed(path) => self.deliver(&request, &artifacts, path).await,
            Outcome::Failed(Failure::Engine(reason)) => {
                log::error!("[{}] Recording failed: {}", artifacts.base_name, reason);
                notify(&*self.messenger, to, "Recording failed. Stream may be unavailable.").await;
            }
            Outcome::Failed(failure) => {
                log::error!("[{}] {}", artifacts.base_name, failure);
                notify(&*self.messenger, to, "Could not prepare the recording for delivery.").await;
            }
            Outcome::Cancelled => {
                notify(&*self.messenger, to, "Recording cancelled.").await;
            }
        }

        outcome
    }

    async fn capture_and_convert(
        &self,
        request: &JobRequest,
        artifacts: &JobArtifacts,
        cancel: &CancellationToken,
    ) -> Outcome {
        let tag = &artifacts.base_name;
        let report = self.supervisor.run(request, &artifacts.intermediate, tag, cancel).await;
        if report.ceiling_hit {
            self.metrics.record_ceiling_kill();
        }

        match report.outcome {
            Outcome::Completed(_) if cancel.is_cancelled() => Outcome::Cancelled,
            Outcome::Completed(intermediate) => {
                self.converter
                    .convert(&intermediate, &artifacts.final_path, tag, cancel)
                    .await
            }
            other => other,
        }
    }

    async fn deliver(&self, request: &JobRequest, artifacts: &JobArtifacts, path: &Path) {
        let to = &request.requester;
        let name = artifacts.final_name();
        let mb = tokio::fs::metadata(path)
            .await
            .map(|m| size_mb(m.len()))
            .unwrap_or(0.0);

        let progress = notify(
            &*self.messenger,
            to,
            &format!("Uploading {} ({:.1} MB)...", name, mb),
        )
        .await;

        let caption = format!(
            "Recording Complete\n\nFile: {}\nSize: {:.1} MB\nDuration: {} min",
            name,
            mb,
            request.duration_minutes()
        );

        match self.messenger.send_file(to, path, &caption).await {
            Ok(()) => {
                retract(&*self.messenger, to, progress).await;
                notify(&*self.messenger, to, "Upload complete!").await;
                self.metrics.record_delivery(true);
            }
            Err(e) => {
                log::error!("[{}] Upload failed: {:#}", artifacts.base_name, e);
                retract(&*self.messenger, to, progress).await;
                let reason: String = format!("{:#}", e).chars().take(100).collect();
                notify(&*self.messenger, to, &format!("Upload failed: {}", reason)).await;
                self.metrics.record_delivery(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::{Mailbox, TimeoutMessenger, WebhookMirror};
    use crate::registry::Registry;
    use crate::test_support::{
        files_under, request_starting_in, silent_http_endpoint, test_config, write_script, FailingMessenger,
        HangingMessenger, COPY_INPUT_SCRIPT,
    };
    use common::RequesterId;
    use std::time::{Duration, Instant};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        mailbox: Arc<Mailbox>,
        registry: Arc<Registry>,
        metrics: Arc<MetricsCollector>,
        recorder: Recorder,
    }

    fn fixture(engine_body: &str) -> Fixture {
        fixture_with(engine_body, None)
    }

    /// `transport` replaces the mailbox as the chat side when given.
    fn fixture_with(engine_body: &str, transport: Option<Arc<dyn Messenger>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut config = test_config(&root);
        config.engine.program = write_script(&root, "engine.sh", engine_body);
        let mailbox = Arc::new(Mailbox::new(config.recording.delivery_dir.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let messenger = transport.unwrap_or_else(|| mailbox.clone() as Arc<dyn Messenger>);
        let recorder = Recorder::new(&config, messenger, metrics.clone());
        Fixture {
            _dir: dir,
            root,
            mailbox,
            registry: Arc::new(Registry::new()),
            metrics,
            recorder,
        }
    }

    fn grace() -> RequesterId {
        RequesterId("grace".to_string())
    }

    async fn run(f: &Fixture, request: JobRequest, cancel: CancellationToken) -> Outcome {
        let serial = f.registry.reserve(request.clone(), cancel.clone()).unwrap();
        let cancel = f.registry.promote(&request.requester, serial).unwrap();
        let registration = Registration::new(f.registry.clone(), request.requester.clone(), serial);
        f.recorder.run(request, cancel, registration).await
    }

    fn texts(f: &Fixture) -> Vec<String> {
        f.mailbox.messages(&grace()).into_iter().map(|m| m.text).collect()
    }

    #[tokio::test]
    async fn test_successful_job_is_delivered_and_cleaned_up() {
        let f = fixture(COPY_INPUT_SCRIPT);
        let request = request_starting_in(&grace(), 0, 60);
        let outcome = run(&f, request.clone(), CancellationToken::new()).await;

        assert!(matches!(outcome, Outcome::Completed(_)));
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());

        let messages = f.mailbox.messages(&grace());
        let delivered = messages.iter().find_map(|m| m.attachment.clone()).unwrap();
        assert_eq!(delivered.file_name().unwrap().to_string_lossy(), format!("{}.mp4", request.base_name()));
        assert!(delivered.exists());

        let texts = texts(&f);
        assert!(texts[0].starts_with("Recording Started"));
        assert!(texts.iter().any(|t| t.starts_with("Recording Complete")));
        assert_eq!(texts.last().unwrap(), "Upload complete!");
        assert!(!texts.iter().any(|t| t.starts_with("Uploading")));
        assert!(f.metrics.export().contains("streamrec_deliveries_total{result=\"ok\"} 1"));
    }

    #[tokio::test]
    async fn test_engine_failure_reports_and_cleans_up() {
        let f = fixture("exit 1");
        let outcome = run(&f, request_starting_in(&grace(), 0, 60), CancellationToken::new()).await;

        assert!(matches!(outcome, Outcome::Failed(Failure::Engine(_))));
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
        assert_eq!(texts(&f).last().unwrap(), "Recording failed. Stream may be unavailable.");
    }

    #[tokio::test]
    async fn test_cancel_mid_capture_leaves_nothing() {
        let f = fixture(r#"for a in "$@"; do out="$a"; done
head -c 4096 /dev/zero > "$out"
exec sleep 3600"#);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = run(&f, request_starting_in(&grace(), 0, 600), cancel).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
        assert!(files_under(&f.root.join("delivered")).is_empty());
        assert_eq!(texts(&f).last().unwrap(), "Recording cancelled.");
    }

    #[tokio::test]
    async fn test_stub_capture_never_reaches_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("remuxed");
        // capture writes a stub; a remux call would leave the marker behind
        let f = fixture(&format!(
            r#"in=""; prev=""
for a in "$@"; do
  if [ "$prev" = "-i" ]; then in="$a"; fi
  prev="$a"; out="$a"
done
case "$in" in
  http*) head -c 10 /dev/zero > "$out" ;;
  *) touch "{}"; cp "$in" "$out" ;;
esac"#,
            marker.display()
        ));

        let outcome = run(&f, request_starting_in(&grace(), 0, 60), CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Failed(Failure::Engine("no usable output".to_string())));
        assert!(!marker.exists());
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
    }

    #[tokio::test]
    async fn test_failing_chat_transport_still_cleans_up() {
        let f = fixture_with(COPY_INPUT_SCRIPT, Some(Arc::new(FailingMessenger)));
        let outcome = run(&f, request_starting_in(&grace(), 0, 60), CancellationToken::new()).await;

        assert!(matches!(outcome, Outcome::Completed(_)));
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
        assert!(f.metrics.export().contains("streamrec_deliveries_total{result=\"failed\"} 1"));
    }

    #[tokio::test]
    async fn test_hung_chat_transport_still_cleans_up() {
        let bounded: Arc<dyn Messenger> = Arc::new(TimeoutMessenger::new(
            Arc::new(HangingMessenger),
            Duration::from_millis(200),
            Duration::from_millis(200),
        ));
        let f = fixture_with(COPY_INPUT_SCRIPT, Some(bounded));

        let started = Instant::now();
        let outcome = run(&f, request_starting_in(&grace(), 0, 60), CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_start_notice_hangs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let bounded: Arc<dyn Messenger> = Arc::new(TimeoutMessenger::new(
            Arc::new(HangingMessenger),
            Duration::from_secs(30),
            Duration::from_secs(30),
        ));
        let f = fixture_with(&format!("touch \"{}\"\nexec sleep 3600", marker.display()), Some(bounded));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        // the closing notice still waits out its own bound, so only check progress up to the capture
        let registry = f.registry.clone();
        let job = run(&f, request_starting_in(&grace(), 0, 600), cancel);
        let _ = tokio::time::timeout(Duration::from_secs(2), job).await;
        assert!(!marker.exists());
        assert!(!registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_webhook_does_not_delay_capture() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let url = silent_http_endpoint().await;
        let inner = Arc::new(Mailbox::new(dir.path().join("delivered")));
        let mirror: Arc<dyn Messenger> = Arc::new(WebhookMirror::new(inner, url, Duration::from_secs(60)).unwrap());
        let f = fixture_with(&format!("touch \"{}\"\nexec sleep 3600", marker.display()), Some(mirror));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run(&f, request_starting_in(&grace(), 0, 600), cancel),
        )
        .await
        .expect("job stuck behind the webhook");
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(marker.exists());
        assert!(!f.registry.is_busy(&grace()));
        assert!(files_under(&f.root.join("recordings")).is_empty());
    }
}
