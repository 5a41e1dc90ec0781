use common::JobRequest;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::artifacts::{remove_file_quietly, OutputValidator};
use crate::config::{EngineConfig, RecordingConfig};
use crate::error::{Failure, Outcome};

/// How many exceptional stderr lines are kept for the exit summary.
const KEEP_ERROR_LINES: usize = 10;

/// Capture command line. The duration is only a hint to the engine;
/// the supervisor enforces the real limit.
pub fn capture_args(engine: &EngineConfig, url: &str, duration: Duration, output: &Path) -> Vec<String> {
    let p = &engine.profile;
    let mut args: Vec<String> = [
        "-y", "-hide_banner", "-loglevel", "error", "-nostdin",
        // reconnect on drop
        "-reconnect", "1",
        "-reconnect_streamed", "1",
        "-reconnect_delay_max", "10",
        "-reconnect_at_eof", "1",
        "-multiple_requests", "1",
        "-http_persistent", "0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend([
        "-timeout".to_string(),
        (engine.segment_timeout_secs * 1_000_000).to_string(),
        "-seekable".to_string(),
        "0".to_string(),
        "-live_start_index".to_string(),
        "-3".to_string(),
        "-protocol_whitelist".to_string(),
        engine.protocol_whitelist.clone(),
        "-i".to_string(),
        url.to_string(),
        "-t".to_string(),
        duration.as_secs().to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "0:a?".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        p.preset.clone(),
        "-crf".to_string(),
        p.crf.to_string(),
        "-maxrate".to_string(),
        p.max_rate.clone(),
        "-bufsize".to_string(),
        p.buf_size.clone(),
        "-vf".to_string(),
        format!("scale=-2:{}", p.max_height),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-profile:v".to_string(),
        "baseline".to_string(),
        "-level".to_string(),
        "3.0".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        p.audio_bitrate.clone(),
        "-ac".to_string(),
        "2".to_string(),
        "-f".to_string(),
        "matroska".to_string(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

/// Encoder progress output, not worth logging.
pub fn is_progress_noise(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    let lower = line.to_lowercase();
    lower.starts_with("frame=") || lower.starts_with("size=") || lower.contains(" frame=")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub outcome: Outcome,
    /// The supervisor, not the engine, ended the capture.
    pub ceiling_hit: bool,
}

impl CaptureReport {
    fn new(outcome: Outcome, ceiling_hit: bool) -> Self {
        Self { outcome, ceiling_hit }
    }
}

/// Runs one capture and owns its child process until it is gone.
pub struct ProcessSupervisor {
    engine: EngineConfig,
    safety_margin: Duration,
    stop_grace: Duration,
    validator: OutputValidator,
}

impl ProcessSupervisor {
    pub fn new(engine: EngineConfig, recording: &RecordingConfig) -> Self {
        Self {
            engine,
            safety_margin: recording.safety_margin(),
            stop_grace: recording.stop_grace(),
            validator: OutputValidator::new(recording.min_output_bytes),
        }
    }

    /// Hard wall-clock limit for a request, measured from spawn.
    pub fn ceiling(&self, request: &JobRequest) -> Duration {
        request.duration() + self.safety_margin
    }

    pub async fn run(
        &self,
        request: &JobRequest,
        output: &Path,
        tag: &str,
        cancel: &CancellationToken,
    ) -> CaptureReport {
        if let Some(dir) = output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                log::error!("[{}] Cannot create {:?}: {}", tag, dir, e);
                return CaptureReport::new(Outcome::Failed(Failure::Engine(e.to_string())), false);
            }
        }

        if cancel.is_cancelled() {
            return CaptureReport::new(Outcome::Cancelled, false);
        }

        let ceiling = self.ceiling(request);
        let mut cmd = Command::new(&self.engine.program);
        cmd.args(capture_args(&self.engine, &request.stream_url, request.duration(), output));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        log::info!(
            "[{}] Starting capture: {} min, ceiling {}s",
            tag,
            request.duration_minutes(),
            ceiling.as_secs()
        );
        log::info!("[{}] URL: {}", tag, request.stream_url.chars().take(80).collect::<String>());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("[{}] Failed to spawn {:?}: {}", tag, self.engine.program, e);
                let reason = format!("failed to start {:?}: {}", self.engine.program, e);
                return CaptureReport::new(Outcome::Failed(Failure::Engine(reason)), false);
            }
        };

        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut recent: VecDeque<String> = VecDeque::with_capacity(KEEP_ERROR_LINES);
        let deadline = tokio::time::sleep_until(Instant::now() + ceiling);
        tokio::pin!(deadline);
        let mut ceiling_hit = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("[{}] Cancelled, killing engine", tag);
                    kill_now(&mut child).await;
                    remove_file_quietly(output);
                    return CaptureReport::new(Outcome::Cancelled, false);
                }
                status = child.wait() => {
                    match status {
                        Ok(status) => log::info!("[{}] Engine exited: {}", tag, status),
                        Err(e) => log::error!("[{}] Failed to wait for engine: {}", tag, e),
                    }
                    break;
                }
                _ = &mut deadline => {
                    log::warn!("[{}] Engine exceeded ceiling of {}s, terminating", tag, ceiling.as_secs());
                    ceiling_hit = true;
                    stop_child(&mut child, self.stop_grace).await;
                    break;
                }
                line = next_line(&mut stderr) => match line {
                    Some(line) => keep_line(tag, line, &mut recent),
                    None => stderr = None,
                },
            }
        }

        if let Some(lines) = stderr.as_mut() {
            let drain = async {
                while let Ok(Some(raw)) = lines.next_segment().await {
                    keep_line(tag, String::from_utf8_lossy(&raw).into_owned(), &mut recent);
                }
            };
            let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
        }

        if !recent.is_empty() {
            log::warn!("[{}] Engine reported {} error line(s), last: {}", tag, recent.len(), recent.back().map(String::as_str).unwrap_or(""));
        }

        // exit and cancel can land together
        if cancel.is_cancelled() {
            remove_file_quietly(output);
            return CaptureReport::new(Outcome::Cancelled, ceiling_hit);
        }

        if !self.validator.validate(output).await {
            log::error!("[{}] FAILED: stream produced no usable data", tag);
            remove_file_quietly(output);
            let reason = recent
                .back()
                .cloned()
                .unwrap_or_else(|| "no usable output".to_string());
            return CaptureReport::new(Outcome::Failed(Failure::Engine(reason)), ceiling_hit);
        }

        CaptureReport::new(Outcome::Completed(output.to_path_buf()), ceiling_hit)
    }
}

/// Engine output is not guaranteed to be UTF-8; bad bytes are replaced, not fatal.
async fn next_line(lines: &mut Option<Split<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(lines) => match lines.next_segment().await {
            Ok(raw) => raw.map(|raw| String::from_utf8_lossy(&raw).into_owned()),
            Err(e) => {
                log::debug!("Engine stderr closed: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}

fn keep_line(tag: &str, line: String, recent: &mut VecDeque<String>) {
    if is_progress_noise(&line) {
        return;
    }
    log::warn!(target: "engine_output", "[{}] {}", tag, line.trim());
    if recent.len() == KEEP_ERROR_LINES {
        recent.pop_front();
    }
    recent.push_back(line.trim().to_string());
}

async fn kill_now(child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::debug!("Kill failed (process likely gone): {}", e);
    }
}

/// SIGTERM, give it `grace` to finish the container, then SIGKILL.
pub async fn stop_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                    return;
                }
                log::warn!("Process {} ignored SIGTERM for {}s, killing", pid, grace.as_secs());
            }
        }
    }
    kill_now(child).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request_starting_in, test_config, write_script};
    use common::RequesterId;
    use std::time::Instant as StdInstant;

    fn supervisor_for(program: std::path::PathBuf, margin: u64) -> ProcessSupervisor {
        let mut config = test_config(Path::new("/unused"));
        config.engine.program = program;
        config.recording.safety_margin_secs = margin;
        config.recording.stop_grace_secs = 1;
        ProcessSupervisor::new(config.engine.clone(), &config.recording)
    }

    fn dave() -> RequesterId {
        RequesterId("dave".to_string())
    }

    #[test]
    fn test_capture_args_contract() {
        let engine = EngineConfig::default();
        let args = capture_args(&engine, "https://example.com/live.m3u8", Duration::from_secs(1800), Path::new("/r/x_temp.mkv"));
        let after = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };

        assert_eq!(after("-i"), "https://example.com/live.m3u8");
        assert_eq!(after("-t"), "1800");
        assert_eq!(after("-timeout"), "30000000");
        assert_eq!(after("-protocol_whitelist"), "file,http,https,tcp,tls,crypto");
        assert_eq!(after("-reconnect"), "1");
        assert_eq!(after("-vf"), "scale=-2:480");
        assert_eq!(after("-crf"), "28");
        assert_eq!(after("-maxrate"), "800k");
        assert_eq!(after("-bufsize"), "1600k");
        assert_eq!(after("-f"), "matroska");
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:v:0"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:a?"));
        assert_eq!(args.last().unwrap(), "/r/x_temp.mkv");
    }

    #[test]
    fn test_progress_noise() {
        assert!(is_progress_noise("frame= 1200 fps= 25 q=28.0 size=  4096kB"));
        assert!(is_progress_noise("size=    1024kB time=00:00:40.00"));
        assert!(is_progress_noise("   "));
        assert!(!is_progress_noise("https://x/seg12.ts: Server returned 404 Not Found"));
    }

    #[tokio::test]
    async fn test_engine_output_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "engine.sh", r#"for a in "$@"; do out="$a"; done
head -c 4096 /dev/zero > "$out""#);
        let supervisor = supervisor_for(engine, 30);
        let output = dir.path().join("rec").join("job_temp.mkv");

        let report = supervisor
            .run(&request_starting_in(&dave(), 0, 60), &output, "ok", &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, Outcome::Completed(output.clone()));
        assert!(!report.ceiling_hit);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_stub_output_is_engine_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "engine.sh", r#"for a in "$@"; do out="$a"; done
echo "Connection refused" >&2
head -c 10 /dev/zero > "$out""#);
        let supervisor = supervisor_for(engine, 30);
        let output = dir.path().join("job_temp.mkv");

        let report = supervisor
            .run(&request_starting_in(&dave(), 0, 60), &output, "stub", &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, Outcome::Failed(Failure::Engine("Connection refused".to_string())));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_undecodable_stderr_keeps_later_lines() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "engine.sh", r#"for a in "$@"; do out="$a"; done
printf 'bad \377 byte\n' >&2
echo "Server returned 403 Forbidden" >&2
head -c 10 /dev/zero > "$out""#);
        let supervisor = supervisor_for(engine, 30);
        let output = dir.path().join("forbidden_temp.mkv");

        let report = supervisor
            .run(&request_starting_in(&dave(), 0, 60), &output, "forbidden", &CancellationToken::new())
            .await;
        assert_eq!(
            report.outcome,
            Outcome::Failed(Failure::Engine("Server returned 403 Forbidden".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_spawn_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let engine = write_script(dir.path(), "engine.sh", &format!("touch \"{}\"", marker.display()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = supervisor_for(engine, 30)
            .run(&request_starting_in(&dave(), 0, 60), &dir.path().join("x.mkv"), "early", &cancel)
            .await;
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_for(dir.path().join("no-such-encoder"), 30);
        let report = supervisor
            .run(&request_starting_in(&dave(), 0, 60), &dir.path().join("x.mkv"), "missing", &CancellationToken::new())
            .await;
        assert!(matches!(report.outcome, Outcome::Failed(Failure::Engine(_))));
    }

    #[tokio::test]
    async fn test_ceiling_stops_engine_that_ignores_duration() {
        let dir = tempfile::tempdir().unwrap();
        // writes some data, then never exits on its own
        let engine = write_script(dir.path(), "hang.sh", r#"for a in "$@"; do out="$a"; done
head -c 4096 /dev/zero > "$out"
exec sleep 3600"#);
        let supervisor = supervisor_for(engine, 1);
        let request = request_starting_in(&dave(), 0, 1);
        assert_eq!(supervisor.ceiling(&request), Duration::from_secs(2));
        let output = dir.path().join("hang_temp.mkv");

        let started = StdInstant::now();
        let report = supervisor
            .run(&request, &output, "hang", &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        assert!(report.ceiling_hit);
        assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
        // ceiling + stop grace + scheduling slack
        assert!(elapsed < Duration::from_secs(6), "{:?}", elapsed);
        // partial output still goes on to validation
        assert_eq!(report.outcome, Outcome::Completed(output));
    }

    #[tokio::test]
    async fn test_ceiling_without_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "silent.sh", "exec sleep 3600");
        let supervisor = supervisor_for(engine, 1);
        let output = dir.path().join("silent_temp.mkv");

        let report = supervisor
            .run(&request_starting_in(&dave(), 0, 1), &output, "silent", &CancellationToken::new())
            .await;
        assert!(report.ceiling_hit);
        assert!(matches!(report.outcome, Outcome::Failed(Failure::Engine(_))));
    }

    #[tokio::test]
    async fn test_cancel_kills_and_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "slow.sh", r#"for a in "$@"; do out="$a"; done
head -c 4096 /dev/zero > "$out"
exec sleep 3600"#);
        let supervisor = supervisor_for(engine, 60);
        let output = dir.path().join("slow_temp.mkv");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = StdInstant::now();
        let report = supervisor
            .run(&request_starting_in(&dave(), 0, 600), &output, "slow", &cancel)
            .await;
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(!output.exists());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
