mod artifacts;
mod config;
mod conversation;
mod convert;
mod dispatch;
mod error;
mod messenger;
mod metrics;
mod recorder;
mod registry;
mod scheduler;
mod supervisor;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use clap::Parser;
use common::{Request, Response};
use config::{Config, LoggingConfig};
use dispatch::Dispatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "streamrec-daemon")]
#[command(about = "Scheduled live-stream recorder", long_about = None)]
struct Args {
    /// Config file (.yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    setup_logging(&config.logging)?;
    log::info!("Starting streamrec-daemon...");

    let timezone = config.timezone()?;
    for dir in [&config.recording.output_dir, &config.recording.delivery_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {:?}", dir))?;
    }
    log::info!("Recording path: {:?}", config.recording.output_dir);

    let dispatcher = Arc::new(Dispatcher::from_config(&config, timezone)?);
    let socket_path = config.server.socket_path.clone();
    let listener = bind_socket(&socket_path)?;
    log::info!("Listening on {:?}", socket_path);

    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => {
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(socket, dispatcher).await {
                            log::error!("Connection error: {:#}", e);
                        }
                    });
                }
                Err(e) => log::error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received SIGINT");
                break;
            }
            _ = terminate.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
        }
    }

    dispatcher.shutdown(SHUTDOWN_WAIT).await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        log::warn!("Failed to remove socket {:?}: {}", socket_path, e);
    }
    log::info!("streamrec-daemon stopped");
    Ok(())
}

fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {:?}", path))?;

    // Set socket permissions to allow all users to connect
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(path, perms)?;
    Ok(listener)
}

/// One JSON request per line, one JSON response per line.
async fn serve(socket: UnixStream, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    if let Ok(cred) = socket.peer_cred() {
        log::debug!("Client connected (uid {})", cred.uid());
    }

    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                log::debug!("Received request: {:?}", req);
                dispatcher.handle(req).await
            }
            Err(e) => {
                log::warn!("Failed to deserialize request: {}", e);
                Response::Error(format!("Bad request: {}", e))
            }
        };

        let mut bytes = serde_json::to_vec(&resp).context("Failed to encode response")?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
    }
    Ok(())
}

fn setup_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let log_file = logging.log_file();
    let engine_log_file = logging.engine_log_file();
    for file in [&log_file, &engine_log_file] {
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(logging.level_filter());

    // Main log: everything except encoder output
    let main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "engine_output")
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_file)?);

    // Engine log: encoder output only
    let engine_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() == "engine_output")
        .chain(fern::log_file(&engine_log_file)?);

    base_config
        .chain(main_log)
        .chain(engine_log)
        .apply()?;

    Ok(())
}
