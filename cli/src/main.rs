use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use common::{Action, JobStatus, Message, Request, RequesterId, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about = "Chat with the streamrec daemon", long_about = None)]
struct Cli {
    /// Requester id the daemon tracks conversations and jobs under
    #[arg(short, long, env = "STREAMREC_USER")]
    user: Option<String>,
    /// Daemon socket
    #[arg(short, long, env = "STREAMREC_SOCKET")]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the main menu (/start)
    Menu,
    /// Press an inline button: new-recording, cancel-job, status, confirm, cancel-conversation
    Press {
        action: Action,
    },
    /// Send free text (URL or HH:MM)
    Say {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Cancel the scheduled or running job (/cancel)
    Cancel,
    /// Show the current job state
    Status,
    /// Show every message addressed to you
    Inbox,
    /// Dump daemon metrics in Prometheus format
    Metrics,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(path: &PathBuf) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon at {:?}", path))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn call(&mut self, req: &Request) -> anyhow::Result<Response> {
        let mut bytes = serde_json::to_vec(req)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;

        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("Daemon closed the connection"))?;
        log::debug!("Response: {}", line);
        Ok(serde_json::from_str(&line)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let user = RequesterId(
        cli.user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "local".to_string()),
    );
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);
    let mut conn = Connection::open(&socket_path).await?;

    let req = match cli.command {
        Commands::Menu => Request::Menu(user.clone()),
        Commands::Press { action } => Request::Press(user.clone(), action),
        Commands::Say { text } => Request::Say(user.clone(), text.join(" ")),
        Commands::Cancel => Request::Cancel(user.clone()),
        Commands::Status => Request::Status(user.clone()),
        Commands::Inbox => Request::Inbox(user.clone()),
        Commands::Metrics => Request::Metrics,
    };
    let chatty = matches!(
        req,
        Request::Menu(_) | Request::Press(..) | Request::Say(..) | Request::Cancel(_)
    );

    let since = Utc::now();
    match conn.call(&req).await? {
        Response::Ok => {}
        Response::Notice(text) => println!("! {}", text),
        Response::Error(e) => eprintln!("Error: {}", e),
        Response::Inbox(messages) => print_inbox(&messages),
        Response::Status(status) => print_status(&status),
        Response::Metrics(text) => print!("{}", text),
    }

    // show what the daemon said back in the chat
    if chatty {
        if let Response::Inbox(messages) = conn.call(&Request::Inbox(user)).await? {
            for message in messages.iter().filter(|m| m.updated_at >= since) {
                print_message(message);
            }
        }
    }

    Ok(())
}

fn default_socket_path() -> PathBuf {
    let system = PathBuf::from(common::DEFAULT_SOCKET_PATH);
    if system.exists() {
        system
    } else {
        PathBuf::from(common::USER_SOCKET_PATH)
    }
}

fn print_message(message: &Message) {
    println!("---- {}", message.id);
    println!("{}", message.text);
    if let Some(path) = &message.attachment {
        println!("[file] {}", path.display());
    }
    if !message.actions.is_empty() {
        let buttons: Vec<String> = message
            .actions
            .iter()
            .map(|a| format!("[{}: {}]", a.label(), a.key()))
            .collect();
        println!("{}", buttons.join(" "));
    }
}

fn print_inbox(messages: &[Message]) {
    if messages.is_empty() {
        println!("No messages.");
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Time", "Message", "Actions", "File"]);
    for message in messages {
        let local: DateTime<Local> = message.updated_at.into();
        let actions: Vec<&str> = message.actions.iter().map(|a| a.key()).collect();
        table.add_row(vec![
            message.id.to_string(),
            local.format("%d/%m %H:%M:%S").to_string(),
            message.text.clone(),
            actions.join(", "),
            message
                .attachment
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ]);
    }
    println!("{table}");
}

fn print_status(status: &JobStatus) {
    match status {
        JobStatus::Idle => println!("No active recordings"),
        JobStatus::Scheduled { start, end } => {
            println!("Job scheduled, waiting to start");
            println!("  Start: {}", start.format("%d/%m/%Y %H:%M"));
            println!("  End:   {}", end.format("%d/%m/%Y %H:%M"));
        }
        JobStatus::Recording { elapsed_secs } => {
            println!("Recording in progress");
            println!("  Elapsed: {} min", (elapsed_secs + 30) / 60);
        }
    }
}
