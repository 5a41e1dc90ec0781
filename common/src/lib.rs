pub mod chat;
pub mod ipc;
pub mod job;
pub mod schedule;

pub use chat::{Action, Message, MessageRef};
pub use ipc::{Request, Response};
pub use job::{JobRequest, JobStatus, RequesterId};
pub use schedule::{calculate_schedule, local_now, parse_time, parse_timezone, Window};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/streamrec/streamrec.sock";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/streamrec/config.yaml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/streamrec/daemon.log";
pub const DEFAULT_ENGINE_LOG_FILE: &str = "/var/log/streamrec/engine.log";
pub const DEFAULT_RECORDING_DIR: &str = "/var/lib/streamrec/recordings";
pub const DEFAULT_DELIVERY_DIR: &str = "/var/lib/streamrec/delivered";

// Fallback paths for non-root users
pub const USER_SOCKET_PATH: &str = "/tmp/streamrec.sock";
pub const USER_CONFIG_PATH: &str = "~/.config/streamrec/config.yaml";
pub const USER_LOG_FILE: &str = "streamrec-daemon.log";
pub const USER_ENGINE_LOG_FILE: &str = "streamrec-engine.log";
pub const USER_RECORDING_DIR: &str = "recordings";
pub const USER_DELIVERY_DIR: &str = "delivered";
