//! promptd: the background render daemon
//!
//! - `protocol`: message framing and serialization (length-prefixed bincode)
//! - `server`: Unix socket server, accept loop and administrative requests
//! - `render`: the streaming, cancelling render coordinator
//! - `session`: shell session table with OS-driven exit detection
//! - `cache` / `text_cache`: session-partitioned value cache
//! - `config_cache` / `watcher`: parsed configurations and their invalidation
//! - `lock`: single-instance lock with stale-lock recovery
//! - `client`: thin client used by the `prompt` binary

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod config_cache;
pub mod lock;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod render;
pub mod server;
pub mod session;
pub mod text_cache;
pub mod watcher;

pub use cache::{CacheStrategy, MemoryCache};
pub use cancel::CancelToken;
pub use client::{auto_start_daemon, extract_prompts, session_id_for, Client, PromptResult};
pub use config::DaemonSettings;
pub use config_cache::ConfigCache;
pub use lock::LockFile;
pub use paths::DaemonPaths;
pub use protocol::{
    decode_message, encode_message, read_message, write_message, Message, PromptRequest,
    PromptResponse, RenderFlags, ResponseType, PROTOCOL_VERSION,
};
pub use render::Coordinator;
pub use server::Daemon;
pub use session::SessionManager;
