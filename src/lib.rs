//! Headless core of the LUMI chat client: streaming consumption of a hosted
//! chat-completion API, session reconciliation, and local persistence.
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod retry;
pub mod session;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use client::{OpenRouterClient, StreamEvent};
pub use config::Config;
pub use error::Error;
pub use session::{Notice, SendOutcome, SessionManager, StopHandle};
pub use storage::{ChatStore, FileStore, MemoryStore, StorageBackend};
pub use types::{ChatMessage, ChatRequest, Conversation, Message, Role, Session, Theme};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
