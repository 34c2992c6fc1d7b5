//! Herald Network Library
//!
//! Serves the lock arbiter to dashboards and consoles over TCP.
//!
//! # Architecture
//!
//! - **Server**: Runs next to the arbiter, one connection per console
//! - **Client**: Request/reply calls plus pushed snapshots and preemption notices
//! - **VoiceSession**: Live microphone broadcast with chime and heartbeats
//! - **Protocol**: Length-prefixed JSON messages
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(&config.server, arbiter.clone()).await?;
//!
//! let client = Arc::new(Client::connect(server.addr(), "front-desk").await?);
//! let session = VoiceSession::start(client.clone(), &zones, (&config.timing).into()).await?;
//! session.wait_ended().await;
//! ```

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{Client, ConnectionState, ServerEvent};
pub use error::{Error, Result};
pub use frame::MAX_FRAME_SIZE;
pub use protocol::{Message, Rejection};
pub use server::Server;
pub use session::{SessionState, SessionTiming, VoiceSession};

/// Default port for Herald servers
pub const DEFAULT_PORT: u16 = herald_core::config::DEFAULT_PORT;
