//! courier - framed TCP messaging with chunked file and audio transfer
//!
//! The server accepts connections, authenticates users, routes direct
//! messages, and reassembles uploads one transfer at a time per connection.
//! The client side offers acknowledged uploads with retry and deduplicated
//! downloads over the same framed protocol.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod store;
pub mod temp_file;

pub use client::{Client, ClientEvent, OutboundTransfer, PayloadSource};
pub use config::{ClientConfig, Config, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{Frame, FrameKind};
pub use server::{Server, ServerState};
pub use store::{MediaKind, MemoryStore, Store};
