//! # Outrigger Engine
//!
//! **Internal state-machine crate for Outrigger.**
//!
//! This crate provides the per-socket execution engines and the
//! collaborator interfaces they consume. For application development, use
//! the `outrigger` crate, which re-exports the supported surface.
//!
//! ## Engines
//!
//! - **`DatagramSocket`**: connectionless sockets with queued sends,
//!   matched receives, watermarks, rate limiting, and shutdown sequencing
//! - **`StreamSocket`**: connection-oriented sockets adding connect
//!   retries, byte-stream framing, and security upgrade/downgrade
//! - **`ListenerSocket`**: passive sockets producing connected streams
//!
//! ## Collaborators (consumed via traits)
//!
//! - **`Driver`**: the event demultiplexer (proactor) and handle factory
//! - **`Resolver`**: asynchronous name-to-endpoint service
//! - **`Compression`** / **`Encryption`**: payload transform capabilities
//! - **`*Session`** / **`*Manager`**: per-socket and per-fleet observers

#![deny(unsafe_code)]
// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::significant_drop_tightening)]

pub mod compress;
pub mod datagram;
pub mod driver;
pub mod encrypt;
pub mod event;
pub mod listener;
pub mod resolver;
pub mod session;
pub mod stream;

// Re-export socket types for clean API
pub use datagram::DatagramSocket;
pub use listener::ListenerSocket;
pub use stream::StreamSocket;

/// Prelude module for convenient imports
///
/// ```rust
/// use outrigger_engine::prelude::*;
/// ```
pub mod prelude {
    pub use crate::compress::{Compression, CompressionContext, CompressionType};
    pub use crate::driver::{Driver, DriverSocket, ReceivedData, SocketFactory};
    pub use crate::encrypt::Encryption;
    pub use crate::event::{
        CompletionKind, ConnectEvent, ReceiveEvent, SendEvent, ShutdownEvent, ShutdownEventKind,
    };
    pub use crate::resolver::{MapResolver, Resolver, ResolverContext};
    pub use crate::session::{
        DatagramSocketManager, DatagramSocketSession, ListenerSocketManager,
        ListenerSocketSession, StreamSocketManager, StreamSocketSession,
    };
    pub use crate::{DatagramSocket, ListenerSocket, StreamSocket};
    pub use bytes::Bytes;
}
