//! # Outrigger
//!
//! An asynchronous network I/O toolkit: per-socket state machines driven
//! by an event-demultiplexing dispatcher, together with a deterministic
//! in-process network for testing.
//!
//! ## Architecture
//!
//! Outrigger is structured as a **socket execution engine** with clean
//! layering:
//!
//! - **`outrigger-core`**: queues, watermarks, flow-control / shutdown /
//!   detach state, strands, timers, rate limiting, journaled logging
//! - **`outrigger-engine`**: the datagram, stream, and listener state
//!   machines and the collaborator interfaces they consume
//! - **`outrigger-sim`**: the simulated machine, readiness monitor, and a
//!   dispatcher implementation over them (feature `sim`)
//! - **`outrigger`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use outrigger::prelude::*;
//! use outrigger_sim::{Machine, SimDriver};
//!
//! // A deterministic dispatcher over the simulated network.
//! let driver = SimDriver::new(Machine::new(), 2);
//!
//! // Open and bind a datagram socket.
//! let socket = DatagramSocket::new(driver.clone() as Arc<dyn Driver>, SocketOptions::default());
//! let (tx, rx) = flume::bounded(1);
//! socket
//!     .bind(
//!         &Endpoint::loopback_v4(0),
//!         &BindOptions::new(),
//!         Box::new(move |result| {
//!             tx.send(result).unwrap();
//!         }),
//!     )
//!     .unwrap();
//! let endpoint = rx.recv().unwrap().unwrap();
//! assert_eq!(endpoint.port(), Some(49152));
//!
//! driver.stop();
//! ```
//!
//! ## Design
//!
//! - **Callback completions**: every asynchronous operation either fails
//!   synchronously or schedules exactly one completion callback
//! - **Watermarks**: byte-based queue thresholds announce one event per
//!   crossing
//! - **Deterministic testing**: the simulated machine steps explicitly,
//!   so handle and port allocation, buffering, and backpressure are
//!   reproducible run to run

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

// Re-export core types
pub use bytes::Bytes;
pub use outrigger_core::endpoint::Endpoint;
pub use outrigger_core::error::{Error, Result};
pub use outrigger_core::limiter::{RateLimiter, TokenBucket};
pub use outrigger_core::options::{
    AcceptOptions, BindOptions, ConnectOptions, ReceiveOptions, SendOptions, ShutdownMode,
    ShutdownOptions, SocketOptions,
};
pub use outrigger_core::strand::{Executor, Strand};
pub use outrigger_core::transport::{Direction, Handle, Token, Transport, TransportMode};

// Engine surface
pub use outrigger_engine::compress::{Compression, CompressionContext, CompressionType};
pub use outrigger_engine::driver::{Driver, DriverSocket, SocketFactory};
pub use outrigger_engine::encrypt::Encryption;
pub use outrigger_engine::resolver::{MapResolver, Resolver, ResolverContext};
pub use outrigger_engine::{DatagramSocket, ListenerSocket, StreamSocket};

// Simulated network (opt-in via feature)
#[cfg(feature = "sim")]
pub use outrigger_sim as sim;

/// Development helpers (benches/tests)
pub mod dev_tracing;

/// Prelude module for convenient imports
///
/// ```rust
/// use outrigger::prelude::*;
/// ```
pub mod prelude {
    pub use outrigger_core::endpoint::Endpoint;
    pub use outrigger_core::error::{Error, Result};
    pub use outrigger_core::options::{
        AcceptOptions, BindOptions, ConnectOptions, ReceiveOptions, SendOptions, ShutdownMode,
        SocketOptions,
    };
    pub use outrigger_core::transport::{Direction, Handle, Token, Transport};
    pub use outrigger_engine::driver::Driver;
    pub use outrigger_engine::session::{
        DatagramSocketManager, DatagramSocketSession, ListenerSocketManager,
        ListenerSocketSession, StreamSocketManager, StreamSocketSession,
    };
    pub use outrigger_engine::{DatagramSocket, ListenerSocket, StreamSocket};
    pub use bytes::Bytes;
}
