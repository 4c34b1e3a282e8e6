//! # Outrigger Sim
//!
//! **Deterministic in-process network for Outrigger.**
//!
//! This crate provides a simulated machine with observable socket
//! behavior identical to the operating system's: handle allocation, port
//! binding, message buffering, backpressure, and connection state. Tests
//! drive it one [`Machine::step`] at a time or let a background thread
//! step it, and a [`SimDriver`] exposes it to the engine crate as a
//! dispatcher.
//!
//! ```rust
//! use outrigger_core::endpoint::Endpoint;
//! use outrigger_core::transport::Transport;
//! use outrigger_sim::Machine;
//!
//! let machine = Machine::new();
//! let session = machine.create_session();
//! session.open(Transport::Udp4).unwrap();
//! session.bind(&Endpoint::loopback_v4(0), false).unwrap();
//! assert_eq!(session.source_endpoint().unwrap().port(), Some(49152));
//! session.close().unwrap();
//! ```

#![deny(unsafe_code)]
// Allow some pedantic lints
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::significant_drop_tightening)]

pub mod driver;
pub mod machine;
pub mod monitor;

pub use driver::SimDriver;
pub use machine::{find_machine, register_machine, unregister_machine, Machine, Packet, Session};
pub use monitor::{Interest, Monitor, MonitorEvent};
