//! Outrigger Core
//!
//! This crate contains the runtime-agnostic core building blocks:
//! - Error kinds shared by every operation (`error`)
//! - Endpoints, transports, handles, and tokens (`endpoint`, `transport`)
//! - Socket and per-operation options (`options`)
//! - Send/receive queues with watermark latches (`queue`)
//! - Flow-control, shutdown, and detach state machines (`flow`, `shutdown`,
//!   `detach`)
//! - Strands, executors, and the event announcement rule (`strand`,
//!   `dispatch`)
//! - Deadline timers (`timer`) and rate limiting (`limiter`)
//! - Journaled logging (`log`) and printf-compatible formatting (`fmt`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod detach;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod fmt;
pub mod limiter;
pub mod log;
pub mod options;
pub mod queue;
pub mod shutdown;
pub mod strand;
pub mod timer;
pub mod transport;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Error, Result};
    pub use crate::flow::{FlowControlContext, FlowControlState};
    pub use crate::options::{
        BindOptions, ConnectOptions, ReceiveOptions, SendOptions, ShutdownMode, ShutdownOptions,
        SocketOptions,
    };
    pub use crate::queue::{QueueContext, ReadQueue, WriteQueue};
    pub use crate::shutdown::{ShutdownContext, ShutdownOrigin, ShutdownState};
    pub use crate::strand::{Executor, Functor, Strand};
    pub use crate::transport::{Direction, Handle, Token, Transport, TransportMode};
}
