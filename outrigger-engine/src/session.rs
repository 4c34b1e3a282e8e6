//! Session and manager interfaces.
//!
//! A session observes the events of one socket; a manager observes the
//! lifecycle of many. Every method defaults to a no-op so implementations
//! subscribe only to what they care about. Sessions and managers never
//! store the socket: the socket owns them, and they reach back only
//! through the reference passed at each event.

use std::sync::Arc;

use crate::datagram::DatagramSocket;
use crate::event::{ErrorEvent, ReadQueueEvent, ShutdownEvent, WriteQueueEvent};
use crate::listener::ListenerSocket;
use crate::stream::StreamSocket;

macro_rules! queue_and_lifecycle_events {
    ($socket:ty) => {
        /// Read queue flow control was relaxed.
        fn process_read_queue_flow_control_relaxed(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// Read queue flow control was applied.
        fn process_read_queue_flow_control_applied(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// The read queue drained to its low watermark.
        fn process_read_queue_low_watermark(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// The read queue exceeded its high watermark.
        fn process_read_queue_high_watermark(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// Buffered inbound data was discarded during shutdown.
        fn process_read_queue_discarded(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// The receive rate limiter closed admission.
        fn process_read_queue_rate_limit_applied(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// The receive rate limiter reopened admission.
        fn process_read_queue_rate_limit_relaxed(
            &self,
            _socket: &Arc<$socket>,
            _event: &ReadQueueEvent,
        ) {
        }

        /// Write queue flow control was relaxed.
        fn process_write_queue_flow_control_relaxed(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// Write queue flow control was applied.
        fn process_write_queue_flow_control_applied(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// The write queue drained to its low watermark.
        fn process_write_queue_low_watermark(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// The write queue exceeded its high watermark.
        fn process_write_queue_high_watermark(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// Queued outbound data was discarded during shutdown.
        fn process_write_queue_discarded(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// The send rate limiter closed admission.
        fn process_write_queue_rate_limit_applied(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// The send rate limiter reopened admission.
        fn process_write_queue_rate_limit_relaxed(
            &self,
            _socket: &Arc<$socket>,
            _event: &WriteQueueEvent,
        ) {
        }

        /// A shutdown stage was reached.
        fn process_shutdown(&self, _socket: &Arc<$socket>, _event: &ShutdownEvent) {}

        /// The transport failed.
        fn process_error(&self, _socket: &Arc<$socket>, _event: &ErrorEvent) {}
    };
}

/// Observer of one datagram socket's events.
pub trait DatagramSocketSession: Send + Sync {
    queue_and_lifecycle_events!(DatagramSocket);
}

/// Observer of one stream socket's events.
pub trait StreamSocketSession: Send + Sync {
    queue_and_lifecycle_events!(StreamSocket);

    /// A security upgrade completed and records are now encrypted.
    fn process_upgrade_complete(&self, _socket: &Arc<StreamSocket>) {}

    /// A security downgrade completed and records are now cleartext.
    fn process_downgrade_complete(&self, _socket: &Arc<StreamSocket>) {}
}

/// Observer of one listener socket's events.
pub trait ListenerSocketSession: Send + Sync {
    /// A shutdown stage was reached.
    fn process_shutdown(&self, _socket: &Arc<ListenerSocket>, _event: &ShutdownEvent) {}

    /// The transport failed.
    fn process_error(&self, _socket: &Arc<ListenerSocket>, _event: &ErrorEvent) {}
}

/// Observer of datagram socket lifecycles.
pub trait DatagramSocketManager: Send + Sync {
    /// The socket is open and attached to its dispatcher.
    fn process_socket_established(&self, _socket: &Arc<DatagramSocket>) {}

    /// The socket has fully shut down and detached.
    fn process_socket_closed(&self, _socket: &Arc<DatagramSocket>) {}
}

/// Observer of stream socket lifecycles.
pub trait StreamSocketManager: Send + Sync {
    /// The socket is connected and attached to its dispatcher.
    fn process_socket_established(&self, _socket: &Arc<StreamSocket>) {}

    /// The socket has fully shut down and detached.
    fn process_socket_closed(&self, _socket: &Arc<StreamSocket>) {}
}

/// Observer of listener socket lifecycles.
pub trait ListenerSocketManager: Send + Sync {
    /// The listener is open and attached to its dispatcher.
    fn process_socket_established(&self, _socket: &Arc<ListenerSocket>) {}

    /// The listener has fully shut down and detached.
    fn process_socket_closed(&self, _socket: &Arc<ListenerSocket>) {}

    /// The configured connection limit was reached; accepts are paused
    /// until an accepted socket closes.
    fn process_socket_limit(&self, _socket: &Arc<ListenerSocket>) {}
}
