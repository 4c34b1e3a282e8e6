//! Datagram engine behavior over the simulated dispatcher: completion
//! ordering and exactly-once delivery, watermark admission, deadlines,
//! shutdown and close sequencing, and compression round-trips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::options::{BindOptions, ReceiveOptions, SendOptions, ShutdownMode, SocketOptions};
use outrigger_core::transport::{Direction, Token};
use outrigger_engine::compress::{
    Compression, CompressionContext, CompressionType, DeflateOptions, InflateOptions,
};
use outrigger_engine::driver::Driver;
use outrigger_engine::event::{
    CompletionKind, ReceiveEvent, SendEvent, ShutdownEventKind, WriteQueueEvent,
};
use outrigger_engine::session::DatagramSocketSession;
use outrigger_engine::DatagramSocket;
use outrigger_sim::{Machine, SimDriver};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn new_driver() -> Arc<SimDriver> {
    SimDriver::new(Machine::new(), 2)
}

fn bound_socket(driver: &Arc<SimDriver>, options: SocketOptions) -> (Arc<DatagramSocket>, Endpoint) {
    let socket = DatagramSocket::new(Arc::clone(driver) as Arc<dyn Driver>, options);
    let (tx, rx) = flume::bounded(1);
    socket
        .bind(
            &Endpoint::loopback_v4(0),
            &BindOptions::new(),
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        )
        .unwrap();
    let endpoint = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    (socket, endpoint)
}

#[test]
fn test_send_receive_roundtrip() {
    let driver = new_driver();
    let (client, client_endpoint) = bound_socket(&driver, SocketOptions::default());
    let (server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    let (sent_tx, sent_rx) = flume::bounded::<SendEvent>(1);
    client
        .send(
            Bytes::from_static(b"over the water"),
            &SendOptions::new().with_endpoint(server_endpoint),
            Some(Box::new(move |event| {
                sent_tx.send(event).unwrap();
            })),
        )
        .unwrap();

    let sent = sent_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sent.kind, CompletionKind::Complete);
    assert_eq!(sent.context.bytes_sent, 14);

    let (recv_tx, recv_rx) = flume::bounded::<ReceiveEvent>(1);
    server
        .receive(
            &ReceiveOptions::new(),
            Box::new(move |event| {
                recv_tx.send(event).unwrap();
            }),
        )
        .unwrap();

    let received = recv_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(received.kind, CompletionKind::Complete);
    assert_eq!(received.data.as_deref(), Some(&b"over the water"[..]));
    assert_eq!(received.context.endpoint, Some(client_endpoint));

    driver.stop();
}

#[test]
fn test_send_completions_preserve_enqueue_order() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());
    let (_server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    let (tx, rx) = flume::unbounded::<u64>();
    for index in 0..32u64 {
        let tx = tx.clone();
        client
            .send(
                Bytes::from(vec![index as u8; 16]),
                &SendOptions::new().with_endpoint(server_endpoint.clone()),
                Some(Box::new(move |event| {
                    assert_eq!(event.kind, CompletionKind::Complete);
                    tx.send(index).unwrap();
                })),
            )
            .unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..32 {
        order.push(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    }
    assert_eq!(order, (0..32).collect::<Vec<_>>());

    driver.stop();
}

#[test]
fn test_each_send_completes_exactly_once() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());
    let (_server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    let (tx, rx) = flume::unbounded::<()>();
    for _ in 0..8 {
        let tx = tx.clone();
        client
            .send(
                Bytes::from_static(b"once"),
                &SendOptions::new().with_endpoint(server_endpoint.clone()),
                Some(Box::new(move |_event| {
                    tx.send(()).unwrap();
                })),
            )
            .unwrap();
    }
    drop(tx);

    let mut completions = 0;
    while rx.recv_timeout(RECV_TIMEOUT).is_ok() {
        completions += 1;
        if completions == 8 {
            break;
        }
    }
    assert_eq!(completions, 8);

    // No further completions trickle in afterwards.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    driver.stop();
}

#[test]
fn test_oversized_datagram_rejected() {
    let driver = new_driver();
    let options = SocketOptions::default().with_max_datagram_size(32);
    let (client, _) = bound_socket(&driver, options);
    let (_server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    let result = client.send(
        Bytes::from(vec![0u8; 33]),
        &SendOptions::new().with_endpoint(server_endpoint),
        None,
    );
    assert_eq!(result, Err(Error::Invalid));

    driver.stop();
}

/// Captures write queue high-watermark announcements.
struct WatermarkSession {
    high: flume::Sender<WriteQueueEvent>,
}

impl DatagramSocketSession for WatermarkSession {
    fn process_write_queue_high_watermark(
        &self,
        _socket: &Arc<DatagramSocket>,
        event: &WriteQueueEvent,
    ) {
        self.high.send(*event).unwrap();
    }
}

#[test]
fn test_high_watermark_rejection_announces_once() {
    let driver = new_driver();

    // A 16-byte session send buffer keeps the first submission parked in
    // the dispatcher, so the write queue stays above its high watermark.
    let options = SocketOptions::default()
        .with_send_buffer_size(16)
        .with_write_queue_high_watermark(16);
    let (client, _) = bound_socket(&driver, options);
    let (_server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    let (high_tx, high_rx) = flume::unbounded();
    client.register_session(
        Arc::new(WatermarkSession { high: high_tx }),
        None,
    );

    // Admitted: the queue is empty, so the mark is not yet violated.
    client
        .send(
            Bytes::from(vec![1u8; 64]),
            &SendOptions::new().with_endpoint(server_endpoint.clone()),
            None,
        )
        .unwrap();

    // Rejected, with exactly one high-watermark announcement.
    let result = client.send(
        Bytes::from(vec![2u8; 8]),
        &SendOptions::new().with_endpoint(server_endpoint.clone()),
        None,
    );
    assert_eq!(result, Err(Error::WouldBlock));
    assert!(high_rx.recv_timeout(RECV_TIMEOUT).is_ok());

    let result = client.send(
        Bytes::from(vec![3u8; 8]),
        &SendOptions::new().with_endpoint(server_endpoint),
        None,
    );
    assert_eq!(result, Err(Error::WouldBlock));
    assert!(high_rx.recv_timeout(Duration::from_millis(200)).is_err());

    driver.stop();
}

#[test]
fn test_send_high_watermark_override() {
    let driver = new_driver();
    let options = SocketOptions::default()
        .with_send_buffer_size(16)
        .with_write_queue_high_watermark(1024);
    let (client, _) = bound_socket(&driver, options);
    let (_server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    client
        .send(
            Bytes::from(vec![1u8; 64]),
            &SendOptions::new().with_endpoint(server_endpoint.clone()),
            None,
        )
        .unwrap();

    // The configured mark admits this, but the per-request override does
    // not.
    let result = client.send(
        Bytes::from(vec![2u8; 8]),
        &SendOptions::new()
            .with_endpoint(server_endpoint)
            .with_high_watermark(32),
        None,
    );
    assert_eq!(result, Err(Error::WouldBlock));

    driver.stop();
}

#[test]
fn test_receive_deadline_expires_would_block() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());

    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    client
        .receive(
            &ReceiveOptions::new().with_deadline(Instant::now() + Duration::from_millis(50)),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.kind, CompletionKind::Error);
    assert_eq!(event.error, Some(Error::WouldBlock));

    driver.stop();
}

#[test]
fn test_cancel_receive_by_token() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());

    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    client
        .receive(
            &ReceiveOptions::new().with_token(Token(9)),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

    client.cancel_receive(Token(9)).unwrap();
    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.error, Some(Error::Cancelled));

    // The entry is gone; cancelling again is invalid.
    assert_eq!(client.cancel_receive(Token(9)), Err(Error::Invalid));

    driver.stop();
}

#[test]
fn test_pending_receives_get_eof_on_shutdown() {
    let driver = new_driver();
    let options = SocketOptions::default().with_keep_half_open(true);
    let (client, _) = bound_socket(&driver, options);

    let (tx, rx) = flume::unbounded::<ReceiveEvent>();
    for _ in 0..2 {
        let tx = tx.clone();
        client
            .receive(
                &ReceiveOptions::new(),
                Box::new(move |event| {
                    tx.send(event).unwrap();
                }),
            )
            .unwrap();
    }

    client
        .shutdown(Direction::Receive, ShutdownMode::Immediate)
        .unwrap();

    for _ in 0..2 {
        let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(event.error, Some(Error::Eof));
    }

    // Receives after shutdown-receive fail synchronously.
    let result = client.receive(&ReceiveOptions::new(), Box::new(|_| {}));
    assert_eq!(result.err(), Some(Error::Eof));

    driver.stop();
}

/// Counts shutdown stage announcements.
struct ShutdownSession {
    events: flume::Sender<ShutdownEventKind>,
}

impl DatagramSocketSession for ShutdownSession {
    fn process_shutdown(
        &self,
        _socket: &Arc<DatagramSocket>,
        event: &outrigger_engine::event::ShutdownEvent,
    ) {
        self.events.send(event.kind).unwrap();
    }
}

#[test]
fn test_shutdown_send_is_idempotent() {
    let driver = new_driver();
    let options = SocketOptions::default().with_keep_half_open(true);
    let (client, _) = bound_socket(&driver, options);

    let (tx, rx) = flume::unbounded();
    client.register_session(Arc::new(ShutdownSession { events: tx }), None);

    client
        .shutdown(Direction::Send, ShutdownMode::Immediate)
        .unwrap();
    client
        .shutdown(Direction::Send, ShutdownMode::Immediate)
        .unwrap();

    let mut send_events = 0;
    while let Ok(kind) = rx.recv_timeout(Duration::from_millis(300)) {
        if kind == ShutdownEventKind::Send {
            send_events += 1;
        }
    }
    assert_eq!(send_events, 1);

    driver.stop();
}

#[test]
fn test_close_is_idempotent_and_second_close_is_synchronous() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());

    let (tx, rx) = flume::bounded(1);
    client.close(Box::new(move || {
        tx.send(()).unwrap();
    }));
    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // The socket is fully closed; the second close completes before the
    // call returns.
    let synchronous = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&synchronous);
    client.close(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));
    assert!(synchronous.load(Ordering::SeqCst));

    driver.stop();
}

#[test]
fn test_release_surrenders_handle() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());
    let handle = client.handle().unwrap();

    let (tx, rx) = flume::bounded::<Result<outrigger_core::transport::Handle>>(1);
    client
        .release(Box::new(move |result| {
            tx.send(result).unwrap();
        }))
        .unwrap();

    let released = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(released, handle);

    driver.stop();
}

#[test]
fn test_connect_rejects_any_address_and_port_zero() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());

    assert_eq!(
        client.connect(&Endpoint::any_v4(49152), Box::new(|_| {})),
        Err(Error::Invalid)
    );
    assert_eq!(
        client.connect(&Endpoint::loopback_v4(0), Box::new(|_| {})),
        Err(Error::Invalid)
    );

    driver.stop();
}

/// Run-length codec exercising the deflate/inflate hooks.
struct RleCodec;

impl Compression for RleCodec {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Rle
    }

    fn deflate(
        &self,
        context: &mut CompressionContext,
        output: &mut BytesMut,
        input: &[u8],
        _options: &DeflateOptions,
    ) -> outrigger_core::error::Result<()> {
        let before = output.len();
        let mut index = 0;
        while index < input.len() {
            let byte = input[index];
            let mut run = 1usize;
            while index + run < input.len() && input[index + run] == byte && run < 255 {
                run += 1;
            }
            output.put_u8(run as u8);
            output.put_u8(byte);
            index += run;
        }
        context.compression_type = CompressionType::Rle;
        context.bytes_read = input.len();
        context.bytes_written = output.len() - before;
        Ok(())
    }

    fn inflate(
        &self,
        context: &mut CompressionContext,
        output: &mut BytesMut,
        input: &[u8],
        _options: &InflateOptions,
    ) -> outrigger_core::error::Result<()> {
        if input.len() % 2 != 0 {
            return Err(Error::Invalid);
        }
        let before = output.len();
        for pair in input.chunks_exact(2) {
            let run = pair[0] as usize;
            if run == 0 {
                return Err(Error::Invalid);
            }
            for _ in 0..run {
                output.put_u8(pair[1]);
            }
        }
        context.compression_type = CompressionType::Rle;
        context.bytes_read = input.len();
        context.bytes_written = output.len() - before;
        Ok(())
    }
}

#[test]
fn test_compression_roundtrip() {
    let driver = new_driver();
    let (client, _) = bound_socket(&driver, SocketOptions::default());
    let (server, server_endpoint) = bound_socket(&driver, SocketOptions::default());

    client.register_compression(Arc::new(RleCodec));
    server.register_compression(Arc::new(RleCodec));

    let payload = Bytes::from_static(b"aaaabbbccd");
    client
        .send(
            payload.clone(),
            &SendOptions::new().with_endpoint(server_endpoint),
            None,
        )
        .unwrap();

    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    server
        .receive(
            &ReceiveOptions::new(),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.kind, CompletionKind::Complete);
    assert_eq!(event.data, Some(payload));
    let compression = event.context.compression.expect("inflate context");
    assert_eq!(compression.compression_type, CompressionType::Rle);
    assert_eq!(compression.bytes_written, 10);

    driver.stop();
}
