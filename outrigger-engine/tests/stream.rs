//! Stream engine behavior over the simulated dispatcher: connect with
//! retries, byte framing, half-close, security upgrade, and listener
//! accept flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::{Error, Result};
use outrigger_core::options::{
    AcceptOptions, BindOptions, ConnectOptions, ReceiveOptions, SendOptions, ShutdownMode,
    SocketOptions,
};
use outrigger_core::transport::Direction;
use outrigger_engine::driver::Driver;
use outrigger_engine::encrypt::Encryption;
use outrigger_engine::event::{CompletionKind, ConnectEvent, ReceiveEvent};
use outrigger_engine::resolver::MapResolver;
use outrigger_engine::{ListenerSocket, StreamSocket};
use outrigger_sim::{Machine, SimDriver};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn new_driver() -> Arc<SimDriver> {
    SimDriver::new(Machine::new(), 2)
}

/// Open a listener and a connected client/server pair.
fn connected_pair(
    driver: &Arc<SimDriver>,
    options: SocketOptions,
) -> (Arc<ListenerSocket>, Arc<StreamSocket>, Arc<StreamSocket>) {
    let listener = ListenerSocket::new(Arc::clone(driver) as Arc<dyn Driver>, options.clone());
    let endpoint = listener
        .listen(&Endpoint::loopback_v4(0), 4, &BindOptions::new())
        .unwrap();

    let (accept_tx, accept_rx) = flume::bounded::<Result<Arc<StreamSocket>>>(1);
    listener
        .accept(
            &AcceptOptions::new(),
            Box::new(move |result| {
                accept_tx.send(result).unwrap();
            }),
        )
        .unwrap();

    let client = StreamSocket::new(Arc::clone(driver) as Arc<dyn Driver>, options);
    let (connect_tx, connect_rx) = flume::bounded::<ConnectEvent>(1);
    client
        .connect(
            &endpoint,
            &ConnectOptions::new(),
            Box::new(move |event| {
                connect_tx.send(event).unwrap();
            }),
        )
        .unwrap();

    let connected = connect_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(connected.kind, CompletionKind::Complete);
    assert_eq!(connected.attempts, 1);

    let server = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    (listener, client, server)
}

fn send_all(socket: &Arc<StreamSocket>, data: &'static [u8]) {
    socket
        .send(Bytes::from_static(data), &SendOptions::new(), None)
        .unwrap();
}

fn receive_exact(socket: &Arc<StreamSocket>, count: usize) -> ReceiveEvent {
    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    socket
        .receive(
            &ReceiveOptions::new().with_min_size(count).with_max_size(count),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap()
}

#[test]
fn test_connect_and_exchange() {
    let driver = new_driver();
    let (listener, client, server) = connected_pair(&driver, SocketOptions::default());

    assert!(client.is_connected());
    assert!(server.is_connected());

    send_all(&client, b"ahoy");
    let event = receive_exact(&server, 4);
    assert_eq!(event.data.as_deref(), Some(&b"ahoy"[..]));

    send_all(&server, b"avast");
    let event = receive_exact(&client, 5);
    assert_eq!(event.data.as_deref(), Some(&b"avast"[..]));

    drop(listener);
    driver.stop();
}

#[test]
fn test_receive_waits_for_minimum() {
    let driver = new_driver();
    let (_listener, client, server) = connected_pair(&driver, SocketOptions::default());

    // The request wants ten bytes; two five-byte sends satisfy it.
    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    server
        .receive(
            &ReceiveOptions::new().with_min_size(10).with_max_size(10),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

    send_all(&client, b"01234");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    send_all(&client, b"56789");
    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.data.as_deref(), Some(&b"0123456789"[..]));

    driver.stop();
}

#[test]
fn test_receive_yields_any_prefix_past_minimum() {
    let driver = new_driver();
    let (_listener, client, server) = connected_pair(&driver, SocketOptions::default());

    send_all(&client, b"abcdef");

    // Six bytes are buffered; each request takes its capped prefix.
    let event = receive_exact(&server, 4);
    assert_eq!(event.data.as_deref(), Some(&b"abcd"[..]));
    let event = receive_exact(&server, 2);
    assert_eq!(event.data.as_deref(), Some(&b"ef"[..]));

    driver.stop();
}

#[test]
fn test_half_close() {
    let driver = new_driver();
    let options = SocketOptions::default().with_keep_half_open(true);
    let (_listener, client, server) = connected_pair(&driver, options);

    send_all(&client, b"C");
    let event = receive_exact(&server, 1);
    assert_eq!(event.data.as_deref(), Some(&b"C"[..]));

    send_all(&server, b"S");
    let event = receive_exact(&client, 1);
    assert_eq!(event.data.as_deref(), Some(&b"S"[..]));

    // Client half-closes; the server's pending receive completes with
    // end-of-file.
    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    server
        .receive(
            &ReceiveOptions::new(),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();
    client
        .shutdown(Direction::Send, ShutdownMode::Graceful)
        .unwrap();

    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.error, Some(Error::Eof));

    // The reverse direction still works, then shuts down symmetrically.
    send_all(&server, b"tail");
    let event = receive_exact(&client, 4);
    assert_eq!(event.data.as_deref(), Some(&b"tail"[..]));

    let (tx, rx) = flume::bounded::<ReceiveEvent>(1);
    client
        .receive(
            &ReceiveOptions::new(),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();
    server
        .shutdown(Direction::Send, ShutdownMode::Graceful)
        .unwrap();
    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.error, Some(Error::Eof));

    // Sends fail on both sides once their send directions are shut.
    assert!(client
        .send(Bytes::from_static(b"x"), &SendOptions::new(), None)
        .is_err());
    assert!(server
        .send(Bytes::from_static(b"x"), &SendOptions::new(), None)
        .is_err());

    driver.stop();
}

#[test]
fn test_connect_retries_exhaust() {
    let driver = new_driver();
    let client = StreamSocket::new(
        Arc::clone(&driver) as Arc<dyn Driver>,
        SocketOptions::default(),
    );

    let (tx, rx) = flume::bounded::<ConnectEvent>(1);
    client
        .connect(
            &Endpoint::loopback_v4(49999),
            &ConnectOptions::new()
                .with_retry_count(2)
                .with_retry_interval(Duration::from_millis(20)),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.kind, CompletionKind::Error);
    assert_eq!(event.attempts, 3);
    assert_eq!(event.error, Some(Error::Transport));
    assert!(!client.is_connected());

    driver.stop();
}

#[test]
fn test_connect_by_name() {
    let driver = new_driver();
    let options = SocketOptions::default();

    let listener = ListenerSocket::new(Arc::clone(&driver) as Arc<dyn Driver>, options.clone());
    let endpoint = listener
        .listen(&Endpoint::loopback_v4(0), 4, &BindOptions::new())
        .unwrap();
    listener
        .accept(&AcceptOptions::new(), Box::new(|_result| {}))
        .unwrap();

    let resolver = Arc::new(MapResolver::new());
    resolver.insert("echo-service", endpoint);

    let client = StreamSocket::new(Arc::clone(&driver) as Arc<dyn Driver>, options);
    client.register_resolver(resolver);

    let (tx, rx) = flume::bounded::<ConnectEvent>(1);
    client
        .connect_name(
            "echo-service",
            &ConnectOptions::new(),
            Box::new(move |event| {
                tx.send(event).unwrap();
            }),
        )
        .unwrap();

    let event = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(event.kind, CompletionKind::Complete);
    assert!(client.is_connected());

    driver.stop();
}

#[test]
fn test_listener_accepts_multiple_connections() {
    let driver = new_driver();
    let options = SocketOptions::default();
    let listener = ListenerSocket::new(Arc::clone(&driver) as Arc<dyn Driver>, options.clone());
    let endpoint = listener
        .listen(&Endpoint::loopback_v4(0), 4, &BindOptions::new())
        .unwrap();

    let (accept_tx, accept_rx) = flume::unbounded::<Result<Arc<StreamSocket>>>();
    for _ in 0..3 {
        let accept_tx = accept_tx.clone();
        listener
            .accept(
                &AcceptOptions::new(),
                Box::new(move |result| {
                    accept_tx.send(result).unwrap();
                }),
            )
            .unwrap();
    }

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = StreamSocket::new(
            Arc::clone(&driver) as Arc<dyn Driver>,
            options.clone(),
        );
        let (tx, rx) = flume::bounded::<ConnectEvent>(1);
        client
            .connect(
                &endpoint,
                &ConnectOptions::new(),
                Box::new(move |event| {
                    tx.send(event).unwrap();
                }),
            )
            .unwrap();
        assert_eq!(
            rx.recv_timeout(RECV_TIMEOUT).unwrap().kind,
            CompletionKind::Complete
        );
        clients.push(client);
    }

    let mut servers = Vec::new();
    for _ in 0..3 {
        servers.push(accept_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap());
    }
    assert_eq!(servers.len(), 3);

    driver.stop();
}

/// A toy record protocol: one magic handshake byte each way, then XOR
/// with a fixed key.
struct XorCipher {
    established: AtomicBool,
}

const XOR_KEY: u8 = 0x5a;
const MAGIC: u8 = 0xa5;

impl XorCipher {
    fn new() -> Self {
        Self {
            established: AtomicBool::new(false),
        }
    }
}

impl Encryption for XorCipher {
    fn initiate(&self, output: &mut BytesMut) -> Result<()> {
        output.put_u8(MAGIC);
        Ok(())
    }

    fn absorb(
        &self,
        input: &[u8],
        plaintext: &mut BytesMut,
        _output: &mut BytesMut,
    ) -> Result<()> {
        let mut data = input;
        if !self.established.load(Ordering::SeqCst) {
            let Some((&first, rest)) = data.split_first() else {
                return Ok(());
            };
            if first != MAGIC {
                return Err(Error::Invalid);
            }
            self.established.store(true, Ordering::SeqCst);
            data = rest;
        }
        plaintext.extend(data.iter().map(|byte| byte ^ XOR_KEY));
        Ok(())
    }

    fn seal(&self, plaintext: &[u8], output: &mut BytesMut) -> Result<()> {
        output.extend(plaintext.iter().map(|byte| byte ^ XOR_KEY));
        Ok(())
    }

    fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn shutdown(&self, _output: &mut BytesMut) -> Result<()> {
        self.established.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_upgrade_completes_parked_sends() {
    let driver = new_driver();
    let (_listener, client, server) = connected_pair(&driver, SocketOptions::default());

    let (client_up_tx, client_up_rx) = flume::bounded::<Result<()>>(1);
    let (server_up_tx, server_up_rx) = flume::bounded::<Result<()>>(1);

    client
        .upgrade(
            Arc::new(XorCipher::new()),
            Box::new(move |result| {
                client_up_tx.send(result).unwrap();
            }),
        )
        .unwrap();
    server
        .upgrade(
            Arc::new(XorCipher::new()),
            Box::new(move |result| {
                server_up_tx.send(result).unwrap();
            }),
        )
        .unwrap();

    // A send issued mid-handshake parks in the pre-encryption queue and
    // flushes once the capability establishes.
    client
        .send(Bytes::from_static(b"sealed"), &SendOptions::new(), None)
        .unwrap();

    client_up_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    server_up_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert!(client.is_encrypted());

    let event = receive_exact(&server, 6);
    assert_eq!(event.data.as_deref(), Some(&b"sealed"[..]));

    driver.stop();
}

#[test]
fn test_release_returns_stream_handle() {
    let driver = new_driver();
    let (_listener, client, _server) = connected_pair(&driver, SocketOptions::default());
    let handle = client.handle().unwrap();

    let (tx, rx) = flume::bounded::<Result<outrigger_core::transport::Handle>>(1);
    client
        .release(Box::new(move |result| {
            tx.send(result).unwrap();
        }))
        .unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap(), handle);
    driver.stop();
}
