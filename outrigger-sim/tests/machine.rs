//! End-to-end scenarios over the simulated machine: handle and port
//! reuse, blocking and non-blocking datagram exchange, stream half-close,
//! readiness monitoring, and buffer overflow backpressure.

use std::sync::Arc;

use outrigger_core::endpoint::Endpoint;
use outrigger_core::error::Error;
use outrigger_core::transport::{Direction, Handle, Transport};
use outrigger_sim::{Interest, Machine, Monitor, Session};

fn open_udp(machine: &Arc<Machine>) -> Arc<Session> {
    let session = machine.create_session();
    session.open(Transport::Udp4).unwrap();
    session.bind(&Endpoint::loopback_v4(0), false).unwrap();
    session
}

/// Wait until the monitor reports the given readiness for `handle`.
fn await_ready(monitor: &Monitor, handle: Handle, readable: bool, writable: bool) {
    let mut events = Vec::new();
    loop {
        events.clear();
        monitor.dequeue(&mut events).unwrap();
        for event in &events {
            if event.handle == handle
                && (!readable || event.readable)
                && (!writable || event.writable)
            {
                return;
            }
        }
    }
}

#[test]
fn test_handle_reuse() {
    let machine = Machine::new();

    let session_a = machine.create_session();
    let session_b = machine.create_session();
    let session_c = machine.create_session();

    // The first handle is the well-known base.
    session_a.open(Transport::Udp4).unwrap();
    assert_eq!(session_a.handle().unwrap().as_raw(), 3);

    // Closing frees the handle for immediate reuse.
    session_a.close().unwrap();
    session_a.open(Transport::Udp4).unwrap();
    assert_eq!(session_a.handle().unwrap().as_raw(), 3);

    session_b.open(Transport::Udp4).unwrap();
    assert_eq!(session_b.handle().unwrap().as_raw(), 4);

    session_c.open(Transport::Udp4).unwrap();
    assert_eq!(session_c.handle().unwrap().as_raw(), 5);

    // Closing the middle handle opens a gap; the next open fills it.
    session_b.close().unwrap();
    session_b.open(Transport::Udp4).unwrap();
    assert_eq!(session_b.handle().unwrap().as_raw(), 4);

    session_a.close().unwrap();
    session_b.close().unwrap();
    session_c.close().unwrap();
}

#[test]
fn test_ephemeral_port_gap_reuse() {
    let machine = Machine::new();

    let session_a = open_udp(&machine);
    let session_b = open_udp(&machine);
    let session_c = open_udp(&machine);

    assert_eq!(session_a.source_endpoint().unwrap().port(), Some(49152));
    assert_eq!(session_b.source_endpoint().unwrap().port(), Some(49153));
    assert_eq!(session_c.source_endpoint().unwrap().port(), Some(49154));

    // Closing the middle binding opens a gap; the next ephemeral
    // allocation fills it.
    session_b.close().unwrap();

    let session_d = open_udp(&machine);
    assert_eq!(session_d.source_endpoint().unwrap().port(), Some(49153));

    session_a.close().unwrap();
    session_c.close().unwrap();
    session_d.close().unwrap();
}

#[test]
fn test_blocking_datagram_echo() {
    let machine = Machine::new();

    let client = open_udp(&machine);
    let server = open_udp(&machine);

    let client_endpoint = client.source_endpoint().unwrap();
    let server_endpoint = server.source_endpoint().unwrap();

    // Client to server.
    client.send(b"C", Some(&server_endpoint)).unwrap();
    machine.step(false).unwrap();

    let (data, source) = server.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"C");
    assert_eq!(source, client_endpoint);

    // Server back to client.
    server.send(b"S", Some(&client_endpoint)).unwrap();
    machine.step(false).unwrap();

    let (data, source) = client.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"S");
    assert_eq!(source, server_endpoint);

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_connected_datagram_pair() {
    let machine = Machine::new();

    let client = open_udp(&machine);
    let server = open_udp(&machine);

    let client_endpoint = client.source_endpoint().unwrap();
    let server_endpoint = server.source_endpoint().unwrap();

    // Connect assigns the default remote; send needs no endpoint.
    client.connect(&server_endpoint).unwrap();
    server.connect(&client_endpoint).unwrap();

    client.send(b"ping", None).unwrap();
    machine.step(false).unwrap();
    let (data, _) = server.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"ping");

    server.send(b"pong", None).unwrap();
    machine.step(false).unwrap();
    let (data, _) = client.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"pong");

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_connected_stream_half_close() {
    let machine = Machine::new();

    // Listener opens TCP loopback and listens with backlog 0.
    let listener = machine.create_session();
    listener.open(Transport::Tcp4).unwrap();
    listener.bind(&Endpoint::loopback_v4(0), false).unwrap();
    listener.listen(0).unwrap();
    let listener_endpoint = listener.source_endpoint().unwrap();

    // Client connects; the connection establishes on the next step.
    let client = machine.create_session();
    client.open(Transport::Tcp4).unwrap();
    client.connect(&listener_endpoint).unwrap();
    machine.step(false).unwrap();

    let server = listener.accept().unwrap();
    assert!(client.is_connected());

    // Bidirectional single-byte exchange.
    client.send(b"C", None).unwrap();
    machine.step(false).unwrap();
    let (data, _) = server.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"C");

    server.send(b"S", None).unwrap();
    machine.step(false).unwrap();
    let (data, _) = client.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"S");

    // Client half-closes; the server observes end-of-file.
    client.shutdown(Direction::Send).unwrap();
    machine.step(false).unwrap();
    assert_eq!(server.receive(usize::MAX), Err(Error::Eof));

    // Server half-closes; the client observes end-of-file.
    server.shutdown(Direction::Send).unwrap();
    machine.step(false).unwrap();
    assert_eq!(client.receive(usize::MAX), Err(Error::Eof));

    // Both directions are now shut; sends fail on either side.
    assert!(client.send(b"x", None).is_err());
    assert!(server.send(b"x", None).is_err());

    client.close().unwrap();
    server.close().unwrap();
    listener.close().unwrap();
}

#[test]
fn test_nonblocking_readiness() {
    let machine = Machine::new();
    machine.run();

    let client = open_udp(&machine);
    let server = open_udp(&machine);
    client.set_blocking(false);
    server.set_blocking(false);

    let client_handle = client.handle().unwrap();
    let server_handle = server.handle().unwrap();
    let client_endpoint = client.source_endpoint().unwrap();
    let server_endpoint = server.source_endpoint().unwrap();

    let monitor = Monitor::new(Arc::clone(&machine));
    monitor.add(Arc::clone(&client)).unwrap();
    monitor.add(Arc::clone(&server)).unwrap();

    // Client to server, readiness-driven.
    monitor.show(&client, Interest::Writable).unwrap();
    await_ready(&monitor, client_handle, false, true);
    client.send(b"C", Some(&server_endpoint)).unwrap();
    monitor.hide(&client, Interest::Writable).unwrap();

    monitor.show(&server, Interest::Readable).unwrap();
    await_ready(&monitor, server_handle, true, false);
    let (data, source) = server.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"C");
    assert_eq!(source, client_endpoint);
    monitor.hide(&server, Interest::Readable).unwrap();

    // Server back to client, symmetric.
    monitor.show(&server, Interest::Writable).unwrap();
    await_ready(&monitor, server_handle, false, true);
    server.send(b"S", Some(&client_endpoint)).unwrap();
    monitor.hide(&server, Interest::Writable).unwrap();

    monitor.show(&client, Interest::Readable).unwrap();
    await_ready(&monitor, client_handle, true, false);
    let (data, source) = client.receive(usize::MAX).unwrap();
    assert_eq!(&data[..], b"S");
    assert_eq!(source, server_endpoint);

    client.close().unwrap();
    server.close().unwrap();
    machine.stop();
}

#[test]
fn test_send_buffer_overflow() {
    const DATA_SIZE: usize = 1024 * 1024;
    const SEND_BUFFER_SIZE: usize = 256 * 1024;
    const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

    let machine = Machine::new();
    machine.run();

    let listener = machine.create_session();
    listener.open(Transport::Tcp4).unwrap();
    listener.bind(&Endpoint::loopback_v4(0), false).unwrap();
    listener.listen(1).unwrap();
    let listener_endpoint = listener.source_endpoint().unwrap();

    let client = machine.create_session();
    client.open(Transport::Tcp4).unwrap();
    client.connect(&listener_endpoint).unwrap();

    let server = listener.accept().unwrap();

    client.set_blocking(false);
    server.set_blocking(false);
    client.set_send_buffer_size(SEND_BUFFER_SIZE);
    server.set_receive_buffer_size(RECEIVE_BUFFER_SIZE);

    let data: Vec<u8> = (0..DATA_SIZE).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();

    let monitor = Monitor::new(Arc::clone(&machine));
    monitor.add(Arc::clone(&client)).unwrap();
    monitor.add(Arc::clone(&server)).unwrap();
    monitor.show(&client, Interest::Writable).unwrap();
    monitor.show(&server, Interest::Readable).unwrap();

    let client_handle = client.handle().unwrap();
    let writer_monitor = Monitor::new(Arc::clone(&machine));
    writer_monitor.add(Arc::clone(&client)).unwrap();
    writer_monitor.show(&client, Interest::Writable).unwrap();

    // Writer: readiness-driven, tolerating would-block on a full buffer.
    let writer_client = Arc::clone(&client);
    let writer = std::thread::spawn(move || {
        let mut written = 0usize;
        let mut saw_would_block = false;
        while written < data.len() {
            await_ready(&writer_monitor, client_handle, false, true);
            match writer_client.send(&data[written..], None) {
                Ok(accepted) => written += accepted,
                Err(Error::WouldBlock) => saw_would_block = true,
                Err(error) => panic!("unexpected send failure: {error}"),
            }
        }
        (written, saw_would_block)
    });

    // Reader: readiness-driven drain until every byte has arrived.
    let server_handle = server.handle().unwrap();
    let mut received = Vec::with_capacity(DATA_SIZE);
    while received.len() < DATA_SIZE {
        await_ready(&monitor, server_handle, true, false);
        match server.receive(usize::MAX) {
            Ok((data, _)) => received.extend_from_slice(&data),
            Err(Error::WouldBlock) => {}
            Err(error) => panic!("unexpected receive failure: {error}"),
        }
    }

    let (written, _saw_would_block) = writer.join().unwrap();
    assert_eq!(written, DATA_SIZE);
    assert_eq!(received.len(), DATA_SIZE);
    assert_eq!(received, expected);

    client.close().unwrap();
    server.close().unwrap();
    listener.close().unwrap();
    machine.stop();
}

#[test]
fn test_connect_refused_without_listener() {
    let machine = Machine::new();

    let client = machine.create_session();
    client.open(Transport::Tcp4).unwrap();
    client.connect(&Endpoint::loopback_v4(49999)).unwrap();
    machine.step(false).unwrap();

    assert_eq!(client.take_connect_result(), Some(Err(Error::Transport)));
    assert!(!client.is_connected());
    client.close().unwrap();
}

#[test]
fn test_datagram_dropped_without_binding() {
    let machine = Machine::new();

    let client = open_udp(&machine);
    client.set_blocking(false);

    // No session is bound at the destination; the datagram is lost and
    // the sender observes nothing.
    client
        .send(b"void", Some(&Endpoint::loopback_v4(49999)))
        .unwrap();
    machine.step(false).unwrap();

    assert_eq!(client.receive(usize::MAX), Err(Error::WouldBlock));
    client.close().unwrap();
}
