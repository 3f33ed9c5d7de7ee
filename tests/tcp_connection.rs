use std::{
    io::{Read, Write},
    net::{Ipv4Addr, TcpStream},
    thread,
    time::{Duration, Instant},
};

use mill_tcp::{
    line::LineReader, ConnectStatus, Line, LinePolicy, NetError, TcpConnection, TcpListener,
};

fn accept_within(listener: &TcpListener) -> TcpConnection {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(conn) = listener.accept() {
            return conn;
        }
        assert!(Instant::now() < deadline, "no connection accepted");
        thread::sleep(Duration::from_millis(1));
    }
}

fn connected_pair() -> (TcpStream, TcpConnection, TcpListener) {
    let listener = TcpListener::new(0).unwrap();
    let client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let conn = accept_within(&listener);
    (client, conn, listener)
}

/// Retries a non-blocking read until something other than WouldBlock happens.
fn read_ready(conn: &mut TcpConnection, buf: &mut [u8]) -> mill_tcp::Result<usize> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match conn.read(buf) {
            Err(NetError::WouldBlock) => {
                assert!(Instant::now() < deadline, "read never became ready");
                thread::sleep(Duration::from_millis(1));
            }
            res => return res,
        }
    }
}

#[test]
fn listener_on_port_zero_gets_a_port() {
    let listener = TcpListener::new(0).unwrap();
    assert!(listener.fd() >= 0);
    assert!(listener.local_port() > 0);
    assert_eq!(listener.backlog(), libc::SOMAXCONN);
}

#[test]
fn bind_conflict_fails_construction() {
    let first = TcpListener::new(0).unwrap();
    let err = TcpListener::new(first.local_port()).unwrap_err();
    assert_eq!(err.os_code(), Some(libc::EADDRINUSE));
}

#[test]
fn accept_without_pending_connection_is_none() {
    let listener = TcpListener::new(0).unwrap();
    let started = Instant::now();
    assert!(listener.accept().is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn accepted_connection_knows_its_peer() {
    let (client, conn, _listener) = connected_pair();
    assert_eq!(conn.peer_address(), "127.0.0.1");
    assert_ne!(conn.peer_port(), 0);
    assert_eq!(conn.peer_port(), client.local_addr().unwrap().port());
    assert!(!conn.is_closed());
}

#[test]
fn read_returns_what_the_peer_sent() {
    let (mut client, mut conn, _listener) = connected_pair();
    client.write_all(b"hello").unwrap();

    let mut buf = [0u8; 16];
    let n = read_ready(&mut conn, &mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(conn.bytes_read(), 5);
}

#[test]
fn write_is_observed_by_the_peer() {
    let (mut client, mut conn, _listener) = connected_pair();
    assert_eq!(conn.write(b"world").unwrap(), 5);

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world");
    assert_eq!(conn.bytes_written(), 5);
}

#[test]
fn read_on_idle_connection_would_block() {
    let (_client, mut conn, _listener) = connected_pair();
    let mut buf = [0u8; 8];
    let err = conn.read(&mut buf).unwrap_err();
    assert!(err.is_would_block());
    assert!(!conn.is_closed());
}

#[test]
fn end_of_stream_is_idempotent() {
    let (client, mut conn, _listener) = connected_pair();
    drop(client);

    let mut buf = [0u8; 8];
    assert_eq!(read_ready(&mut conn, &mut buf).unwrap(), 0);
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
    assert!(conn.closed_gracefully());
}

#[test]
fn large_writes_arrive_in_order() {
    let (mut client, mut conn, _listener) = connected_pair();
    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let reader = thread::spawn(move || {
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);
    });

    conn.queue(&payload);
    let deadline = Instant::now() + Duration::from_secs(10);
    while conn.has_pending_output() {
        conn.flush().unwrap();
        assert!(Instant::now() < deadline, "output never drained");
        thread::sleep(Duration::from_micros(200));
    }
    reader.join().unwrap();
    assert_eq!(conn.bytes_written(), payload.len() as u64);
}

#[test]
fn fill_input_frames_lines() {
    let (mut client, mut conn, _listener) = connected_pair();
    conn.configure(
        1024,
        64 * 1024,
        LineReader::new(b'\n', 8, LinePolicy::Split),
    );
    client.write_all(b"short\r\nabcdefghijkl\n").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.input().size() < 20 {
        match conn.fill_input() {
            Ok(_) | Err(NetError::WouldBlock) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(Instant::now() < deadline, "input never arrived");
    }

    assert_eq!(
        conn.read_line().unwrap(),
        Some(Line::Complete(b"short".to_vec()))
    );
    assert_eq!(
        conn.read_line().unwrap(),
        Some(Line::Partial(b"abcdefgh".to_vec()))
    );
    assert_eq!(
        conn.read_line().unwrap(),
        Some(Line::Complete(b"ijkl".to_vec()))
    );
    assert_eq!(conn.read_line().unwrap(), None);
}

#[test]
fn input_cap_reports_overflow() {
    let (mut client, mut conn, _listener) = connected_pair();
    conn.configure(4, 8, LineReader::default());
    client.write_all(&[b'x'; 20]).unwrap();
    thread::sleep(Duration::from_millis(50));

    // Reaching the cap after progress reports the progress.
    assert_eq!(conn.fill_input().unwrap(), 8);
    assert!(conn.is_input_full());

    let err = conn.fill_input().unwrap_err();
    assert!(matches!(err, NetError::BufferOverflow { limit: 8 }));
    assert_eq!(conn.input().size(), 8);

    // Consuming makes room for the next round.
    conn.input_mut().consume(8).unwrap();
    assert_eq!(conn.fill_input().unwrap(), 8);
}

#[test]
fn empty_read_buffer_is_not_end_of_stream() {
    let (mut client, mut conn, _listener) = connected_pair();
    client.write_all(b"data").unwrap();

    let err = conn.read(&mut []).unwrap_err();
    assert!(matches!(err, NetError::InsufficientData { .. }));
    assert!(!conn.closed_gracefully());

    let mut buf = [0u8; 8];
    assert_eq!(read_ready(&mut conn, &mut buf).unwrap(), 4);
}

#[test]
fn nonblocking_connect_completes() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let (mut conn, status) = TcpConnection::connect(Ipv4Addr::LOCALHOST, port).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    if status == ConnectStatus::InProgress {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.finish_connect() {
                Ok(()) => break,
                Err(NetError::WouldBlock) => {
                    assert!(Instant::now() < deadline, "connect never completed");
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => panic!("connect failed: {e}"),
            }
        }
    }
    assert!(!conn.is_connecting());
    assert_eq!(conn.peer_port(), port);

    assert_eq!(conn.write(b"ok").unwrap(), 2);
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ok");
}

#[test]
fn connect_to_closed_port_fails() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let outcome = TcpConnection::connect(Ipv4Addr::LOCALHOST, port).and_then(|(mut conn, _)| {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match conn.finish_connect() {
                Err(NetError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(1));
                }
                res => return res,
            }
        }
    });
    let err = outcome.unwrap_err();
    assert_eq!(err.os_code(), Some(libc::ECONNREFUSED));
}

#[test]
fn close_is_idempotent() {
    let (mut client, mut conn, _listener) = connected_pair();
    conn.close();
    conn.close();
    assert!(conn.is_closed());
    assert!(matches!(conn.write(b"x"), Err(NetError::Closed)));

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}
