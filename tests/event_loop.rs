use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    net::TcpStream,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use mill_tcp::{EventLoop, Interest, NetError, TcpConnection, TcpListener};

#[test]
fn listener_callback_fires_on_connect() {
    let event_loop = EventLoop::new().unwrap();
    let listener = Rc::new(TcpListener::new(0).unwrap());
    let accepted: Rc<RefCell<Vec<TcpConnection>>> = Rc::new(RefCell::new(Vec::new()));

    let l = Rc::clone(&listener);
    let acc = Rc::clone(&accepted);
    event_loop
        .add_io(listener.fd(), Interest::READ, move |lp, ready| {
            assert!(ready.is_readable());
            while let Some(conn) = l.accept() {
                acc.borrow_mut().push(conn);
            }
            lp.stop();
        })
        .unwrap();

    let _client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
    event_loop.run().unwrap();
    assert_eq!(accepted.borrow().len(), 1);
}

#[test]
fn connection_callback_sees_exact_bytes() {
    let event_loop = EventLoop::new().unwrap();
    let listener = TcpListener::new(0).unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut conn = loop {
        if let Some(conn) = listener.accept() {
            break conn;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    };

    let received = Rc::new(RefCell::new(Vec::new()));
    let r = Rc::clone(&received);
    let fd = conn.fd();
    event_loop
        .add_io(fd, Interest::READ, move |lp, _| {
            let mut buf = [0u8; 64];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) | Err(NetError::WouldBlock) => break,
                    Ok(n) => r.borrow_mut().extend_from_slice(&buf[..n]),
                    Err(e) => panic!("read failed: {e}"),
                }
            }
            if r.borrow().len() >= 4 {
                lp.stop();
            }
        })
        .unwrap();

    client.write_all(b"ping").unwrap();
    event_loop.run().unwrap();
    assert_eq!(&*received.borrow(), b"ping");
}

#[test]
fn write_interest_drives_a_reply() {
    let event_loop = EventLoop::new().unwrap();
    let listener = TcpListener::new(0).unwrap();
    let mut client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut conn = loop {
        if let Some(conn) = listener.accept() {
            break conn;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    };
    conn.queue(b"pong");
    let fd = conn.fd();

    event_loop
        .add_io(fd, Interest::WRITE, move |lp, ready| {
            assert!(ready.is_writable());
            conn.flush().unwrap();
            if !conn.has_pending_output() {
                lp.modify_io(ready.fd(), Interest::NONE).unwrap();
                lp.stop();
            }
        })
        .unwrap();

    event_loop.run().unwrap();
    assert_eq!(event_loop.interest_of(fd), Some(Interest::NONE));

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");
}

#[test]
fn timers_and_io_share_the_loop() {
    let event_loop = EventLoop::new().unwrap();
    let ticks = Rc::new(Cell::new(0u32));

    let t = Rc::clone(&ticks);
    let ticker = event_loop.add_timer(Duration::from_millis(5), move |_| t.set(t.get() + 1), true);
    let t = Rc::clone(&ticks);
    event_loop.add_timer(
        Duration::from_millis(80),
        move |lp| {
            assert!(t.get() >= 2);
            lp.stop();
        },
        false,
    );

    let started = Instant::now();
    event_loop.run().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert!(ticks.get() >= 2);
    assert!(!ticker.is_cancelled());
}

#[test]
fn worker_results_are_posted_back() {
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let done = Arc::new(AtomicUsize::new(0));
    let collected = Rc::new(RefCell::new(Vec::new()));

    // The loop thread only learns about results through posted tasks.
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let handle = handle.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * i as u64));
                handle
                    .post(move |lp| {
                        if done.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                            lp.stop();
                        }
                    })
                    .unwrap();
            })
        })
        .collect();

    let c = Rc::clone(&collected);
    event_loop.add_timer(Duration::from_millis(1), move |_| c.borrow_mut().push(()), false);

    event_loop.run().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert_eq!(collected.borrow().len(), 1);
}

#[test]
fn posting_after_loop_dropped_fails() {
    let handle = EventLoop::new().unwrap().handle();
    let err = handle.post(|_| {}).unwrap_err();
    assert!(matches!(err, NetError::Closed));
}

#[test]
fn closed_descriptor_can_be_removed() {
    let event_loop = EventLoop::new().unwrap();
    let listener = TcpListener::new(0).unwrap();
    let fd = listener.fd();
    event_loop.add_io(fd, Interest::READ, |_, _| {}).unwrap();
    drop(listener);

    event_loop.remove_io(fd).unwrap();
    assert!(!event_loop.is_registered(fd));
    assert_eq!(event_loop.registered_count(), 0);
}

#[test]
fn read_side_hangup_reaches_read_handler() {
    let event_loop = EventLoop::new().unwrap();
    let listener = TcpListener::new(0).unwrap();
    let client = TcpStream::connect(("127.0.0.1", listener.local_port())).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut conn = loop {
        if let Some(conn) = listener.accept() {
            break conn;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    };
    drop(client);

    let saw_eof = Rc::new(Cell::new(false));
    let s = Rc::clone(&saw_eof);
    event_loop
        .add_io(conn.fd(), Interest::READ, move |lp, ready| {
            assert!(ready.is_readable());
            let mut buf = [0u8; 8];
            if let Ok(0) = conn.read(&mut buf) {
                s.set(true);
                lp.remove_io(ready.fd()).unwrap();
                lp.stop();
            }
        })
        .unwrap();

    event_loop.run().unwrap();
    assert!(saw_eof.get());
    assert_eq!(event_loop.registered_count(), 0);
}
