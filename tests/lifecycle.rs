//! Integration tests for shutdown and close on endpoints.

use std::time::{Duration, Instant};

use roam_handoff::{
    ChannelConfig, ChannelKind, EndpointState, HandoffError, Operation, Phase, Shutdown,
    create_channel_pair_with,
};

fn kinds() -> Vec<ChannelKind> {
    let mut kinds = vec![ChannelKind::Emulated];
    if ChannelKind::Native.is_available() {
        kinds.push(ChannelKind::Native);
    }
    kinds
}

/// Shutting down the same direction twice is reported.
#[test]
fn test_double_shutdown() {
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.shutdown(Shutdown::Write).unwrap();

        let err = a.shutdown(Shutdown::Write).unwrap_err();
        assert!(matches!(err, HandoffError::AlreadyShutDown { how: Shutdown::Write }));
        assert_eq!(err.phase(), Phase::Lifecycle);
        assert_eq!(a.state(), EndpointState::ShutdownWrite);
    }
}

/// After `shutdown(Read)` a read returns zero right away, even with nothing
/// sent and the peer still open.
#[test]
fn test_read_after_read_shutdown_does_not_block() {
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        a.shutdown(Shutdown::Read).unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).unwrap(), 0, "{kind}");
        assert!(start.elapsed() < Duration::from_secs(1), "{kind} read blocked");

        let received = a.recv_with_handle().unwrap();
        assert!(received.is_peer_closed());
    }
}

/// Writing after `shutdown(Write)` fails without touching the socket.
#[test]
fn test_write_after_write_shutdown() {
    for kind in kinds() {
        let (a, b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.shutdown(Shutdown::Write).unwrap();

        let err = a.write(b"late").unwrap_err();
        assert!(matches!(err, HandoffError::EndpointClosed { op: Operation::Write }));

        // The peer sees end of stream.
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 0);

        // The other direction still works.
        b.write(b"back").unwrap();
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"back");
    }
}

/// Closing twice is reported, and never touches another descriptor.
#[test]
fn test_double_close() {
    for kind in kinds() {
        let (a, b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.close().unwrap();

        // A fresh pair probably reuses the descriptor number just released.
        let (c, d) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();

        assert!(matches!(a.close().unwrap_err(), HandoffError::AlreadyClosed));

        c.write(b"alive").unwrap();
        let mut buf = [0u8; 8];
        let n = d.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"alive");
        drop(b);
    }
}

/// Every operation on a closed endpoint fails with `EndpointClosed`.
#[test]
fn test_operations_after_close() {
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.close().unwrap();
        assert_eq!(a.state(), EndpointState::Closed);

        let mut buf = [0u8; 4];
        assert!(matches!(
            a.read(&mut buf).unwrap_err(),
            HandoffError::EndpointClosed { op: Operation::Read }
        ));
        assert!(matches!(
            a.write(b"x").unwrap_err(),
            HandoffError::EndpointClosed { op: Operation::Write }
        ));
        assert!(matches!(
            a.recv_with_handle().unwrap_err(),
            HandoffError::EndpointClosed { op: Operation::Recv }
        ));
        assert!(matches!(
            a.shutdown(Shutdown::Both).unwrap_err(),
            HandoffError::EndpointClosed { op: Operation::Shutdown }
        ));
        assert!(matches!(
            a.set_nonblocking(true).unwrap_err(),
            HandoffError::EndpointClosed { op: Operation::SetOption }
        ));
    }
}

/// A reader blocked in another thread is woken by `shutdown`, after which
/// `close` can proceed.
#[test]
fn test_shutdown_wakes_blocked_reader() {
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        let a = std::sync::Arc::new(a);

        let reader = {
            let a = a.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 4];
                a.read(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        a.shutdown(Shutdown::Both).unwrap();

        let n = reader.join().unwrap().unwrap();
        assert_eq!(n, 0, "{kind}");
        a.close().unwrap();
    }
}

/// Read timeouts surface as ordinary I/O errors.
#[test]
fn test_read_timeout() {
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let mut buf = [0u8; 4];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.phase(), Phase::Io);
        let io_kind = err.io_error().unwrap().kind();
        assert!(
            matches!(
                io_kind,
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            "{io_kind:?}"
        );
    }
}

/// A `close` that is waiting for a blocked reader does not hold back
/// `shutdown` or `state`, so the reader can still be woken and the close
/// completes.
#[test]
fn test_pending_close_does_not_block_shutdown() {
    use std::sync::{Arc, mpsc};

    let deadline = Duration::from_secs(5);
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        let a = Arc::new(a);
        let (done_tx, done_rx) = mpsc::channel::<&'static str>();

        let reader = {
            let a = a.clone();
            let done = done_tx.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 4];
                let result = a.read(&mut buf);
                done.send("read").unwrap();
                result
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let closer = {
            let a = a.clone();
            let done = done_tx.clone();
            std::thread::spawn(move || {
                let result = a.close();
                done.send("close").unwrap();
                result
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        // Neither call may queue up behind the waiting close.
        let (state_tx, state_rx) = mpsc::channel();
        let shutter = {
            let a = a.clone();
            std::thread::spawn(move || {
                state_tx.send(a.state()).unwrap();
                let result = a.shutdown(Shutdown::Both);
                done_tx.send("shutdown").unwrap();
                result
            })
        };
        let state = state_rx.recv_timeout(deadline).expect("state() hung behind close");
        assert_ne!(state, EndpointState::Closed, "{kind}");

        let mut finished = Vec::new();
        for _ in 0..3 {
            finished.push(done_rx.recv_timeout(deadline).expect("operation hung"));
        }
        finished.sort_unstable();
        assert_eq!(finished, ["close", "read", "shutdown"], "{kind}");

        assert_eq!(reader.join().unwrap().unwrap(), 0, "{kind}");
        shutter.join().unwrap().unwrap();
        closer.join().unwrap().unwrap();
        assert_eq!(a.state(), EndpointState::Closed);
    }
}

/// Once a close has finished, operations fail fast instead of waiting.
#[test]
fn test_operations_after_concurrent_close_fail_fast() {
    for kind in kinds() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        let a = std::sync::Arc::new(a);

        let closer = {
            let a = a.clone();
            std::thread::spawn(move || a.close())
        };
        closer.join().unwrap().unwrap();

        let start = Instant::now();
        assert!(matches!(
            a.shutdown(Shutdown::Both).unwrap_err(),
            HandoffError::EndpointClosed { op: Operation::Shutdown }
        ));
        assert!(matches!(a.close().unwrap_err(), HandoffError::AlreadyClosed));
        assert!(start.elapsed() < Duration::from_secs(1), "{kind}");
    }
}
