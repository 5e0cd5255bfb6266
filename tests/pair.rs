//! Integration tests for channel pair creation and plain byte traffic.

use roam_handoff::{
    ChannelConfig, ChannelKind, Endpoint, create_channel_pair, create_channel_pair_with,
};

fn kinds() -> Vec<ChannelKind> {
    let mut kinds = vec![ChannelKind::Emulated];
    if ChannelKind::Native.is_available() {
        kinds.push(ChannelKind::Native);
    }
    kinds
}

fn read_exact(endpoint: &Endpoint, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 256];
    while out.len() < len {
        let n = endpoint.read(&mut buf[..len - out.len()]).unwrap();
        assert!(n > 0, "peer closed after {} of {len} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Bytes written on one side come out on the other, both ways.
#[test]
fn test_bidirectional_ping_pong() {
    for kind in kinds() {
        let (a, b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();

        a.write(b"ping").unwrap();
        assert_eq!(read_exact(&b, 4), b"ping", "{kind}");

        b.write(b"pong").unwrap();
        assert_eq!(read_exact(&a, 4), b"pong", "{kind}");
    }
}

/// The default pair works without any configuration.
#[test]
fn test_default_pair() {
    let (a, b) = create_channel_pair().unwrap();
    assert_eq!(a.kind(), ChannelKind::platform_default());
    a.write(b"x").unwrap();
    assert_eq!(read_exact(&b, 1), b"x");
}

/// Closing one side makes the other side read zero bytes.
#[test]
fn test_peer_close_reads_zero() {
    for kind in kinds() {
        let (a, b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.close().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 0, "{kind}");
    }
}

/// Data already written is still readable after the writer closes.
#[test]
fn test_buffered_data_survives_writer_close() {
    for kind in kinds() {
        let (a, b) = create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
        a.write(b"last words").unwrap();
        a.close().unwrap();

        assert_eq!(read_exact(&b, 10), b"last words", "{kind}");
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0, "{kind}");
    }
}

/// Many pairs created at once never get crossed.
#[test]
fn test_concurrent_creation() {
    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            std::thread::spawn(move || {
                let kind = if i % 2 == 0 || !ChannelKind::Native.is_available() {
                    ChannelKind::Emulated
                } else {
                    ChannelKind::Native
                };
                let (a, b) =
                    create_channel_pair_with(&ChannelConfig::default().kind(kind)).unwrap();
                let msg = [i; 8];
                a.write(&msg).unwrap();
                assert_eq!(read_exact(&b, 8), msg);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

/// Endpoints can move to another thread.
#[test]
fn test_endpoint_moves_across_threads() {
    let (a, b) = create_channel_pair().unwrap();
    let reader = std::thread::spawn(move || read_exact(&b, 5));
    a.write(b"hello").unwrap();
    assert_eq!(reader.join().unwrap(), b"hello");
}

/// Reading and writing the same endpoint from two threads at once.
#[test]
fn test_concurrent_read_and_write_on_one_endpoint() {
    let (a, b) = create_channel_pair().unwrap();
    let a = std::sync::Arc::new(a);

    let reader = {
        let a = a.clone();
        std::thread::spawn(move || read_exact(&a, 3))
    };

    a.write(b"out").unwrap();
    assert_eq!(read_exact(&b, 3), b"out");
    b.write(b"in!").unwrap();

    assert_eq!(reader.join().unwrap(), b"in!");
}

/// An endpoint taken apart into its descriptor can be rebuilt, the way a
/// child process rebuilds an inherited one.
#[cfg(unix)]
#[test]
fn test_rebuild_from_owned_fd() {
    let config = ChannelConfig::native();
    let (a, b) = create_channel_pair_with(&config).unwrap();

    let arg = b.to_arg().unwrap();
    assert_eq!(arg.parse::<i32>().unwrap(), b.raw_fd().unwrap());
    b.set_inheritable(true).unwrap();
    b.set_inheritable(false).unwrap();

    let fd = b.into_owned_fd().unwrap();
    let b = Endpoint::from_owned_fd(fd, &config);
    assert_eq!(b.kind(), ChannelKind::Native);

    a.write(b"again").unwrap();
    assert_eq!(read_exact(&b, 5), b"again");
}
