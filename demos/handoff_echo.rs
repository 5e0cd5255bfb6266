//! Accept TCP connections on one thread and hand them to an echo worker.
//!
//! Run with `ROAM_HANDOFF_MODE=emulated` to watch the fallback path, where
//! the acceptor keeps the connection and serves it itself.
//!
//! ```text
//! RUST_LOG=debug cargo run --example handoff_echo
//! ```

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use roam_handoff::{CarriedHandle, ChannelConfig, Endpoint, HandOff, create_channel_pair_with};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLIENTS: usize = 3;

fn echo_one_line(stream: TcpStream, served_by: &str) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut stream = stream;
    write!(stream, "[{served_by}] {line}")?;
    Ok(())
}

fn worker(endpoint: Endpoint) {
    loop {
        let received = match endpoint.recv_with_handle() {
            Ok(received) => received,
            Err(err) => {
                tracing::error!(%err, "worker receive failed");
                return;
            }
        };
        if received.is_peer_closed() {
            tracing::info!("acceptor went away, worker exiting");
            return;
        }
        let Some(handle) = received.handle else {
            tracing::debug!(
                note = %String::from_utf8_lossy(&received.payload),
                "message without a connection"
            );
            continue;
        };
        if let Err(err) = echo_one_line(handle.into_tcp_stream(), "worker") {
            tracing::warn!(%err, "echo failed");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,roam_handoff=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ChannelConfig::from_env();
    let (acceptor_side, worker_side) = create_channel_pair_with(&config)?;
    tracing::info!(
        kind = %acceptor_side.kind(),
        carries_handles = acceptor_side.carries_handles(),
        "channel ready"
    );

    let worker_thread = thread::spawn(move || worker(worker_side));

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let clients: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || -> std::io::Result<String> {
                let mut stream = TcpStream::connect(addr)?;
                writeln!(stream, "hello from client {i}")?;
                let mut reply = String::new();
                BufReader::new(stream).read_line(&mut reply)?;
                Ok(reply)
            })
        })
        .collect();

    for _ in 0..CLIENTS {
        let (stream, peer) = listener.accept()?;
        let note = format!("connection from {peer}");
        match acceptor_side.hand_off(note.as_bytes(), CarriedHandle::from(stream)) {
            Ok(HandOff::Carried { .. }) => tracing::info!(%peer, "handed off"),
            Ok(HandOff::NotCarried { handle, .. }) => {
                tracing::info!(%peer, "serving locally");
                echo_one_line(handle.into_tcp_stream(), "acceptor")?;
            }
            Err(failed) => {
                tracing::error!(%peer, err = %failed.error, "hand-off failed, serving locally");
                echo_one_line(failed.handle.into_tcp_stream(), "acceptor")?;
            }
        }
    }

    for client in clients {
        match client.join() {
            Ok(reply) => print!("{}", reply?),
            Err(_) => tracing::error!("client thread panicked"),
        }
    }

    acceptor_side.shutdown(roam_handoff::Shutdown::Write)?;
    if worker_thread.join().is_err() {
        tracing::error!("worker thread panicked");
    }
    acceptor_side.close()?;
    Ok(())
}
