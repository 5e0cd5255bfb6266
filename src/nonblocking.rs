//! Async endpoints on top of `tokio::io::unix::AsyncFd`.
//!
//! The endpoint is switched to non-blocking mode and registered with the
//! reactor. Every operation waits for readiness, tries the blocking-path
//! operation once, and clears readiness when the kernel says `WouldBlock`.

use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::config::ChannelKind;
use crate::endpoint::{Endpoint, EndpointState};
use crate::error::{HandoffError, Operation, Result};
use crate::handle::CarriedHandle;
use crate::transfer::{Delivery, Received, SendFlags, SendOptions};

/// The registered endpoint. `fd` stays valid for as long as the registration
/// lives: `AsyncEndpoint` never lends out the `Endpoint`, so the only ways to
/// close it are [`AsyncEndpoint::close`], [`AsyncEndpoint::into_inner`] and
/// drop, all of which deregister first.
struct Registered {
    fd: RawFd,
    endpoint: Endpoint,
}

impl AsRawFd for Registered {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// An [`Endpoint`] driven by the tokio reactor.
pub struct AsyncEndpoint {
    async_fd: AsyncFd<Registered>,
}

fn would_block(err: &HandoffError) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == ErrorKind::WouldBlock)
}

impl AsyncEndpoint {
    /// Register `endpoint` with the current tokio runtime.
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        let fd = endpoint.raw_fd().ok_or(HandoffError::EndpointClosed {
            op: Operation::SetOption,
        })?;
        endpoint.set_nonblocking(true)?;
        let async_fd = AsyncFd::with_interest(
            Registered { fd, endpoint },
            Interest::READABLE | Interest::WRITABLE,
        )
        .map_err(|e| HandoffError::io(Operation::SetOption, e))?;
        Ok(Self { async_fd })
    }

    fn endpoint(&self) -> &Endpoint {
        &self.async_fd.get_ref().endpoint
    }

    pub fn kind(&self) -> ChannelKind {
        self.endpoint().kind()
    }

    pub fn carries_handles(&self) -> bool {
        self.endpoint().carries_handles()
    }

    pub fn state(&self) -> EndpointState {
        self.endpoint().state()
    }

    pub fn read_capacity(&self) -> usize {
        self.endpoint().read_capacity()
    }

    /// Wait until readable, then read once. `Ok(0)` means the peer closed.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self
                .async_fd
                .readable()
                .await
                .map_err(|e| HandoffError::io(Operation::Read, e))?;
            match guard.get_inner().endpoint.read(buf) {
                Err(e) if would_block(&e) => guard.clear_ready(),
                result => return result,
            }
        }
    }

    /// Send a message.
    ///
    /// A payload-only message is written in full, waiting for writability
    /// between partial writes. A message carrying a handle goes out in one
    /// `sendmsg`.
    pub async fn write_with_handle(
        &self,
        payload: &[u8],
        handle: Option<&CarriedHandle>,
        options: &SendOptions,
    ) -> Result<Delivery> {
        let options = options.clone().flags(options.flags | SendFlags::DONT_WAIT);
        let mut written = 0;
        loop {
            let mut guard = self
                .async_fd
                .writable()
                .await
                .map_err(|e| HandoffError::io(Operation::Write, e))?;
            let endpoint = &guard.get_inner().endpoint;
            match endpoint.write_with_handle(&payload[written..], handle, &options) {
                Ok(Delivery::Payload { bytes }) => {
                    written += bytes;
                    if written >= payload.len() {
                        return Ok(Delivery::Payload { bytes: written });
                    }
                    guard.clear_ready();
                }
                Ok(delivery) => return Ok(delivery),
                Err(e) if would_block(&e) => guard.clear_ready(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait until readable, then receive one message and at most one handle.
    pub async fn recv_with_handle(&self) -> Result<Received> {
        loop {
            let mut guard = self
                .async_fd
                .ready(Interest::READABLE)
                .await
                .map_err(|e| HandoffError::io(Operation::Recv, e))?;
            match guard.get_inner().endpoint.recv_with_handle() {
                Err(e) if would_block(&e) => guard.clear_ready(),
                result => return result,
            }
        }
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> Result<()> {
        self.endpoint().shutdown(how)
    }

    /// Deregister from the reactor and close the endpoint.
    pub fn close(self) -> Result<()> {
        self.async_fd.into_inner().endpoint.close()
    }

    /// Deregister from the reactor and hand back the (still non-blocking)
    /// endpoint.
    pub fn into_inner(self) -> Endpoint {
        self.async_fd.into_inner().endpoint
    }
}

impl std::fmt::Debug for AsyncEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEndpoint")
            .field("endpoint", self.endpoint())
            .finish()
    }
}

impl From<AsyncEndpoint> for Endpoint {
    fn from(endpoint: AsyncEndpoint) -> Self {
        endpoint.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::create_channel_pair_with;
    use std::io;
    use std::net::TcpListener;

    fn async_pair(config: &ChannelConfig) -> (AsyncEndpoint, AsyncEndpoint) {
        let (a, b) = create_channel_pair_with(config).expect("pair");
        (
            AsyncEndpoint::new(a).expect("register a"),
            AsyncEndpoint::new(b).expect("register b"),
        )
    }

    #[tokio::test]
    async fn read_waits_for_data() {
        let (a, b) = async_pair(&ChannelConfig::native());
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = b.read(&mut buf).await.expect("read");
            buf[..n].to_vec()
        });
        tokio::task::yield_now().await;
        a.write_with_handle(b"late", None, &SendOptions::default())
            .await
            .expect("write");
        assert_eq!(reader.await.expect("join"), b"late");
    }

    #[tokio::test]
    async fn handle_crosses_async_native_pair() {
        let (a, b) = async_pair(&ChannelConfig::native());
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = CarriedHandle::from(listener);

        let delivery = a
            .write_with_handle(b"L", Some(&handle), &SendOptions::default())
            .await
            .expect("send");
        assert!(delivery.handle_carried());

        let received = b.recv_with_handle().await.expect("recv");
        assert_eq!(received.payload, b"L");
        let listener = received.handle.expect("handle").into_tcp_listener();
        assert_eq!(listener.local_addr().expect("addr"), addr);
    }

    #[tokio::test]
    async fn large_payload_is_written_in_full() {
        let (a, b) = async_pair(&ChannelConfig::emulated().read_capacity(4096));
        let payload = vec![7u8; 1 << 20];
        let expected = payload.len();

        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut total = 0;
            while total < expected {
                let n = b.read(&mut buf).await.expect("read");
                assert!(n > 0, "peer closed early");
                total += n;
            }
            total
        });

        let delivery = a
            .write_with_handle(&payload, None, &SendOptions::default())
            .await
            .expect("write");
        assert_eq!(delivery, Delivery::Payload { bytes: expected });
        assert_eq!(reader.await.expect("join"), expected);
    }

    #[tokio::test]
    async fn close_deregisters_and_closes() {
        let (a, b) = async_pair(&ChannelConfig::native());
        a.close().expect("close");
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).await.expect("eof"), 0);
        let endpoint = b.into_inner();
        assert_eq!(endpoint.state(), EndpointState::Open);
    }

    /// After a close through `AsyncEndpoint`, a new endpoint registered on
    /// the reused descriptor number keeps receiving wakeups.
    #[tokio::test]
    async fn close_leaves_reused_descriptor_registered() {
        let (a, _a_peer) = async_pair(&ChannelConfig::native());
        let (stale, _stale_peer) = async_pair(&ChannelConfig::native());
        assert_eq!(stale.kind(), ChannelKind::Native);
        stale.close().expect("close");

        let (fresh_peer, fresh) = create_channel_pair_with(&ChannelConfig::native()).expect("pair");
        let fresh = AsyncEndpoint::new(fresh).expect("register fresh");
        drop(a);

        fresh_peer.write(b"hi").expect("write");
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), fresh.read(&mut buf))
            .await
            .expect("fresh endpoint never woke")
            .expect("read");
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test]
    async fn closed_endpoint_cannot_register() {
        let (a, _b) = create_channel_pair_with(&ChannelConfig::native()).expect("pair");
        a.close().expect("close");
        assert!(AsyncEndpoint::new(a).is_err());
    }

    #[test]
    fn would_block_is_detected_through_io_errors() {
        let err = HandoffError::io(Operation::Read, io::Error::from(ErrorKind::WouldBlock));
        assert!(would_block(&err));
        assert!(!would_block(&HandoffError::AlreadyClosed));
    }
}
