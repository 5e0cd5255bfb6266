//! Endpoints: one owned side of a channel pair.
//!
//! Both channel variants keep their socket in an [`EndpointCore`], which owns
//! the open/shutdown/closed state machine:
//!
//! ```text
//! Open -> ShutdownRead | ShutdownWrite | ShutdownBoth -> Closed
//! ```
//!
//! Operations borrow the socket under a recursive read lock, so reads and
//! writes from different threads run concurrently, and a `close` waiting for
//! the write lock never holds back `shutdown` or `state`. `close` takes the
//! write lock, which means the descriptor is only released once no operation
//! can still be using its number. `close` does not wake a thread blocked in
//! `read`; call [`Endpoint::shutdown`] for that, before or during the close.

use std::io::{self, Read};
use std::net::Shutdown;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use socket2::Socket;

use crate::config::ChannelKind;
use crate::emulated::EmulatedPayloadOnlyChannel;
use crate::error::{HandoffError, Operation, Result};
use crate::handle::CarriedHandle;
#[cfg(unix)]
use crate::native::NativeTransferChannel;
use crate::transfer::{Delivery, HandOff, HandOffFailed, Received, SendFlags, SendOptions};

const SHUT_READ: u8 = 0b01;
const SHUT_WRITE: u8 = 0b10;
const SHUT_BOTH: u8 = SHUT_READ | SHUT_WRITE;

/// Observable endpoint state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Open,
    ShutdownRead,
    ShutdownWrite,
    ShutdownBoth,
    Closed,
}

/// The operations every channel variant provides.
///
/// [`Endpoint`] implements this by dispatching to the variant it wraps, so
/// callers can stay on one code path and still learn from [`Delivery`]
/// whether a handle actually travelled.
pub trait TransferChannel {
    fn kind(&self) -> ChannelKind;

    /// One blocking read of at most the configured read capacity.
    /// `Ok(0)` means the peer closed its write side, or this side's read
    /// direction is shut down.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send `payload`, attaching `handle` when the variant can carry it.
    fn write_with_handle(
        &self,
        payload: &[u8],
        handle: Option<&CarriedHandle>,
        options: &SendOptions,
    ) -> Result<Delivery>;

    /// Receive one message and at most one carried handle.
    fn recv_with_handle(&self) -> Result<Received>;

    fn shutdown(&self, how: Shutdown) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn state(&self) -> EndpointState;
}

pub(crate) struct EndpointCore {
    kind: ChannelKind,
    socket: RwLock<Option<Socket>>,
    shut: AtomicU8,
    read_capacity: usize,
}

impl EndpointCore {
    pub(crate) fn new(kind: ChannelKind, socket: Socket, read_capacity: usize) -> Self {
        Self {
            kind,
            socket: RwLock::new(Some(socket)),
            shut: AtomicU8::new(0),
            read_capacity: read_capacity.max(1),
        }
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn read_capacity(&self) -> usize {
        self.read_capacity
    }

    /// Run `f` against the open socket, or fail with `EndpointClosed`.
    pub(crate) fn with_socket<T>(
        &self,
        op: Operation,
        f: impl FnOnce(&Socket) -> Result<T>,
    ) -> Result<T> {
        let guard = self.socket.read_recursive();
        match guard.as_ref() {
            Some(socket) => f(socket),
            None => Err(HandoffError::EndpointClosed { op }),
        }
    }

    pub(crate) fn read_shut(&self) -> bool {
        self.shut.load(Ordering::Acquire) & SHUT_READ != 0
    }

    /// Fails with `EndpointClosed` once the write direction is shut down.
    pub(crate) fn check_writable(&self, op: Operation) -> Result<()> {
        if self.shut.load(Ordering::Acquire) & SHUT_WRITE != 0 {
            return Err(HandoffError::EndpointClosed { op });
        }
        Ok(())
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_socket(Operation::Read, |socket| {
            if buf.is_empty() {
                return Err(HandoffError::io(
                    Operation::Read,
                    io::Error::new(io::ErrorKind::InvalidInput, "read into an empty buffer"),
                ));
            }
            if self.read_shut() {
                return Ok(0);
            }
            let limit = buf.len().min(self.read_capacity);
            read_retrying(socket, &mut buf[..limit])
        })
    }

    /// Receive into a fresh buffer of `read_capacity` bytes.
    pub(crate) fn recv_payload(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.read_capacity];
        let n = self.with_socket(Operation::Recv, |socket| {
            if self.read_shut() {
                return Ok(0);
            }
            read_retrying(socket, &mut buf)
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write all of `payload` without ancillary data.
    ///
    /// In non-blocking mode a `WouldBlock` after some bytes went out is
    /// reported as a short [`Delivery::Payload`] instead of an error.
    pub(crate) fn write_payload(&self, payload: &[u8], flags: SendFlags) -> Result<Delivery> {
        self.with_socket(Operation::Write, |socket| {
            self.check_writable(Operation::Write)?;
            let mut written = 0;
            while written < payload.len() {
                match send_flags(socket, &payload[written..], flags) {
                    Ok(0) => {
                        return Err(HandoffError::io(
                            Operation::Write,
                            io::Error::from(io::ErrorKind::WriteZero),
                        ));
                    }
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock && written > 0 => break,
                    Err(e) => return Err(HandoffError::io(Operation::Write, e)),
                }
            }
            Ok(Delivery::Payload { bytes: written })
        })
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.with_socket(Operation::Shutdown, |socket| {
            let bits = match how {
                Shutdown::Read => SHUT_READ,
                Shutdown::Write => SHUT_WRITE,
                Shutdown::Both => SHUT_BOTH,
            };
            let prev = self.shut.fetch_or(bits, Ordering::AcqRel);
            if prev & bits == bits {
                return Err(HandoffError::AlreadyShutDown { how });
            }

            match socket.shutdown(how) {
                Ok(()) => Ok(()),
                // The peer is already gone; the direction is down either way.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(e) => {
                    self.shut.fetch_and(!(bits & !prev), Ordering::AcqRel);
                    Err(HandoffError::io(Operation::Shutdown, e))
                }
            }
        })
    }

    pub(crate) fn close(&self) -> Result<()> {
        let socket = self.socket.write().take();
        let Some(socket) = socket else {
            return Err(HandoffError::AlreadyClosed);
        };
        self.shut.store(SHUT_BOTH, Ordering::Release);
        tracing::debug!(kind = %self.kind, "closing endpoint");
        CarriedHandle::from(socket)
            .close()
            .map_err(|e| HandoffError::io(Operation::Close, e))
    }

    /// Take the socket out, leaving the endpoint closed.
    pub(crate) fn release(&self) -> Result<Socket> {
        let socket = self.socket.write().take();
        self.shut.store(SHUT_BOTH, Ordering::Release);
        socket.ok_or(HandoffError::EndpointClosed {
            op: Operation::Release,
        })
    }

    pub(crate) fn state(&self) -> EndpointState {
        if self.socket.read_recursive().is_none() {
            return EndpointState::Closed;
        }
        match self.shut.load(Ordering::Acquire) {
            0 => EndpointState::Open,
            SHUT_READ => EndpointState::ShutdownRead,
            SHUT_WRITE => EndpointState::ShutdownWrite,
            _ => EndpointState::ShutdownBoth,
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_socket(Operation::SetOption, |socket| {
            socket
                .set_read_timeout(timeout)
                .map_err(|e| HandoffError::io(Operation::SetOption, e))
        })
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_socket(Operation::SetOption, |socket| {
            socket
                .set_write_timeout(timeout)
                .map_err(|e| HandoffError::io(Operation::SetOption, e))
        })
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.with_socket(Operation::SetOption, |socket| {
            socket
                .set_nonblocking(nonblocking)
                .map_err(|e| HandoffError::io(Operation::SetOption, e))
        })
    }
}

fn read_retrying(mut socket: &Socket, buf: &mut [u8]) -> Result<usize> {
    loop {
        match socket.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HandoffError::io(Operation::Read, e)),
        }
    }
}

fn send_flags(socket: &Socket, buf: &[u8], flags: SendFlags) -> io::Result<usize> {
    #[cfg(unix)]
    {
        socket.send_with_flags(buf, flags.to_libc())
    }
    #[cfg(not(unix))]
    {
        let _ = flags;
        socket.send(buf)
    }
}

/// One side of a channel pair.
///
/// Which variant backs it is fixed at creation; see
/// [`create_channel_pair_with`](crate::create_channel_pair_with).
pub enum Endpoint {
    #[cfg(unix)]
    Native(NativeTransferChannel),
    Emulated(EmulatedPayloadOnlyChannel),
}

impl Endpoint {
    fn channel(&self) -> &dyn TransferChannel {
        match self {
            #[cfg(unix)]
            Endpoint::Native(channel) => channel,
            Endpoint::Emulated(channel) => channel,
        }
    }

    pub(crate) fn core(&self) -> &EndpointCore {
        match self {
            #[cfg(unix)]
            Endpoint::Native(channel) => channel.core(),
            Endpoint::Emulated(channel) => channel.core(),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.core().kind()
    }

    /// Whether this endpoint can carry connection handles.
    pub fn carries_handles(&self) -> bool {
        self.kind().carries_handles()
    }

    pub fn state(&self) -> EndpointState {
        self.core().state()
    }

    /// Upper bound on bytes returned by one read.
    pub fn read_capacity(&self) -> usize {
        self.core().read_capacity()
    }

    /// One blocking read of at most [`read_capacity`](Self::read_capacity)
    /// bytes. `Ok(0)` means end of stream; an empty `buf` is rejected with
    /// `InvalidInput` so it cannot be mistaken for that.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.channel().read(buf)
    }

    /// Send payload bytes only.
    pub fn write(&self, payload: &[u8]) -> Result<Delivery> {
        self.channel()
            .write_with_handle(payload, None, &SendOptions::default())
    }

    pub fn write_with_handle(
        &self,
        payload: &[u8],
        handle: Option<&CarriedHandle>,
        options: &SendOptions,
    ) -> Result<Delivery> {
        self.channel().write_with_handle(payload, handle, options)
    }

    pub fn recv_with_handle(&self) -> Result<Received> {
        self.channel().recv_with_handle()
    }

    /// Give `handle` away to the peer.
    ///
    /// When the handle travelled, the sender's copy is closed and the peer's
    /// duplicate is the only one left. When it could not travel (emulated
    /// channel) the payload was still sent and the handle comes back in
    /// [`HandOff::NotCarried`]. On error nothing is given away and the handle
    /// is returned inside [`HandOffFailed`].
    pub fn hand_off(
        &self,
        payload: &[u8],
        handle: CarriedHandle,
    ) -> std::result::Result<HandOff, HandOffFailed> {
        match self.write_with_handle(payload, Some(&handle), &SendOptions::default()) {
            Ok(Delivery::PayloadAndHandle { bytes }) => {
                if let Err(err) = handle.close() {
                    tracing::warn!(error = %err, "closing handed-off handle failed");
                }
                Ok(HandOff::Carried { bytes })
            }
            Ok(Delivery::Payload { bytes }) => Ok(HandOff::NotCarried { bytes, handle }),
            Err(error) => Err(HandOffFailed { error, handle }),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.channel().shutdown(how)
    }

    /// Release the native handle. A second call fails with
    /// [`HandoffError::AlreadyClosed`].
    pub fn close(&self) -> Result<()> {
        self.channel().close()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core().set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core().set_write_timeout(timeout)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.core().set_nonblocking(nonblocking)
    }
}

impl TransferChannel for Endpoint {
    fn kind(&self) -> ChannelKind {
        Endpoint::kind(self)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Endpoint::read(self, buf)
    }

    fn write_with_handle(
        &self,
        payload: &[u8],
        handle: Option<&CarriedHandle>,
        options: &SendOptions,
    ) -> Result<Delivery> {
        Endpoint::write_with_handle(self, payload, handle, options)
    }

    fn recv_with_handle(&self) -> Result<Received> {
        Endpoint::recv_with_handle(self)
    }

    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Endpoint::shutdown(self, how)
    }

    fn close(&self) -> Result<()> {
        Endpoint::close(self)
    }

    fn state(&self) -> EndpointState {
        Endpoint::state(self)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(unix)]
mod inherit {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use super::*;
    use crate::config::ChannelConfig;

    impl Endpoint {
        /// The CLI argument name used by [`to_arg`](Self::to_arg).
        pub const ARG_NAME: &'static str = "--handoff-fd";

        /// Rebuild an endpoint around a socket, e.g. one inherited by a
        /// child process. `config.kind` must match the kind of the socket.
        pub fn from_owned_fd(fd: OwnedFd, config: &ChannelConfig) -> Endpoint {
            let socket = Socket::from(fd);
            match config.kind {
                ChannelKind::Native => {
                    Endpoint::Native(NativeTransferChannel::from_socket(socket, config))
                }
                ChannelKind::Emulated => {
                    Endpoint::Emulated(EmulatedPayloadOnlyChannel::from_socket(socket, config))
                }
            }
        }

        /// Take the socket out of the endpoint. The endpoint ends up closed.
        pub fn into_owned_fd(self) -> Result<OwnedFd> {
            self.core().release().map(OwnedFd::from)
        }

        /// The raw descriptor, while the endpoint is open.
        pub fn raw_fd(&self) -> Option<RawFd> {
            self.core()
                .with_socket(Operation::Read, |socket| Ok(socket.as_raw_fd()))
                .ok()
        }

        /// Let the descriptor survive `exec` so a spawned child inherits it.
        pub fn set_inheritable(&self, inheritable: bool) -> Result<()> {
            self.core().with_socket(Operation::SetOption, |socket| {
                socket
                    .set_cloexec(!inheritable)
                    .map_err(|e| HandoffError::io(Operation::SetOption, e))
            })
        }

        /// Format the descriptor as a command-line argument value.
        pub fn to_arg(&self) -> Option<String> {
            self.raw_fd().map(|fd| fd.to_string())
        }

        /// Parse an inherited descriptor from a command-line argument value.
        ///
        /// # Safety
        /// The descriptor must be open and not owned by anything else. This is
        /// typically only true in a child process that inherited it.
        pub unsafe fn from_arg(
            s: &str,
            config: &ChannelConfig,
        ) -> std::result::Result<Endpoint, std::num::ParseIntError> {
            let fd: RawFd = s.parse()?;
            // SAFETY: caller guarantees `fd` is open and unowned.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            Ok(Endpoint::from_owned_fd(owned, config))
        }
    }
}
