//! Errors for pair creation, handle transfer and endpoint lifecycle.
//!
//! Every failure says which phase it came from (see [`Phase`]) so callers can
//! pick a platform-specific fallback. Nothing in this crate retries on its own.

use std::fmt;
use std::io;
use std::net::Shutdown;

use crate::config::ChannelKind;

/// The phase an operation failed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Allocating or rendezvousing the two endpoints.
    PairCreation,
    /// Attaching or receiving a carried handle.
    Transfer,
    /// Endpoint state: closed, shut down, double close.
    Lifecycle,
    /// Plain transport I/O on an open endpoint.
    Io,
}

/// The step of pair creation that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairStage {
    /// The requested variant cannot be built on this platform.
    Unavailable,
    /// `socketpair(2)`.
    SocketPair,
    /// Opening one of the loopback sockets.
    Socket,
    /// Binding the bootstrap listener.
    Bind,
    /// Putting the bootstrap listener into listening state.
    Listen,
    /// Reading back the listener's assigned address.
    LocalAddr,
    /// Connecting the client side to the listener.
    Connect,
    /// Accepting the inbound side.
    Accept,
    /// Socket options applied after creation.
    Configure,
}

impl PairStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PairStage::Unavailable => "unavailable",
            PairStage::SocketPair => "socketpair",
            PairStage::Socket => "socket",
            PairStage::Bind => "bind",
            PairStage::Listen => "listen",
            PairStage::LocalAddr => "local_addr",
            PairStage::Connect => "connect",
            PairStage::Accept => "accept",
            PairStage::Configure => "configure",
        }
    }
}

impl fmt::Display for PairStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint operation named in lifecycle and I/O errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Recv,
    Shutdown,
    Close,
    SetOption,
    Release,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Recv => "recv",
            Operation::Shutdown => "shutdown",
            Operation::Close => "close",
            Operation::SetOption => "set_option",
            Operation::Release => "release",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum HandoffError {
    /// Some step of building a channel pair failed. Everything opened before
    /// the failure has already been released.
    PairCreationFailed {
        kind: ChannelKind,
        stage: PairStage,
        source: io::Error,
    },
    /// A handle was offered on a channel that cannot carry one. Nothing was
    /// sent.
    HandleTransferUnsupported { kind: ChannelKind },
    /// The native send carrying a handle failed. The payload may or may not
    /// have reached the peer.
    TransferFailed { source: io::Error },
    /// The endpoint was closed, or the direction needed by `op` was shut down.
    EndpointClosed { op: Operation },
    /// `close` was called on an endpoint that is already closed.
    AlreadyClosed,
    /// Every direction requested by `shutdown` was already shut down.
    AlreadyShutDown { how: Shutdown },
    /// Transport I/O failure on an open endpoint.
    Io { op: Operation, source: io::Error },
}

impl HandoffError {
    pub(crate) fn pair(kind: ChannelKind, stage: PairStage, source: io::Error) -> Self {
        HandoffError::PairCreationFailed {
            kind,
            stage,
            source,
        }
    }

    pub(crate) fn io(op: Operation, source: io::Error) -> Self {
        HandoffError::Io { op, source }
    }

    pub fn phase(&self) -> Phase {
        match self {
            HandoffError::PairCreationFailed { .. } => Phase::PairCreation,
            HandoffError::HandleTransferUnsupported { .. } | HandoffError::TransferFailed { .. } => {
                Phase::Transfer
            }
            HandoffError::EndpointClosed { .. }
            | HandoffError::AlreadyClosed
            | HandoffError::AlreadyShutDown { .. } => Phase::Lifecycle,
            HandoffError::Io { .. } => Phase::Io,
        }
    }

    /// The underlying OS error, if this failure came from the transport.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            HandoffError::PairCreationFailed { source, .. }
            | HandoffError::TransferFailed { source }
            | HandoffError::Io { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the caller should switch to another hand-off strategy, e.g.
    /// having the peer open its own connection.
    pub fn needs_fallback(&self) -> bool {
        matches!(self, HandoffError::HandleTransferUnsupported { .. })
    }
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::PairCreationFailed {
                kind,
                stage,
                source,
            } => write!(f, "{kind} channel pair creation failed at {stage}: {source}"),
            HandoffError::HandleTransferUnsupported { kind } => {
                write!(f, "{kind} channel cannot carry connection handles")
            }
            HandoffError::TransferFailed { source } => {
                write!(f, "handle transfer failed: {source}")
            }
            HandoffError::EndpointClosed { op } => write!(f, "{op} on closed endpoint"),
            HandoffError::AlreadyClosed => f.write_str("endpoint already closed"),
            HandoffError::AlreadyShutDown { how } => {
                write!(f, "endpoint already shut down ({how:?})")
            }
            HandoffError::Io { op, source } => write!(f, "{op} failed: {source}"),
        }
    }
}

impl std::error::Error for HandoffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.io_error().map(|e| e as _)
    }
}

pub type Result<T, E = HandoffError> = std::result::Result<T, E>;
