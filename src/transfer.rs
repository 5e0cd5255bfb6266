//! Message types of the handle transfer protocol.
//!
//! One message is one payload plus zero or one carried handle. Send results
//! always say whether the handle travelled ([`Delivery`]); receive results
//! hand back at most one handle ([`Received`]).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

use crate::error::HandoffError;
use crate::handle::CarriedHandle;

/// Outcome of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload bytes were written; no handle travelled with them.
    Payload { bytes: usize },
    /// Payload bytes and exactly one handle were written.
    PayloadAndHandle { bytes: usize },
}

impl Delivery {
    pub fn handle_carried(self) -> bool {
        matches!(self, Delivery::PayloadAndHandle { .. })
    }

    /// Payload bytes written (the padding byte of an empty handle-only
    /// message counts).
    pub fn bytes(self) -> usize {
        match self {
            Delivery::Payload { bytes } | Delivery::PayloadAndHandle { bytes } => bytes,
        }
    }
}

/// Outcome of [`Endpoint::hand_off`](crate::Endpoint::hand_off).
#[derive(Debug)]
pub enum HandOff {
    /// The peer now owns a duplicate; the sender's copy has been closed.
    Carried { bytes: usize },
    /// Only the payload was sent. The handle is still the caller's.
    NotCarried { bytes: usize, handle: CarriedHandle },
}

impl HandOff {
    pub fn handle_carried(&self) -> bool {
        matches!(self, HandOff::Carried { .. })
    }
}

/// A failed [`Endpoint::hand_off`](crate::Endpoint::hand_off). Nothing was
/// given away, so the handle comes back with the error.
#[derive(Debug)]
pub struct HandOffFailed {
    pub error: HandoffError,
    pub handle: CarriedHandle,
}

impl fmt::Display for HandOffFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hand-off failed: {}", self.error)
    }
}

impl std::error::Error for HandOffFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<HandOffFailed> for HandoffError {
    fn from(failed: HandOffFailed) -> Self {
        failed.error
    }
}

/// One received message.
#[derive(Debug, Default)]
pub struct Received {
    pub payload: Vec<u8>,
    pub handle: Option<CarriedHandle>,
}

impl Received {
    /// Zero bytes and no handle: the peer closed its write side.
    pub fn is_peer_closed(&self) -> bool {
        self.payload.is_empty() && self.handle.is_none()
    }
}

/// Flags for a single send.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SendFlags(u32);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    /// Fail with `WouldBlock` instead of blocking when the socket buffer is
    /// full.
    pub const DONT_WAIT: SendFlags = SendFlags(1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[cfg(unix)]
    pub(crate) fn to_libc(self) -> libc::c_int {
        let mut flags = 0;
        if self.contains(SendFlags::DONT_WAIT) {
            flags |= libc::MSG_DONTWAIT;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            flags |= libc::MSG_NOSIGNAL;
        }
        flags
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SendFlags {
    fn bitor_assign(&mut self, rhs: SendFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SendFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(SendFlags::DONT_WAIT) {
            f.write_str("SendFlags(DONT_WAIT)")
        } else {
            f.write_str("SendFlags(NONE)")
        }
    }
}

/// Per-send options.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Unix socket path to address the message to. Only meaningful for
    /// address-oriented sockets: connected pairs reject it on the native path
    /// and the emulated path ignores it.
    pub destination: Option<PathBuf>,
    pub flags: SendFlags,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }
}
