//! Channel configuration.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Default bound on a single read, in bytes.
pub const DEFAULT_READ_CAPACITY: usize = 256;

/// Environment variable selecting the channel variant (`native` or `emulated`).
pub const MODE_ENV: &str = "ROAM_HANDOFF_MODE";

/// Environment variable overriding [`ChannelConfig::read_capacity`].
pub const READ_CAPACITY_ENV: &str = "ROAM_HANDOFF_READ_CAPACITY";

/// Which channel variant backs an endpoint pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Kernel socketpair with `SCM_RIGHTS` handle passing (unix only).
    Native,
    /// Loopback TCP rendezvous. Carries payload bytes only.
    Emulated,
}

impl ChannelKind {
    /// The best variant this platform supports.
    pub const fn platform_default() -> Self {
        if cfg!(unix) {
            ChannelKind::Native
        } else {
            ChannelKind::Emulated
        }
    }

    /// Whether this variant can be built on the current platform.
    pub const fn is_available(self) -> bool {
        match self {
            ChannelKind::Native => cfg!(unix),
            ChannelKind::Emulated => true,
        }
    }

    /// Whether endpoints of this variant can carry connection handles.
    pub const fn carries_handles(self) -> bool {
        matches!(self, ChannelKind::Native)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Native => "native",
            ChannelKind::Emulated => "emulated",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when parsing a [`ChannelKind`] from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChannelKind(pub String);

impl fmt::Display for UnknownChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown channel kind {:?} (expected \"native\" or \"emulated\")",
            self.0
        )
    }
}

impl std::error::Error for UnknownChannelKind {}

impl FromStr for ChannelKind {
    type Err = UnknownChannelKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "unix" => Ok(ChannelKind::Native),
            "emulated" | "loopback" => Ok(ChannelKind::Emulated),
            _ => Err(UnknownChannelKind(s.to_string())),
        }
    }
}

/// What an emulated endpoint does when asked to carry a handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnsupportedHandle {
    /// Send the payload and report [`Delivery::Payload`](crate::Delivery::Payload).
    #[default]
    SendPayloadOnly,
    /// Send nothing and fail with
    /// [`HandoffError::HandleTransferUnsupported`](crate::HandoffError::HandleTransferUnsupported).
    Reject,
}

/// Configuration for [`create_channel_pair_with`](crate::create_channel_pair_with).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Variant to build.
    pub kind: ChannelKind,
    /// Upper bound on bytes returned by a single read (at least 1).
    pub read_capacity: usize,
    /// Address the emulated bootstrap listener binds to. Port 0 picks an
    /// ephemeral port.
    pub bootstrap_addr: SocketAddr,
    /// Emulated-path behaviour when a handle is offered.
    pub unsupported_handle: UnsupportedHandle,
    /// Set `TCP_NODELAY` on emulated endpoints.
    pub nodelay: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::platform_default(),
            read_capacity: DEFAULT_READ_CAPACITY,
            bootstrap_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            unsupported_handle: UnsupportedHandle::default(),
            nodelay: true,
        }
    }
}

impl ChannelConfig {
    pub fn native() -> Self {
        Self::default().kind(ChannelKind::Native)
    }

    pub fn emulated() -> Self {
        Self::default().kind(ChannelKind::Emulated)
    }

    pub fn kind(mut self, kind: ChannelKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn read_capacity(mut self, read_capacity: usize) -> Self {
        self.read_capacity = read_capacity.max(1);
        self
    }

    pub fn bootstrap_addr(mut self, addr: SocketAddr) -> Self {
        self.bootstrap_addr = addr;
        self
    }

    pub fn unsupported_handle(mut self, policy: UnsupportedHandle) -> Self {
        self.unsupported_handle = policy;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Defaults overridden by [`MODE_ENV`] and [`READ_CAPACITY_ENV`].
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(MODE_ENV) {
            match value.parse::<ChannelKind>() {
                Ok(kind) => config.kind = kind,
                Err(err) => tracing::warn!(var = MODE_ENV, error = %err, "ignoring channel mode"),
            }
        }

        if let Some(value) = lookup(READ_CAPACITY_ENV) {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.read_capacity = n,
                _ => tracing::warn!(var = READ_CAPACITY_ENV, value = %value, "ignoring read capacity"),
            }
        }

        config
    }
}
