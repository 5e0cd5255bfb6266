//! Owned connection handles that can ride along with a message.
//!
//! [`CarriedHandle`] wraps the platform's owned socket type (`OwnedFd` on
//! unix, `OwnedSocket` on Windows). It is move-only: exactly one value owns
//! the descriptor, and the only ways out are [`CarriedHandle::close`], one of
//! the `into_*` conversions, or dropping it.

use std::io;
use std::net::{TcpListener, TcpStream};

#[cfg(unix)]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, AsSocket, BorrowedSocket, OwnedSocket, RawSocket};

#[cfg(unix)]
pub(crate) type OwnedRaw = OwnedFd;
#[cfg(windows)]
pub(crate) type OwnedRaw = OwnedSocket;

/// A connection handle owned by this process, ready to be handed off.
#[derive(Debug)]
pub struct CarriedHandle(OwnedRaw);

impl CarriedHandle {
    /// Duplicate the underlying descriptor. The clone is closed independently.
    pub fn try_clone(&self) -> io::Result<Self> {
        self.0.try_clone().map(Self)
    }

    /// Close the handle, reporting any error from the OS.
    ///
    /// Dropping a `CarriedHandle` also closes it but discards the error.
    pub fn close(self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let fd = self.0.into_raw_fd();
            // SAFETY: `fd` came out of an OwnedFd, so it is open and owned here.
            let rc = unsafe { libc::close(fd) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(windows)]
        {
            drop(self.0);
            Ok(())
        }
    }

    pub fn into_tcp_stream(self) -> TcpStream {
        TcpStream::from(self.0)
    }

    pub fn into_tcp_listener(self) -> TcpListener {
        TcpListener::from(self.0)
    }

    pub fn into_socket(self) -> socket2::Socket {
        socket2::Socket::from(self.0)
    }
}

#[cfg(unix)]
impl CarriedHandle {
    pub fn into_unix_stream(self) -> UnixStream {
        UnixStream::from(self.0)
    }

    pub fn into_owned_fd(self) -> OwnedFd {
        self.0
    }
}

#[cfg(windows)]
impl CarriedHandle {
    pub fn into_owned_socket(self) -> OwnedSocket {
        self.0
    }
}

impl From<OwnedRaw> for CarriedHandle {
    fn from(owned: OwnedRaw) -> Self {
        Self(owned)
    }
}

impl From<TcpStream> for CarriedHandle {
    fn from(stream: TcpStream) -> Self {
        Self(OwnedRaw::from(stream))
    }
}

impl From<TcpListener> for CarriedHandle {
    fn from(listener: TcpListener) -> Self {
        Self(OwnedRaw::from(listener))
    }
}

impl From<socket2::Socket> for CarriedHandle {
    fn from(socket: socket2::Socket) -> Self {
        Self(OwnedRaw::from(socket))
    }
}

#[cfg(unix)]
impl From<UnixStream> for CarriedHandle {
    fn from(stream: UnixStream) -> Self {
        Self(OwnedFd::from(stream))
    }
}

#[cfg(unix)]
impl AsFd for CarriedHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

#[cfg(unix)]
impl AsRawFd for CarriedHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(windows)]
impl AsSocket for CarriedHandle {
    fn as_socket(&self) -> BorrowedSocket<'_> {
        self.0.as_socket()
    }
}

#[cfg(windows)]
impl AsRawSocket for CarriedHandle {
    fn as_raw_socket(&self) -> RawSocket {
        self.0.as_raw_socket()
    }
}
