//! Native channel: `AF_UNIX` stream socketpair with `SCM_RIGHTS` handle passing.
//!
//! The sender attaches exactly one descriptor to a single `sendmsg`. The
//! kernel installs a new descriptor in the receiver, pointing at the same
//! open socket; closing either copy leaves the other usable.

use std::io::{self, ErrorKind};
use std::mem;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use socket2::Socket;

use crate::config::{ChannelConfig, ChannelKind};
use crate::endpoint::{EndpointCore, EndpointState, TransferChannel};
use crate::error::{HandoffError, Operation, PairStage, Result};
use crate::handle::CarriedHandle;
use crate::transfer::{Delivery, Received, SendFlags, SendOptions};

/// Control buffer room for this many descriptors. A message carrying more
/// than one is rejected, but they still have to fit to be closed.
const MAX_RECEIVED_FDS: usize = 4;

/// Byte sent in place of an empty payload so stream sockets keep the
/// control message.
const PAD_BYTE: [u8; 1] = [0];

/// Endpoint of a kernel socketpair that can carry one handle per message.
pub struct NativeTransferChannel {
    core: EndpointCore,
}

impl NativeTransferChannel {
    pub(crate) fn pair(config: &ChannelConfig) -> Result<(Self, Self)> {
        let (a, b) = socketpair()?;
        tracing::debug!(
            a = a.as_raw_fd(),
            b = b.as_raw_fd(),
            "created native channel pair"
        );
        Ok((
            Self::from_socket(Socket::from(a), config),
            Self::from_socket(Socket::from(b), config),
        ))
    }

    pub(crate) fn from_socket(socket: Socket, config: &ChannelConfig) -> Self {
        Self {
            core: EndpointCore::new(ChannelKind::Native, socket, config.read_capacity),
        }
    }

    pub(crate) fn core(&self) -> &EndpointCore {
        &self.core
    }
}

impl TransferChannel for NativeTransferChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Native
    }

    /// Plain read. A descriptor riding on the bytes read here is discarded
    /// by the kernel; use [`recv_with_handle`](Self::recv_with_handle) to
    /// keep it.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.core.read(buf)
    }

    fn write_with_handle(
        &self,
        payload: &[u8],
        handle: Option<&CarriedHandle>,
        options: &SendOptions,
    ) -> Result<Delivery> {
        if handle.is_none() && options.destination.is_none() {
            return self.core.write_payload(payload, options.flags);
        }

        self.core.with_socket(Operation::Write, |socket| {
            self.core.check_writable(Operation::Write)?;
            let carried = handle.map(AsRawFd::as_raw_fd);
            let data = if payload.is_empty() && carried.is_some() {
                &PAD_BYTE[..]
            } else {
                payload
            };

            let sent = send_with_rights(
                socket.as_raw_fd(),
                data,
                carried,
                options.destination.as_deref(),
                options.flags,
            );

            match (sent, carried) {
                (Ok(n), Some(fd)) if n == data.len() => {
                    tracing::trace!(bytes = n, fd, "sent payload with handle");
                    Ok(Delivery::PayloadAndHandle { bytes: n })
                }
                (Ok(n), Some(_)) => Err(HandoffError::TransferFailed {
                    source: io::Error::new(
                        ErrorKind::WriteZero,
                        format!("short write carrying a handle: {n} of {} bytes", data.len()),
                    ),
                }),
                (Ok(n), None) => Ok(Delivery::Payload { bytes: n }),
                (Err(source), Some(_)) => Err(HandoffError::TransferFailed { source }),
                (Err(source), None) => Err(HandoffError::io(Operation::Write, source)),
            }
        })
    }

    fn recv_with_handle(&self) -> Result<Received> {
        let mut payload = vec![0u8; self.core.read_capacity()];
        let (n, handle) = self.core.with_socket(Operation::Recv, |socket| {
            if self.core.read_shut() {
                return Ok((0, None));
            }
            recv_with_rights(socket.as_raw_fd(), &mut payload)
        })?;
        payload.truncate(n);
        if handle.is_some() {
            tracing::trace!(bytes = n, "received payload with handle");
        }
        Ok(Received {
            payload,
            handle: handle.map(CarriedHandle::from),
        })
    }

    fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.core.shutdown(how)
    }

    fn close(&self) -> Result<()> {
        self.core.close()
    }

    fn state(&self) -> EndpointState {
        self.core.state()
    }
}

fn pair_error(stage: PairStage) -> impl FnOnce(io::Error) -> HandoffError {
    move |source| HandoffError::pair(ChannelKind::Native, stage, source)
}

/// `socketpair(AF_UNIX, SOCK_STREAM)`, both ends close-on-exec.
pub(crate) fn socketpair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let sock_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let sock_type = libc::SOCK_STREAM;

    // SAFETY: `fds` points to 2 valid c_int slots.
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, sock_type, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(pair_error(PairStage::SocketPair)(io::Error::last_os_error()));
    }

    // SAFETY: socketpair succeeded, so both descriptors are open and ours.
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: as above.
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in [&a, &b] {
        set_cloexec(fd.as_raw_fd()).map_err(pair_error(PairStage::Configure))?;
    }

    #[cfg(target_vendor = "apple")]
    for fd in [&a, &b] {
        set_nosigpipe(fd.as_raw_fd()).map_err(pair_error(PairStage::Configure))?;
    }

    Ok((a, b))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_vendor = "apple")]
fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads `one` for the provided length.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast(),
            mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// cmsghdr-aligned control buffer with room for `fd_count` descriptors,
/// plus its `CMSG_SPACE` length in bytes.
fn control_buffer(fd_count: usize) -> (Vec<u64>, usize) {
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<RawFd>()) as u32) } as usize;
    (vec![0u64; space.div_ceil(mem::size_of::<u64>())], space)
}

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    // SAFETY: all-zero is a valid sockaddr_un.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    if bytes.contains(&0) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "destination path contains a NUL byte",
        ));
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "destination path too long for sockaddr_un",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

/// One `sendmsg` with `data` and, if given, one `SCM_RIGHTS` descriptor.
fn send_with_rights(
    sock_fd: RawFd,
    data: &[u8],
    carried: Option<RawFd>,
    destination: Option<&Path>,
    flags: SendFlags,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;

    let mut addr = match destination {
        Some(path) => Some(unix_sockaddr(path)?),
        None => None,
    };
    if let Some((addr, len)) = addr.as_mut() {
        msghdr.msg_name = (addr as *mut libc::sockaddr_un).cast();
        msghdr.msg_namelen = *len;
    }

    let (mut control, space) = match carried {
        Some(_) => control_buffer(1),
        None => (Vec::new(), 0),
    };
    if let Some(fd) = carried {
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = space as _;

        // SAFETY: control buffer sized with CMSG_SPACE and owned here.
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "failed to build SCM_RIGHTS cmsg",
            ));
        }
        // SAFETY: cmsg points into `control`, which has room for one fd.
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    loop {
        // SAFETY: msghdr points to live iov/name/control buffers.
        let n = unsafe { libc::sendmsg(sock_fd, &msghdr, flags.to_libc()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One `recvmsg` into `buf`, collecting at most one descriptor.
fn recv_with_rights(sock_fd: RawFd, buf: &mut [u8]) -> Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let (mut control, space) = control_buffer(MAX_RECEIVED_FDS);

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = control.as_mut_ptr().cast();
    msghdr.msg_controllen = space as _;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    let n = loop {
        // SAFETY: msghdr points to live iov/control buffers.
        let n = unsafe { libc::recvmsg(sock_fd, &mut msghdr, flags) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(HandoffError::io(Operation::Recv, err));
        }
    };

    // Owned right away so every early return below closes them.
    let fds = take_fds(&msghdr);

    if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(HandoffError::TransferFailed {
            source: io::Error::new(ErrorKind::InvalidData, "control message truncated"),
        });
    }
    if fds.len() > 1 {
        return Err(HandoffError::TransferFailed {
            source: io::Error::new(
                ErrorKind::InvalidData,
                format!("expected at most one handle, received {}", fds.len()),
            ),
        });
    }

    let fd = fds.into_iter().next();
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    if let Some(fd) = &fd {
        set_cloexec(fd.as_raw_fd()).map_err(|source| HandoffError::TransferFailed { source })?;
    }
    Ok((n, fd))
}

fn take_fds(msghdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut out = Vec::new();
    // SAFETY: msghdr points at a control buffer filled in by recvmsg.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                let count = cmsg_len.saturating_sub(base_len) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    // The kernel installed this descriptor for us.
                    out.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}
