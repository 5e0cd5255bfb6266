//! Emulated channel: a connected pair built from a loopback TCP rendezvous.
//!
//! Used where the kernel has no local socketpair, or on request elsewhere.
//! Bytes flow both ways like a socketpair, but there is no way to duplicate
//! a handle into the peer at the socket layer: a send that asks to carry one
//! either goes out payload-only and says so, or is refused, depending on
//! [`UnsupportedHandle`].

use std::io;
use std::net::Shutdown;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::{ChannelConfig, ChannelKind, UnsupportedHandle};
use crate::endpoint::{EndpointCore, EndpointState, TransferChannel};
use crate::error::{HandoffError, PairStage, Result};
use crate::handle::CarriedHandle;
use crate::transfer::{Delivery, Received, SendOptions};

/// Endpoint of a loopback pair. Carries payload bytes only.
pub struct EmulatedPayloadOnlyChannel {
    core: EndpointCore,
    unsupported_handle: UnsupportedHandle,
}

impl EmulatedPayloadOnlyChannel {
    pub(crate) fn pair(config: &ChannelConfig) -> Result<(Self, Self)> {
        let (accepted, connected) = loopback_pair(config)?;
        Ok((
            Self::from_socket(accepted, config),
            Self::from_socket(connected, config),
        ))
    }

    pub(crate) fn from_socket(socket: Socket, config: &ChannelConfig) -> Self {
        Self {
            core: EndpointCore::new(ChannelKind::Emulated, socket, config.read_capacity),
            unsupported_handle: config.unsupported_handle,
        }
    }

    pub(crate) fn core(&self) -> &EndpointCore {
        &self.core
    }
}

impl TransferChannel for EmulatedPayloadOnlyChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Emulated
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.core.read(buf)
    }

    fn write_with_handle(
        &self,
        payload: &[u8],
        handle: Option<&CarriedHandle>,
        options: &SendOptions,
    ) -> Result<Delivery> {
        if handle.is_some() {
            match self.unsupported_handle {
                UnsupportedHandle::Reject => {
                    return Err(HandoffError::HandleTransferUnsupported {
                        kind: ChannelKind::Emulated,
                    });
                }
                UnsupportedHandle::SendPayloadOnly => {
                    tracing::warn!(
                        bytes = payload.len(),
                        "emulated channel cannot carry handles; sending payload only"
                    );
                }
            }
        }
        self.core.write_payload(payload, options.flags)
    }

    fn recv_with_handle(&self) -> Result<Received> {
        let payload = self.core.recv_payload()?;
        Ok(Received {
            payload,
            handle: None,
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
    move |source| HandoffError::pair(ChannelKind::Emulated, stage, source)
}

fn stream_socket(domain: Domain) -> Result<Socket> {
    Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(pair_error(PairStage::Socket))
}

/// Build a connected `(accepted, connecting)` pair over loopback.
///
/// Each step owns what it opened, so an early return drops (and closes)
/// every socket created so far.
pub(crate) fn loopback_pair(config: &ChannelConfig) -> Result<(Socket, Socket)> {
    let bootstrap = config.bootstrap_addr;
    if !bootstrap.ip().is_loopback() {
        return Err(pair_error(PairStage::Bind)(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bootstrap address {bootstrap} is not a loopback address"),
        )));
    }
    let domain = Domain::for_address(bootstrap);

    let listener = stream_socket(domain)?;
    listener
        .bind(&SockAddr::from(bootstrap))
        .map_err(pair_error(PairStage::Bind))?;
    listener.listen(1).map_err(pair_error(PairStage::Listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(pair_error(PairStage::LocalAddr))?;

    let connecting = stream_socket(domain)?;
    connecting
        .connect(&listen_addr)
        .map_err(pair_error(PairStage::Connect))?;

    let (accepted, peer_addr) = listener.accept().map_err(pair_error(PairStage::Accept))?;
    drop(listener);

    // Anything else on the host could have raced into the listener first.
    let local_addr = connecting
        .local_addr()
        .map_err(pair_error(PairStage::LocalAddr))?;
    if peer_addr.as_socket() != local_addr.as_socket() {
        return Err(pair_error(PairStage::Accept)(io::Error::new(
            io::ErrorKind::InvalidData,
            "bootstrap listener accepted a connection from an unexpected peer",
        )));
    }

    if config.nodelay {
        for socket in [&accepted, &connecting] {
            socket
                .set_nodelay(true)
                .map_err(pair_error(PairStage::Configure))?;
        }
    }

    tracing::debug!(
        addr = ?listen_addr.as_socket(),
        "created emulated channel pair"
    );
    Ok((accepted, connecting))
}
