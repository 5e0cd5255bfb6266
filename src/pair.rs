//! Channel factory.

use crate::config::{ChannelConfig, ChannelKind};
use crate::emulated::EmulatedPayloadOnlyChannel;
use crate::endpoint::Endpoint;
use crate::error::Result;
#[cfg(unix)]
use crate::native::NativeTransferChannel;

/// Create a connected pair using the platform default channel kind.
///
/// On unix this is a kernel socketpair that can carry handles; elsewhere it is
/// a loopback TCP pair that carries payload bytes only.
pub fn create_channel_pair() -> Result<(Endpoint, Endpoint)> {
    create_channel_pair_with(&ChannelConfig::default())
}

/// Create a connected pair with an explicit configuration.
///
/// Either both endpoints come back usable, or an error comes back and every
/// socket opened along the way has already been closed.
pub fn create_channel_pair_with(config: &ChannelConfig) -> Result<(Endpoint, Endpoint)> {
    match config.kind {
        #[cfg(unix)]
        ChannelKind::Native => {
            let (a, b) = NativeTransferChannel::pair(config)?;
            Ok((Endpoint::Native(a), Endpoint::Native(b)))
        }
        #[cfg(not(unix))]
        ChannelKind::Native => Err(crate::error::HandoffError::pair(
            ChannelKind::Native,
            crate::error::PairStage::Unavailable,
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "native socket pairs need AF_UNIX with SCM_RIGHTS",
            ),
        )),
        ChannelKind::Emulated => {
            let (a, b) = EmulatedPayloadOnlyChannel::pair(config)?;
            Ok((Endpoint::Emulated(a), Endpoint::Emulated(b)))
        }
    }
}
