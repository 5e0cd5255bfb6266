#![doc = include_str!("../README.md")]

pub mod config;
pub mod emulated;
pub mod endpoint;
pub mod error;
pub mod handle;
#[cfg(unix)]
pub mod native;
#[cfg(all(unix, feature = "tokio"))]
pub mod nonblocking;
pub mod pair;
pub mod transfer;

pub use std::net::Shutdown;

pub use config::{
    ChannelConfig, ChannelKind, DEFAULT_READ_CAPACITY, MODE_ENV, READ_CAPACITY_ENV,
    UnknownChannelKind, UnsupportedHandle,
};
pub use emulated::EmulatedPayloadOnlyChannel;
pub use endpoint::{Endpoint, EndpointState, TransferChannel};
pub use error::{HandoffError, Operation, PairStage, Phase, Result};
pub use handle::CarriedHandle;
#[cfg(unix)]
pub use native::NativeTransferChannel;
#[cfg(all(unix, feature = "tokio"))]
pub use nonblocking::AsyncEndpoint;
pub use pair::{create_channel_pair, create_channel_pair_with};
pub use transfer::{Delivery, HandOff, HandOffFailed, Received, SendFlags, SendOptions};
