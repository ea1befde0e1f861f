//! # IC RPC
//!
//! A multiplexed RPC channel runtime: an ASN.1 BER codec, an IOP XML
//! codec, an IOP JSON codec, the IOP Channel (IC) binary transport and
//! its dispatch layer, and an HTTP gateway that lets the same
//! registrations be reached over JSON or SOAP.

pub mod asn1;
pub mod ber;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod ic;
pub mod iop_json;
pub mod iop_xml;
pub mod logging;
pub mod registry;

pub use config::GatewayConfig;
pub use dispatch::{Cbe, DispatchOutcome, IcHeader, Registration, ReplySender, Router};
pub use error::{IcError, IcResult, IcStatus};
pub use gateway::{RpcEntry, Trigger};
pub use ic::{ChannelConfig, ChannelState, IcChannel};
pub use registry::{DescriptorRef, Registry};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
