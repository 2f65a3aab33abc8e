//! Parley peer-to-peer chat core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{Keypair, PeerId, PublicKey};
pub use protocol::{Frame, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, LinkFrame};
pub use core::{Action, ChatCore, Event};

pub mod auth;
pub mod backoff;
pub mod call;
pub mod candidates;
pub mod chunk;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod media;
pub mod message;
pub mod messaging;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod peer;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use media::{MediaEvent, MediaProvider};
pub use signaling::{ClientSignal, ServerSignal};
pub use store::{MemoryStore, MessageStore};
pub use transport::{TransportEvent, TransportProvider};
