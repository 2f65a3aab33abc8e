//! Crate-level error: per-module errors aggregated for the host-facing API.

use crate::call::CallError;
use crate::chunk::ReconstructionError;
use crate::crypto::{DecryptionError, EncryptError, KeyExchangeError};
use crate::identity::PeerId;
use crate::media::{MediaAcquisitionError, MediaError};
use crate::peer::PeerError;
use crate::protocol::FrameError;
use crate::transfer::TransferError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no transport session with {0}")]
    TransportUnavailable(PeerId),
    #[error("sub-channel to {0} is not open")]
    ChannelUnavailable(PeerId),
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    #[error(transparent)]
    Encrypt(#[from] EncryptError),
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
    #[error(transparent)]
    Transfer(TransferError),
    #[error(transparent)]
    MediaAcquisition(MediaAcquisitionError),
    #[error(transparent)]
    Media(MediaError),
    #[error(transparent)]
    Call(CallError),
    #[error("{0} did not answer before the call timeout")]
    SignalingTimeout(PeerId),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<PeerError> for Error {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::TransportUnavailable(p) => Error::TransportUnavailable(p),
            PeerError::ChannelUnavailable(p) => Error::ChannelUnavailable(p),
            PeerError::Transport(t) => Error::Transport(t),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<TransferError> for Error {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Reconstruction { source, .. } => Error::Reconstruction(source),
            other => Error::Transfer(other),
        }
    }
}

impl From<CallError> for Error {
    fn from(e: CallError) -> Self {
        match e {
            CallError::MediaAcquisition(m) => Error::MediaAcquisition(m),
            CallError::Media(m) => Error::Media(m),
            other => Error::Call(other),
        }
    }
}

impl From<MediaAcquisitionError> for Error {
    fn from(e: MediaAcquisitionError) -> Self {
        Error::MediaAcquisition(e)
    }
}

impl From<MediaError> for Error {
    fn from(e: MediaError) -> Self {
        Error::Media(e)
    }
}
