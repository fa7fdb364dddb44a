use std::num::ParseIntError;
use std::time::SystemTimeError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates an unsupported transport protocol was requested.
    #[error("invalid transport protocol type")]
    ErrProtoType,

    /// Indicates a port outside the configured harvesting range.
    #[error("invalid port range")]
    ErrPortRange,

    /// Indicates harvesting could not bind a local socket.
    #[error("failed to bind local socket")]
    ErrBindFailure,

    /// Indicates local username fragment insufficient bits are provided.
    /// Have to be at least 24 bits long.
    #[error("local username fragment is less than 24 bits long")]
    ErrLocalUfragInsufficientBits,

    /// Indicates local password insufficient bits are provided.
    /// Have to be at least 128 bits long.
    #[error("local password is less than 128 bits long")]
    ErrLocalPwdInsufficientBits,

    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates the agent was started with an empty remote ufrag.
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,

    /// Indicates the agent was started with an empty remote pwd.
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,

    /// Indicates a media stream name was registered twice.
    #[error("media stream already exists")]
    ErrStreamAlreadyExists,

    /// Indicates an operation referenced a media stream the agent does not own.
    #[error("no such media stream")]
    ErrUnknownStream,

    /// Indicates a component id was registered twice within a stream.
    #[error("component already exists")]
    ErrComponentAlreadyExists,

    /// Indicates an operation referenced a component the stream does not own.
    #[error("no such component")]
    ErrUnknownComponent,

    /// Indicates a component id outside [1, 256].
    #[error("component id out of range")]
    ErrComponentIdOutOfRange,

    /// Indicates agent does not have a valid candidate pair.
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,

    /// Indicates nomination was requested for a pair that is not validated.
    #[error("pair is not in the valid list")]
    ErrPairNotValidated,

    /// Indicates a send on a candidate with no underlying socket.
    #[error("failed to send packet")]
    ErrSendPacket,

    /// Indicates the component socket can't write STUN messages.
    #[error("the component socket can't write STUN messages")]
    ErrWriteStunMessage,

    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse component")]
    ErrParseComponent,
    #[error("could not parse priority")]
    ErrParsePriority,
    #[error("could not parse port")]
    ErrParsePort,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("failed to get XOR-MAPPED-ADDRESS response")]
    ErrGetXorMappedAddrResponse,
    #[error("unable to determine networkType")]
    ErrDetermineNetworkType,
    #[error("all retransmissions for transaction failed")]
    ErrAllRetransmissionsFailed,
    #[error("no transaction with id")]
    ErrTransactionNotFound,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    ParseUrl(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}
