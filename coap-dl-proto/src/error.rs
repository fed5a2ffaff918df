use thiserror::Error;

use crate::{message::Code, target::InvalidUrl};

/// Reasons a download could not start, or ended without the whole resource
///
/// Errors returned from `Downloader::begin` prevent the transfer from ever starting; all others
/// reach the caller exactly once, through the transfer's completion handler.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DownloadError {
    /// The URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] InvalidUrl),
    /// The URL scheme names no supported transport
    #[error("unsupported protocol")]
    UnsupportedProtocol,
    /// A block handler and a completion handler are both required
    #[error("download handlers missing")]
    MissingHandlers,
    /// The transport could not open a socket for the transfer
    #[error("failed to create socket")]
    SocketCreateFailed,
    /// A block request does not fit in the outbound buffer
    #[error("request too large to encode")]
    EncodingTooLarge,
    /// A response is structurally invalid for a block-wise transfer
    #[error("malformed response")]
    MalformedResponse,
    /// A response carries a block other than the one requested
    #[error("response block offset mismatch")]
    OffsetMismatch,
    /// The server attempted to grow the block size
    #[error("block size renegotiation rejected")]
    RenegotiationRejected,
    /// The resource changed during the transfer
    #[error("resource expired")]
    ResourceExpired,
    /// The server answered with something other than 2.05 Content
    #[error("server responded with {0}")]
    ServerError(Code),
    /// No response, send failure, scheduling failure, sink rejection, or abort
    #[error("transfer failed")]
    TransferFailed,
    /// The registry cannot hold another transfer
    #[error("out of memory")]
    OutOfMemory,
}

impl DownloadError {
    /// Numeric status as seen by callers that use integer status codes
    ///
    /// Server errors map to the negated raw response code. Response validation and send failures
    /// report the same status as [`DownloadError::TransferFailed`].
    pub fn status(&self) -> i32 {
        match *self {
            Self::ServerError(code) => -i32::from(u8::from(code)),
            Self::ResourceExpired => STATUS_EXPIRED,
            Self::TransferFailed
            | Self::EncodingTooLarge
            | Self::MalformedResponse
            | Self::OffsetMismatch
            | Self::RenegotiationRejected => STATUS_FAILED,
            Self::InvalidUrl(_) => -3,
            Self::UnsupportedProtocol => -4,
            Self::MissingHandlers => -5,
            Self::SocketCreateFailed => -6,
            Self::OutOfMemory => -7,
        }
    }
}

/// Status of a transfer that completed successfully
pub const STATUS_SUCCESS: i32 = 0;
const STATUS_FAILED: i32 = -1;
const STATUS_EXPIRED: i32 = -2;

/// Status of a finished transfer
pub fn status(result: &Result<(), DownloadError>) -> i32 {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(e) => e.status(),
    }
}

/// Returned by a block handler to abort the transfer
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("block rejected: {reason}")]
pub struct SinkError {
    reason: String,
}

impl SinkError {
    /// Construct an error with a human readable reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
