//! Block-wise CoAP downloads over tokio
//!
//! [CoAP](https://www.rfc-editor.org/rfc/rfc7252) is a compact request/response protocol for
//! constrained devices, carried over UDP. Resources larger than a single datagram are transferred
//! block by block using the Block2 option of [RFC 7959](https://www.rfc-editor.org/rfc/rfc7959).
//! This crate runs the protocol logic of coap-dl-proto on a tokio runtime, opening one UDP socket
//! per download.
//!
//! The entry point of this crate is the [`Client`].
//!
//! # About block-wise downloads
//!
//! Each block is fetched with its own confirmable GET carrying a fresh message id and token. The
//! request is retransmitted with exponential backoff until the server answers, either in the
//! acknowledgement itself or, after an empty acknowledgement, in a separate response. The server
//! may answer with smaller blocks than requested, in which case all later requests use the smaller
//! size. If the server reports a different ETag part way through, the resource changed and the
//! download fails rather than stitching together two versions.
//!
//! Downloads can resume from an arbitrary byte offset. Supplying the ETag seen by the interrupted
//! attempt makes the download fail unless the server still holds the same version.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod client;
mod udp;

pub use proto::{
    status, BlockHandler, Code, ConfigError, DownloadConfig, DownloadError, DownloaderConfig,
    ETag, ETagTooLong, FinishHandler, InvalidUrl, SecurityInfo, SinkError, Target, TransferId,
    TransferRef, TransferState, TransmissionParams, TransportMode, STATUS_SUCCESS,
};

pub use crate::client::{Client, ClientConfig};
pub use crate::udp::UdpTransport;
