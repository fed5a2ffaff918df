//! Low-level protocol logic for block-wise CoAP downloads
//!
//! coap-dl-proto contains a fully deterministic implementation of block-wise GET transfers
//! (RFC 7252, RFC 7959). It contains no networking code and never reads a clock: sockets are
//! supplied through the [`Transport`] trait and time through the [`Scheduler`] trait. Most users
//! want the tokio-based `coap-dl` crate instead.
//!
//! The central type is [`Downloader`], the registry of in-flight transfers. Each transfer
//! requests one block at a time, checks every response against the request it answers,
//! retransmits unanswered requests with exponential backoff, and reports its outcome exactly once
//! through the handlers in its [`DownloadConfig`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![cfg_attr(test, allow(dead_code))]
#![allow(clippy::too_many_arguments)]

mod block;
pub use crate::block::{
    max_acceptable_block_size, BlockError, BlockInfo, MAX_BLOCK_SIZE, MAX_SEQ_NUM, MIN_BLOCK_SIZE,
};

#[doc(hidden)]
pub mod coding;

mod config;
pub use crate::config::{ConfigError, DownloaderConfig, TransmissionParams};

mod downloader;
pub use crate::downloader::{Buffers, Downloader, TransferId, TransferRef, TransferState};

mod error;
pub use crate::error::{status, DownloadError, SinkError, STATUS_SUCCESS};

mod etag;
pub use crate::etag::{ETag, ETagTooLong};

pub mod message;
pub use crate::message::{Code, Message, MessageBuilder, MsgIdentity, MsgType, Token};

mod retry;
pub use crate::retry::Backoff;

mod sched;
pub use crate::sched::{Job, JobHandle, JobKind, JobOutcome, ScheduleError, Scheduler, TimerQueue};

mod target;
pub use crate::target::{InvalidUrl, Target};

mod transfer;
pub use crate::transfer::{BlockHandler, DownloadConfig, FinishHandler};

mod transport;
pub use crate::transport::{DatagramSocket, SecurityInfo, Transport, TransportMode};
