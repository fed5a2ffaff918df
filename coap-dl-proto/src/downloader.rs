use std::{collections::BTreeMap, fmt, mem};

use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::{
    config::DownloaderConfig,
    error::DownloadError,
    etag::ETag,
    message::IdSource,
    sched::{Job, JobHandle, JobOutcome, Scheduler},
    target::Target,
    transfer::{Context, DownloadConfig, Phase, Status, Transfer},
    transport::{Transport, TransportMode},
};

/// Identifies a transfer within its `Downloader`
///
/// Allocated in increasing order and never reused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransferId(pub(crate) u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Scratch buffers shared by all transfers
///
/// Borrowed for the duration of a single event; sized once from the [`DownloaderConfig`].
#[derive(Debug, Clone)]
pub struct Buffers {
    pub(crate) inbound: Vec<u8>,
    pub(crate) outbound: Vec<u8>,
}

impl Buffers {
    /// Allocate buffers matching `config`
    pub fn new(config: &DownloaderConfig) -> Self {
        Self {
            inbound: vec![0; config.in_buffer_size],
            outbound: vec![0; config.out_buffer_size],
        }
    }
}

/// The registry of in-flight downloads
///
/// Owns every transfer and routes socket readiness and timer expiry to it. Performs no I/O of its
/// own: sockets come from a [`Transport`], time from a [`Scheduler`], and both are driven by the
/// owner, which must call [`Downloader::handle_socket_event`] whenever a transfer's socket becomes
/// readable and [`Downloader::handle_timeout`] for every job the scheduler fires.
pub struct Downloader {
    transfers: BTreeMap<TransferId, Transfer>,
    next_id: u64,
    config: DownloaderConfig,
    rng: StdRng,
    ids: IdSource,
}

impl Downloader {
    /// Create an empty registry
    pub fn new(config: DownloaderConfig) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_os_rng(),
        };
        let ids = IdSource::new(&mut rng);
        Self {
            transfers: BTreeMap::new(),
            next_id: 0,
            config,
            rng,
            ids,
        }
    }

    /// Start a download
    ///
    /// Opens the transfer's socket and schedules its first request to go out immediately. On
    /// success the transfer's completion handler is guaranteed to be called exactly once.
    pub fn begin(
        &mut self,
        config: DownloadConfig,
        transport: &mut dyn Transport,
        sched: &mut dyn Scheduler,
    ) -> Result<TransferId, DownloadError> {
        let DownloadConfig {
            url,
            start_offset,
            etag,
            security,
            on_next_block,
            on_finished,
        } = config;
        let (Some(on_next_block), Some(on_finished)) = (on_next_block, on_finished) else {
            return Err(DownloadError::MissingHandlers);
        };
        let target = Target::parse(&url)?;
        let Some(mode) = TransportMode::from_scheme(target.scheme()) else {
            debug!(scheme = target.scheme(), "unsupported scheme");
            return Err(DownloadError::UnsupportedProtocol);
        };
        if self.transfers.len() >= self.config.max_transfers {
            return Err(DownloadError::OutOfMemory);
        }

        let id = TransferId(self.next_id);
        self.next_id += 1;
        let socket = transport
            .connect(id, mode, &target, security.as_ref())
            .map_err(|e| {
                warn!(transfer = %id, %target, "failed to open socket: {e}");
                DownloadError::SocketCreateFailed
            })?;

        let block_size = self.config.max_block_size();
        let mut transfer = Transfer::new(
            id,
            target,
            socket,
            start_offset,
            block_size,
            etag,
            on_next_block,
            on_finished,
        );
        transfer.start(sched)?;
        debug!(
            transfer = %id,
            target = %transfer.target(),
            start_offset,
            block_size,
            "starting download"
        );
        self.transfers.insert(id, transfer);
        Ok(id)
    }

    /// Inspect a live transfer
    pub fn lookup(&self, id: TransferId) -> Option<TransferRef<'_>> {
        self.transfers.get(&id).map(TransferRef)
    }

    /// Process one datagram waiting on the socket of transfer `id`
    ///
    /// Events for transfers that already finished are ignored.
    pub fn handle_socket_event(
        &mut self,
        id: TransferId,
        sched: &mut dyn Scheduler,
        bufs: &mut Buffers,
    ) {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            trace!(transfer = %id, "socket event for finished transfer");
            return;
        };
        let mut ctx = Context {
            sched: &mut *sched,
            bufs,
            rng: &mut self.rng,
            ids: &mut self.ids,
            params: &self.config.tx_params,
        };
        match transfer.handle_readable(&mut ctx) {
            Ok(Status::InProgress) => {}
            Ok(Status::Complete) => self.finish(id, Ok(()), sched),
            Err(e) => self.finish(id, Err(e), sched),
        }
    }

    /// Run a job fired by the scheduler
    ///
    /// The returned outcome must be reported back to the scheduler.
    pub fn handle_timeout(
        &mut self,
        handle: JobHandle,
        job: Job,
        sched: &mut dyn Scheduler,
        bufs: &mut Buffers,
    ) -> JobOutcome {
        let Some(transfer) = self.transfers.get_mut(&job.transfer) else {
            trace!(transfer = %job.transfer, ?handle, "job for finished transfer");
            return JobOutcome::Done;
        };
        let mut ctx = Context {
            sched: &mut *sched,
            bufs,
            rng: &mut self.rng,
            ids: &mut self.ids,
            params: &self.config.tx_params,
        };
        match transfer.handle_timeout(handle, job.kind, &mut ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.finish(job.transfer, Err(e), sched);
                JobOutcome::Done
            }
        }
    }

    /// Stop a transfer, reporting [`DownloadError::TransferFailed`] to its completion handler
    ///
    /// Returns `false` if no such transfer is live.
    pub fn abort(&mut self, id: TransferId, sched: &mut dyn Scheduler) -> bool {
        if !self.transfers.contains_key(&id) {
            return false;
        }
        debug!(transfer = %id, "aborting download");
        self.finish(id, Err(DownloadError::TransferFailed), sched);
        true
    }

    /// Abort every live transfer
    pub fn teardown(&mut self, sched: &mut dyn Scheduler) {
        for (_, transfer) in mem::take(&mut self.transfers) {
            transfer.finish(Err(DownloadError::TransferFailed), sched);
        }
    }

    /// Number of live transfers
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfer is live
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Ids of live transfers, oldest first
    pub fn ids(&self) -> impl Iterator<Item = TransferId> + '_ {
        self.transfers.keys().copied()
    }

    fn finish(&mut self, id: TransferId, result: Result<(), DownloadError>, sched: &mut dyn Scheduler) {
        if let Some(transfer) = self.transfers.remove(&id) {
            transfer.finish(result, sched);
        }
    }
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("transfers", &self.transfers.keys().collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a live transfer
#[derive(Clone, Copy)]
pub struct TransferRef<'a>(&'a Transfer);

impl<'a> TransferRef<'a> {
    /// Where the resource is downloaded from
    pub fn target(&self) -> &'a Target {
        self.0.target()
    }

    /// Start offset plus every byte delivered so far
    pub fn bytes_downloaded(&self) -> usize {
        self.0.bytes_downloaded()
    }

    /// Block size of the next request
    pub fn block_size(&self) -> usize {
        self.0.block_size()
    }

    /// ETag established for the resource, if any
    pub fn etag(&self) -> Option<&'a ETag> {
        self.0.etag()
    }

    /// Current stage of the request/response exchange
    pub fn state(&self) -> TransferState {
        match self.0.phase() {
            Phase::Idle | Phase::InitialSend(_) => TransferState::Pending,
            Phase::Retransmitting { .. } => TransferState::AwaitingResponse,
            Phase::AwaitingSeparateResponse(_) => TransferState::AwaitingSeparateResponse,
        }
    }
}

impl fmt::Debug for TransferRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRef")
            .field("target", self.target())
            .field("bytes_downloaded", &self.bytes_downloaded())
            .field("block_size", &self.block_size())
            .field("etag", &self.etag())
            .field("state", &self.state())
            .finish()
    }
}

/// Stage of a live transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferState {
    /// The first request has not been sent yet
    Pending,
    /// A block request is outstanding
    AwaitingResponse,
    /// The server acknowledged the request and will respond separately
    AwaitingSeparateResponse,
}
