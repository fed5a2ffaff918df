use std::{fmt, io, mem, time::Duration};

use rand::rngs::StdRng;
use tracing::{debug, info, trace, warn};

use crate::{
    block::{self, BlockInfo},
    config::TransmissionParams,
    downloader::{Buffers, TransferId},
    error::{DownloadError, SinkError},
    etag::{ETag, IdentityTracker},
    message::{opt, Code, IdSource, Message, MessageBuilder, MsgIdentity, MsgType},
    retry,
    sched::{Job, JobHandle, JobKind, JobOutcome, Scheduler},
    target::Target,
    transport::{DatagramSocket, SecurityInfo},
};

/// Receives each block of payload together with the resource's ETag
pub type BlockHandler = Box<dyn FnMut(&[u8], &ETag) -> Result<(), SinkError>>;
/// Receives the outcome of a transfer, exactly once
pub type FinishHandler = Box<dyn FnOnce(Result<(), DownloadError>)>;

/// Parameters of a single download
///
/// Both handlers are mandatory. Caller state travels inside the handlers' captures.
pub struct DownloadConfig {
    pub(crate) url: String,
    pub(crate) start_offset: usize,
    pub(crate) etag: Option<ETag>,
    pub(crate) security: Option<SecurityInfo>,
    pub(crate) on_next_block: Option<BlockHandler>,
    pub(crate) on_finished: Option<FinishHandler>,
}

impl DownloadConfig {
    /// Download the resource at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            start_offset: 0,
            etag: None,
            security: None,
            on_next_block: None,
            on_finished: None,
        }
    }

    /// Byte offset to resume from
    ///
    /// Need not be aligned to any block size; bytes before it are never delivered. Defaults to 0.
    pub fn start_offset(&mut self, offset: usize) -> &mut Self {
        self.start_offset = offset;
        self
    }

    /// ETag seen by an earlier, interrupted download of the same resource
    ///
    /// When set, any block carrying a different tag ends the transfer with
    /// [`DownloadError::ResourceExpired`].
    pub fn etag(&mut self, etag: ETag) -> &mut Self {
        self.etag = Some(etag);
        self
    }

    /// Credentials for `coaps://` URLs
    pub fn security_info(&mut self, info: SecurityInfo) -> &mut Self {
        self.security = Some(info);
        self
    }

    /// Called with each new chunk of the resource, in order
    ///
    /// Returning an error aborts the transfer with [`DownloadError::TransferFailed`].
    pub fn on_next_block<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&[u8], &ETag) -> Result<(), SinkError> + 'static,
    {
        self.on_next_block = Some(Box::new(handler));
        self
    }

    /// Called once the transfer has ended, after all of its resources were released
    pub fn on_finished<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnOnce(Result<(), DownloadError>) + 'static,
    {
        self.on_finished = Some(Box::new(handler));
        self
    }
}

impl fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("url", &self.url)
            .field("start_offset", &self.start_offset)
            .field("etag", &self.etag)
            .field("security", &self.security)
            .field("on_next_block", &self.on_next_block.is_some())
            .field("on_finished", &self.on_finished.is_some())
            .finish()
    }
}

/// What the transfer's single timer currently means
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Phase {
    /// No job armed
    Idle,
    /// The first request goes out when the job fires
    InitialSend(JobHandle),
    /// A request is outstanding; the job resends it
    Retransmitting {
        job: JobHandle,
        retransmissions: u32,
    },
    /// The server acknowledged the request; the job gives up on the separate response
    AwaitingSeparateResponse(JobHandle),
}

impl Phase {
    fn job(self) -> Option<JobHandle> {
        match self {
            Self::Idle => None,
            Self::InitialSend(job)
            | Self::Retransmitting { job, .. }
            | Self::AwaitingSeparateResponse(job) => Some(job),
        }
    }

    /// Whether a request is on the wire, so that responses can be accepted
    fn awaits_response(self) -> bool {
        matches!(
            self,
            Self::Retransmitting { .. } | Self::AwaitingSeparateResponse(_)
        )
    }
}

/// Whether a transfer goes on after an event
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Status {
    InProgress,
    Complete,
}

/// State shared by all transfers, lent to one of them for the duration of an event
pub(crate) struct Context<'a> {
    pub(crate) sched: &'a mut dyn Scheduler,
    pub(crate) bufs: &'a mut Buffers,
    pub(crate) rng: &'a mut StdRng,
    pub(crate) ids: &'a mut IdSource,
    pub(crate) params: &'a TransmissionParams,
}

/// One in-flight block-wise download
pub(crate) struct Transfer {
    id: TransferId,
    target: Target,
    socket: Box<dyn DatagramSocket>,
    /// Bytes delivered to the block handler, plus the start offset
    bytes_downloaded: usize,
    block_size: usize,
    identity: IdentityTracker,
    /// Identity of the request currently on the wire
    last_request: MsgIdentity,
    phase: Phase,
    on_next_block: BlockHandler,
    on_finished: FinishHandler,
}

impl Transfer {
    pub(crate) fn new(
        id: TransferId,
        target: Target,
        socket: Box<dyn DatagramSocket>,
        start_offset: usize,
        block_size: usize,
        etag: Option<ETag>,
        on_next_block: BlockHandler,
        on_finished: FinishHandler,
    ) -> Self {
        Self {
            id,
            target,
            socket,
            bytes_downloaded: start_offset,
            block_size,
            identity: IdentityTracker::new(etag),
            last_request: MsgIdentity::default(),
            phase: Phase::Idle,
            on_next_block,
            on_finished,
        }
    }

    /// Arm the job that sends the first request
    pub(crate) fn start(&mut self, sched: &mut dyn Scheduler) -> Result<(), DownloadError> {
        let job = self.arm(sched, Duration::ZERO, JobKind::InitialSend)?;
        self.phase = Phase::InitialSend(job);
        Ok(())
    }

    pub(crate) fn target(&self) -> &Target {
        &self.target
    }

    pub(crate) fn bytes_downloaded(&self) -> usize {
        self.bytes_downloaded
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn etag(&self) -> Option<&ETag> {
        self.identity.established()
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Run a fired job
    pub(crate) fn handle_timeout(
        &mut self,
        handle: JobHandle,
        kind: JobKind,
        ctx: &mut Context<'_>,
    ) -> Result<JobOutcome, DownloadError> {
        if self.phase.job() != Some(handle) {
            debug!(transfer = %self.id, ?handle, "ignoring stale job");
            return Ok(JobOutcome::Done);
        }
        match (kind, self.phase) {
            (JobKind::InitialSend, Phase::InitialSend(_)) => {
                self.request_next_block(ctx)?;
                Ok(JobOutcome::Done)
            }
            (
                JobKind::Retransmit,
                Phase::Retransmitting {
                    job,
                    retransmissions,
                },
            ) => {
                if retransmissions >= ctx.params.max_retransmit {
                    debug!(
                        transfer = %self.id,
                        retransmissions, "no response to block request"
                    );
                    return Err(DownloadError::TransferFailed);
                }
                self.send_request(ctx)?;
                self.phase = Phase::Retransmitting {
                    job,
                    retransmissions: retransmissions + 1,
                };
                Ok(JobOutcome::Retry)
            }
            (JobKind::SeparateResponseTimeout, Phase::AwaitingSeparateResponse(_)) => {
                debug!(transfer = %self.id, "separate response never arrived");
                Err(DownloadError::TransferFailed)
            }
            (kind, phase) => {
                warn!(transfer = %self.id, ?kind, ?phase, "job does not match phase");
                Ok(JobOutcome::Done)
            }
        }
    }

    /// Receive and act on one datagram from the transfer's socket
    pub(crate) fn handle_readable(
        &mut self,
        ctx: &mut Context<'_>,
    ) -> Result<Status, DownloadError> {
        let len = match self.socket.recv(&mut ctx.bufs.inbound) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Status::InProgress),
            // Unanswered requests are still retransmitted and eventually time out
            Err(e) => {
                debug!(transfer = %self.id, "receive failed: {e}");
                return Ok(Status::InProgress);
            }
        };
        if len > ctx.bufs.inbound.len() {
            debug!(
                transfer = %self.id,
                len,
                capacity = ctx.bufs.inbound.len(),
                "dropping datagram larger than the receive buffer"
            );
            return Ok(Status::InProgress);
        }
        let msg = match Message::decode(&ctx.bufs.inbound[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(transfer = %self.id, "dropping undecodable datagram: {e}");
                return Ok(Status::InProgress);
            }
        };
        if !self.phase.awaits_response() {
            debug!(transfer = %self.id, "dropping datagram, no request outstanding");
            return Ok(Status::InProgress);
        }

        match msg.ty() {
            MsgType::NonConfirmable => {
                debug!(transfer = %self.id, "dropping non-confirmable message");
                return Ok(Status::InProgress);
            }
            MsgType::Acknowledgement | MsgType::Reset
                if msg.msg_id() != self.last_request.msg_id =>
            {
                debug!(
                    transfer = %self.id,
                    msg_id = msg.msg_id(),
                    expected = self.last_request.msg_id,
                    "dropping {:?} for another request",
                    msg.ty()
                );
                return Ok(Status::InProgress);
            }
            MsgType::Reset => {
                debug!(transfer = %self.id, "request reset by peer");
                return Err(DownloadError::TransferFailed);
            }
            MsgType::Acknowledgement if msg.code() == Code::EMPTY => {
                self.await_separate_response(ctx)?;
                return Ok(Status::InProgress);
            }
            MsgType::Confirmable if msg.code() == Code::EMPTY => {
                debug!(transfer = %self.id, "ignoring ping");
                return Ok(Status::InProgress);
            }
            _ => {}
        }

        if !msg.token_matches(&self.last_request) {
            debug!(transfer = %self.id, "dropping response with unknown token");
            return Ok(Status::InProgress);
        }
        if msg.ty() == MsgType::Confirmable {
            // Separate response
            let ack = MessageBuilder::empty(MsgType::Acknowledgement, msg.msg_id());
            let sent = ack
                .encode(&mut ctx.bufs.outbound)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
                .and_then(|len| self.socket.send(&ctx.bufs.outbound[..len]));
            if let Err(e) = sent {
                // The server will retransmit its response
                warn!(transfer = %self.id, "failed to acknowledge response: {e}");
            }
        }

        if !self.deliver(&msg)? {
            return Ok(Status::Complete);
        }
        self.request_next_block(ctx)?;
        Ok(Status::InProgress)
    }

    /// Validate a response and hand its new bytes to the block handler
    ///
    /// Returns whether more blocks follow.
    fn deliver(&mut self, msg: &Message<'_>) -> Result<bool, DownloadError> {
        if msg.code() != Code::CONTENT {
            debug!(transfer = %self.id, code = %msg.code(), "server refused block request");
            return Err(DownloadError::ServerError(msg.code()));
        }
        let (block, etag) = self.parse_response(msg)?;
        if let Err(e) = self.identity.observe(&etag) {
            debug!(
                transfer = %self.id,
                expected = %e.expected,
                got = %e.got,
                "resource changed during download"
            );
            return Err(DownloadError::ResourceExpired);
        }
        if block.size() < self.block_size {
            debug!(
                transfer = %self.id,
                from = self.block_size,
                to = block.size(),
                "server reduced block size"
            );
            self.block_size = block.size();
        }

        // Resuming from an offset inside this block
        let skip = self.bytes_downloaded - block.offset();
        let payload = msg.payload();
        if skip < payload.len() {
            let fresh = &payload[skip..];
            if let Err(e) = (self.on_next_block)(fresh, &etag) {
                debug!(transfer = %self.id, "{e}");
                return Err(DownloadError::TransferFailed);
            }
            self.bytes_downloaded += fresh.len();
        }
        trace!(
            transfer = %self.id,
            seq = block.seq_num(),
            size = block.size(),
            more = block.has_more(),
            bytes_downloaded = self.bytes_downloaded,
            "received block"
        );
        Ok(block.has_more())
    }

    /// Extract and check the block descriptor and ETag of a response
    fn parse_response(&self, msg: &Message<'_>) -> Result<(BlockInfo, ETag), DownloadError> {
        let etag = match msg.unique_option(opt::ETAG) {
            Ok(None) => ETag::EMPTY,
            Ok(Some(value)) => ETag::from_slice(value).map_err(|e| {
                debug!(transfer = %self.id, "{e}");
                DownloadError::MalformedResponse
            })?,
            Err(e) => {
                debug!(transfer = %self.id, "{e}");
                return Err(DownloadError::MalformedResponse);
            }
        };

        let block = match msg.unique_option(opt::BLOCK2) {
            Ok(Some(value)) => BlockInfo::decode(value).map_err(|e| {
                debug!(transfer = %self.id, "{e}");
                DownloadError::MalformedResponse
            })?,
            Ok(None) => {
                debug!(transfer = %self.id, "response lacks Block2 option");
                return Err(DownloadError::MalformedResponse);
            }
            Err(e) => {
                debug!(transfer = %self.id, "{e}");
                return Err(DownloadError::MalformedResponse);
            }
        };

        let payload_len = msg.payload().len();
        if payload_len > block.size() || (block.has_more() && payload_len != block.size()) {
            debug!(
                transfer = %self.id,
                payload_len,
                size = block.size(),
                more = block.has_more(),
                "payload does not match block size"
            );
            return Err(DownloadError::MalformedResponse);
        }

        let expected = block::expected_offset(self.bytes_downloaded, self.block_size);
        if block.offset() != expected {
            debug!(
                transfer = %self.id,
                expected,
                obtained = block.offset(),
                "unexpected block offset"
            );
            return Err(DownloadError::OffsetMismatch);
        }
        if block.size() > self.block_size {
            debug!(
                transfer = %self.id,
                requested = self.block_size,
                obtained = block.size(),
                "server attempted to grow block size"
            );
            return Err(DownloadError::RenegotiationRejected);
        }
        Ok((block, etag))
    }

    /// Send a request for the block following the downloaded bytes, under a fresh identity
    fn request_next_block(&mut self, ctx: &mut Context<'_>) -> Result<(), DownloadError> {
        self.last_request = ctx.ids.next(ctx.rng);
        self.send_request(ctx)?;
        self.schedule_retransmission(ctx)
    }

    /// Encode and send the outstanding request
    fn send_request(&mut self, ctx: &mut Context<'_>) -> Result<(), DownloadError> {
        let block = BlockInfo::for_offset(self.bytes_downloaded, self.block_size, false)
            .map_err(|e| {
                warn!(transfer = %self.id, offset = self.bytes_downloaded, "{e}");
                DownloadError::EncodingTooLarge
            })?;
        let mut request = MessageBuilder::new(MsgType::Confirmable, Code::GET, self.last_request);
        for segment in self.target.path() {
            request.option(opt::URI_PATH, segment.as_bytes());
        }
        for arg in self.target.query() {
            request.option(opt::URI_QUERY, arg.as_bytes());
        }
        request.block2(&block);
        let len = request.encode(&mut ctx.bufs.outbound).map_err(|e| {
            warn!(transfer = %self.id, "{e}");
            DownloadError::EncodingTooLarge
        })?;

        self.socket
            .send(&ctx.bufs.outbound[..len])
            .map_err(|e| {
                warn!(transfer = %self.id, "send failed: {e}");
                DownloadError::TransferFailed
            })?;
        trace!(
            transfer = %self.id,
            seq = block.seq_num(),
            size = self.block_size,
            msg_id = self.last_request.msg_id,
            token = ?self.last_request.token,
            "sent block request"
        );
        Ok(())
    }

    fn schedule_retransmission(&mut self, ctx: &mut Context<'_>) -> Result<(), DownloadError> {
        self.cancel_job(ctx.sched);
        let (delay, backoff) = retry::retransmission_schedule(ctx.params, ctx.rng);
        let job = ctx
            .sched
            .arm_retryable(
                delay,
                backoff,
                Job {
                    transfer: self.id,
                    kind: JobKind::Retransmit,
                },
            )
            .map_err(|e| {
                warn!(transfer = %self.id, "{e}");
                DownloadError::TransferFailed
            })?;
        self.phase = Phase::Retransmitting {
            job,
            retransmissions: 0,
        };
        Ok(())
    }

    /// The request was acknowledged without a response; stop retransmitting and wait
    fn await_separate_response(&mut self, ctx: &mut Context<'_>) -> Result<(), DownloadError> {
        if let Phase::AwaitingSeparateResponse(_) = self.phase {
            debug!(transfer = %self.id, "duplicate acknowledgement");
            return Ok(());
        }
        self.cancel_job(ctx.sched);
        let timeout = ctx.params.max_transmit_span();
        let job = self.arm(ctx.sched, timeout, JobKind::SeparateResponseTimeout)?;
        self.phase = Phase::AwaitingSeparateResponse(job);
        trace!(transfer = %self.id, ?timeout, "awaiting separate response");
        Ok(())
    }

    fn arm(
        &self,
        sched: &mut dyn Scheduler,
        delay: Duration,
        kind: JobKind,
    ) -> Result<JobHandle, DownloadError> {
        sched
            .arm(
                delay,
                Job {
                    transfer: self.id,
                    kind,
                },
            )
            .map_err(|e| {
                warn!(transfer = %self.id, "{e}");
                DownloadError::TransferFailed
            })
    }

    fn cancel_job(&mut self, sched: &mut dyn Scheduler) {
        if let Some(job) = mem::replace(&mut self.phase, Phase::Idle).job() {
            sched.cancel(job);
        }
    }

    /// Release the transfer's timer and socket, then report `result`
    pub(crate) fn finish(mut self, result: Result<(), DownloadError>, sched: &mut dyn Scheduler) {
        self.cancel_job(sched);
        let Self {
            id,
            socket,
            bytes_downloaded,
            on_finished,
            ..
        } = self;
        drop(socket);
        match &result {
            Ok(()) => info!(transfer = %id, bytes_downloaded, "download complete"),
            Err(e) => info!(transfer = %id, bytes_downloaded, "download failed: {e}"),
        }
        on_finished(result);
    }
}
