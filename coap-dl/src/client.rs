use std::{fmt, future};

use proto::{
    Buffers, DownloadConfig, DownloadError, Downloader, DownloaderConfig, TimerQueue, TransferId,
    TransferRef,
};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::trace;

use crate::udp::UdpTransport;

/// Settings for a [`Client`]
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub(crate) downloader: DownloaderConfig,
    pub(crate) reserved_local_ports: Vec<u16>,
    pub(crate) recv_buffer_size: Option<usize>,
}

impl ClientConfig {
    /// Protocol settings shared by every download
    pub fn downloader(&mut self, value: DownloaderConfig) -> &mut Self {
        self.downloader = value;
        self
    }

    /// Local ports that download sockets must never be bound to
    ///
    /// Useful when another service on the device listens on an ephemeral port.
    pub fn reserved_local_ports(&mut self, ports: impl IntoIterator<Item = u16>) -> &mut Self {
        self.reserved_local_ports = ports.into_iter().collect();
        self
    }

    /// Kernel receive buffer size of each download socket, or the OS default if `None`
    pub fn recv_buffer_size(&mut self, value: Option<usize>) -> &mut Self {
        self.recv_buffer_size = value;
        self
    }
}

/// Runs block-wise downloads on the current tokio runtime
///
/// Handlers are invoked from [`Client::drive`], so they need not be `Send`. Dropping the client
/// aborts every download still in flight.
pub struct Client {
    downloader: Downloader,
    timers: TimerQueue,
    bufs: Buffers,
    transport: UdpTransport,
    readable: mpsc::UnboundedReceiver<TransferId>,
}

impl Client {
    /// Create a client with no downloads in flight
    pub fn new(config: ClientConfig) -> Self {
        let ClientConfig {
            downloader,
            reserved_local_ports,
            recv_buffer_size,
        } = config;
        let (readable_tx, readable) = mpsc::unbounded_channel();
        Self {
            bufs: Buffers::new(&downloader),
            downloader: Downloader::new(downloader),
            timers: TimerQueue::new(Instant::now().into_std()),
            transport: UdpTransport::new(readable_tx, reserved_local_ports, recv_buffer_size),
            readable,
        }
    }

    /// Start downloading `config.url`
    ///
    /// Must be called from within a tokio runtime. Nothing is sent until the client is driven.
    pub fn download(&mut self, config: DownloadConfig) -> Result<TransferId, DownloadError> {
        self.timers.advance(Instant::now().into_std());
        self.downloader
            .begin(config, &mut self.transport, &mut self.timers)
    }

    /// Stop a download, reporting [`DownloadError::TransferFailed`] to its completion handler
    pub fn abort(&mut self, id: TransferId) -> bool {
        self.downloader.abort(id, &mut self.timers)
    }

    /// Inspect a download in flight
    pub fn lookup(&self, id: TransferId) -> Option<TransferRef<'_>> {
        self.downloader.lookup(id)
    }

    /// Whether no download is in flight
    pub fn is_idle(&self) -> bool {
        self.downloader.is_empty()
    }

    /// Wait for the next datagram or timer and process it
    ///
    /// Returns `false` once no download is in flight.
    pub async fn drive(&mut self) -> bool {
        self.fire_timers();
        if self.downloader.is_empty() {
            return false;
        }

        let deadline = self.timers.next_timeout();
        let timeout = async move {
            match deadline {
                Some(deadline) => time::sleep_until(deadline.into()).await,
                None => future::pending().await,
            }
        };
        tokio::select! {
            Some(id) = self.readable.recv() => {
                self.downloader.handle_socket_event(id, &mut self.timers, &mut self.bufs);
                while let Ok(id) = self.readable.try_recv() {
                    self.downloader.handle_socket_event(id, &mut self.timers, &mut self.bufs);
                }
            }
            () = timeout => {}
        }

        self.fire_timers();
        !self.downloader.is_empty()
    }

    /// Drive until every download has finished
    pub async fn run_until_idle(&mut self) {
        while self.drive().await {}
    }

    fn fire_timers(&mut self) {
        self.timers.advance(Instant::now().into_std());
        while let Some((handle, job)) = self.timers.poll_expired() {
            trace!(transfer = %job.transfer, ?handle, "timer fired");
            let outcome =
                self.downloader
                    .handle_timeout(handle, job, &mut self.timers, &mut self.bufs);
            self.timers.complete(handle, outcome);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("downloader", &self.downloader)
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.downloader.teardown(&mut self.timers);
    }
}
