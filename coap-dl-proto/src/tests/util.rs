use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    io::{self, Write},
    rc::Rc,
    str,
    time::{Duration, Instant},
};

use tracing_subscriber::EnvFilter;

use crate::{
    message::opt, BlockInfo, Buffers, Code, DatagramSocket, DownloadConfig, DownloadError,
    Downloader, DownloaderConfig, ETag, Message, MessageBuilder, MsgIdentity, MsgType,
    SecurityInfo, Target, TimerQueue, Token, TransferId, TransmissionParams, Transport,
    TransportMode,
};

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Deterministic configuration: seeded RNG and no retransmission jitter
pub(super) fn config() -> DownloaderConfig {
    let mut params = TransmissionParams::default();
    params.ack_random_factor(1.0).unwrap();
    let mut config = DownloaderConfig::default();
    config.tx_params(params).rng_seed(Some([0; 32]));
    config
}

/// Datagrams in flight between the transfers and the test
#[derive(Default)]
pub(super) struct Network {
    sent: HashMap<TransferId, Vec<Vec<u8>>>,
    inbox: HashMap<TransferId, VecDeque<Vec<u8>>>,
    recv_errors: HashMap<TransferId, VecDeque<io::ErrorKind>>,
    open: HashSet<TransferId>,
    pub(super) connects: Vec<Connect>,
    pub(super) refuse: bool,
}

#[derive(Debug, Clone)]
pub(super) struct Connect {
    pub(super) id: TransferId,
    pub(super) mode: TransportMode,
    pub(super) target: Target,
    pub(super) secured: bool,
}

#[derive(Clone, Default)]
pub(super) struct MockTransport(pub(super) Rc<RefCell<Network>>);

impl Transport for MockTransport {
    fn connect(
        &mut self,
        id: TransferId,
        mode: TransportMode,
        target: &Target,
        security: Option<&SecurityInfo>,
    ) -> io::Result<Box<dyn DatagramSocket>> {
        let mut net = self.0.borrow_mut();
        if net.refuse {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "refused"));
        }
        net.open.insert(id);
        net.connects.push(Connect {
            id,
            mode,
            target: target.clone(),
            secured: security.is_some(),
        });
        Ok(Box::new(MockSocket {
            id,
            net: self.0.clone(),
        }))
    }
}

struct MockSocket {
    id: TransferId,
    net: Rc<RefCell<Network>>,
}

impl DatagramSocket for MockSocket {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        net.sent.entry(self.id).or_default().push(datagram.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut net = self.net.borrow_mut();
        if let Some(kind) = net
            .recv_errors
            .get_mut(&self.id)
            .and_then(|errors| errors.pop_front())
        {
            return Err(kind.into());
        }
        let datagram = net
            .inbox
            .get_mut(&self.id)
            .and_then(|inbox| inbox.pop_front())
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(datagram.len())
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.net.borrow_mut().open.remove(&self.id);
    }
}

/// A downloader wired to a mock network and a manually advanced clock
pub(super) struct Harness {
    pub(super) downloader: Downloader,
    pub(super) timers: TimerQueue,
    pub(super) bufs: Buffers,
    pub(super) transport: MockTransport,
    pub(super) now: Instant,
    started: Vec<TransferId>,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::with_config(config())
    }

    pub(super) fn with_config(config: DownloaderConfig) -> Self {
        let now = Instant::now();
        Self {
            bufs: Buffers::new(&config),
            downloader: Downloader::new(config),
            timers: TimerQueue::new(now),
            transport: MockTransport::default(),
            now,
            started: Vec::new(),
        }
    }

    pub(super) fn begin(&mut self, config: DownloadConfig) -> Result<TransferId, DownloadError> {
        let result = self
            .downloader
            .begin(config, &mut self.transport, &mut self.timers);
        if let Ok(id) = result {
            self.started.push(id);
        }
        self.check_jobs();
        result
    }

    /// Begin a download and let its first request go out
    pub(super) fn start(&mut self, config: DownloadConfig) -> TransferId {
        let id = self.begin(config).unwrap();
        self.fire_timers();
        id
    }

    /// Run every job due at the current time
    pub(super) fn fire_timers(&mut self) {
        self.timers.advance(self.now);
        while let Some((handle, job)) = self.timers.poll_expired() {
            let outcome =
                self.downloader
                    .handle_timeout(handle, job, &mut self.timers, &mut self.bufs);
            self.timers.complete(handle, outcome);
            self.check_jobs();
        }
    }

    pub(super) fn advance(&mut self, duration: Duration) {
        self.now += duration;
        self.fire_timers();
    }

    /// Jump to the next armed job and run it; false if none is armed
    pub(super) fn step_timer(&mut self) -> bool {
        let Some(expiry) = self.timers.next_timeout() else {
            return false;
        };
        self.now = self.now.max(expiry);
        self.fire_timers();
        true
    }

    /// Datagrams sent by transfer `id` since the last call
    pub(super) fn take_sent(&mut self, id: TransferId) -> Vec<Vec<u8>> {
        self.transport
            .0
            .borrow_mut()
            .sent
            .remove(&id)
            .unwrap_or_default()
    }

    /// Hand a datagram to the socket of transfer `id` and notify the downloader
    pub(super) fn deliver(&mut self, id: TransferId, datagram: Vec<u8>) {
        self.transport
            .0
            .borrow_mut()
            .inbox
            .entry(id)
            .or_default()
            .push_back(datagram);
        self.downloader
            .handle_socket_event(id, &mut self.timers, &mut self.bufs);
        self.check_jobs();
    }

    /// Make the next receive on the socket of transfer `id` fail, and notify the downloader
    pub(super) fn deliver_error(&mut self, id: TransferId, kind: io::ErrorKind) {
        self.transport
            .0
            .borrow_mut()
            .recv_errors
            .entry(id)
            .or_default()
            .push_back(kind);
        self.downloader
            .handle_socket_event(id, &mut self.timers, &mut self.bufs);
        self.check_jobs();
    }

    /// Answer every request of transfer `id` from `resource` until it stops asking
    pub(super) fn serve(&mut self, id: TransferId, resource: &Resource) {
        loop {
            let requests = self.take_sent(id);
            if requests.is_empty() {
                break;
            }
            for request in requests {
                let response = resource.respond(&parse_request(&request));
                self.deliver(id, response);
            }
        }
    }

    pub(super) fn socket_open(&self, id: TransferId) -> bool {
        self.transport.0.borrow().open.contains(&id)
    }

    /// At most one job per live transfer, none for finished ones
    fn check_jobs(&self) {
        for &id in &self.started {
            let jobs = self.timers.jobs_for(id);
            if self.downloader.lookup(id).is_some() {
                assert!(jobs <= 1, "transfer {id} has {jobs} live jobs");
            } else {
                assert_eq!(jobs, 0, "finished transfer {id} left jobs behind");
            }
        }
    }
}

/// Records what a transfer hands to its handlers
#[derive(Clone, Default)]
pub(super) struct Recorder {
    blocks: Rc<RefCell<Vec<(Vec<u8>, ETag)>>>,
    result: Rc<RefCell<Option<Result<(), DownloadError>>>>,
}

impl Recorder {
    pub(super) fn config(&self, url: &str) -> DownloadConfig {
        let mut config = DownloadConfig::new(url);
        let blocks = self.blocks.clone();
        let result = self.result.clone();
        config
            .on_next_block(move |data, etag| {
                blocks.borrow_mut().push((data.to_vec(), *etag));
                Ok(())
            })
            .on_finished(move |outcome| {
                let prev = result.borrow_mut().replace(outcome);
                assert!(prev.is_none(), "finished twice");
            });
        config
    }

    pub(super) fn block_lens(&self) -> Vec<usize> {
        self.blocks.borrow().iter().map(|(data, _)| data.len()).collect()
    }

    pub(super) fn etags(&self) -> Vec<ETag> {
        self.blocks.borrow().iter().map(|&(_, etag)| etag).collect()
    }

    pub(super) fn data(&self) -> Vec<u8> {
        self.blocks
            .borrow()
            .iter()
            .flat_map(|(data, _)| data.iter().copied())
            .collect()
    }

    pub(super) fn result(&self) -> Option<Result<(), DownloadError>> {
        self.result.borrow().clone()
    }
}

/// The parts of a block request a server looks at
#[derive(Debug, Clone)]
pub(super) struct Request {
    pub(super) identity: MsgIdentity,
    pub(super) path: Vec<String>,
    pub(super) query: Vec<String>,
    pub(super) block: BlockInfo,
}

pub(super) fn parse_request(datagram: &[u8]) -> Request {
    let msg = Message::decode(datagram).unwrap();
    assert_eq!(msg.ty(), MsgType::Confirmable);
    assert_eq!(msg.code(), Code::GET);
    let strings = |number| {
        msg.options()
            .filter(|&(n, _)| n == number)
            .map(|(_, value)| String::from_utf8(value.to_vec()).unwrap())
            .collect::<Vec<_>>()
    };
    let block = msg.unique_option(opt::BLOCK2).unwrap().unwrap();
    let block = BlockInfo::decode(block).unwrap();
    assert!(!block.has_more(), "requests never assert more blocks");
    Request {
        identity: MsgIdentity {
            msg_id: msg.msg_id(),
            token: Token::from_slice(msg.token()).unwrap(),
        },
        path: strings(opt::URI_PATH),
        query: strings(opt::URI_QUERY),
        block,
    }
}

/// Encode a response to `request`
///
/// Confirmable responses get a message ID of their own, as separate responses do.
pub(super) fn response(
    request: &Request,
    ty: MsgType,
    code: Code,
    etag: &[u8],
    block: Option<BlockInfo>,
    payload: &[u8],
) -> Vec<u8> {
    let identity = match ty {
        MsgType::Confirmable | MsgType::NonConfirmable => MsgIdentity {
            msg_id: request.identity.msg_id.wrapping_add(0x100),
            token: request.identity.token,
        },
        _ => request.identity,
    };
    let mut builder = MessageBuilder::new(ty, code, identity);
    if !etag.is_empty() {
        builder.option(opt::ETAG, etag);
    }
    if let Some(block) = block {
        builder.block2(&block);
    }
    builder.payload(payload);
    let mut out = vec![0; builder.encoded_len()];
    builder.encode(&mut out).unwrap();
    out
}

/// An empty acknowledgement or reset of `request`
pub(super) fn empty(request: &Request, ty: MsgType) -> Vec<u8> {
    let mut out = [0; 4];
    let len = MessageBuilder::empty(ty, request.identity.msg_id)
        .encode(&mut out)
        .unwrap();
    out[..len].to_vec()
}

/// A resource served block-wise, never with blocks larger than `block_size`
pub(super) struct Resource {
    pub(super) data: Vec<u8>,
    pub(super) etag: Vec<u8>,
    pub(super) block_size: usize,
}

impl Resource {
    pub(super) fn new(len: usize, etag: &[u8], block_size: usize) -> Self {
        Self {
            data: (0..len).map(|i| (i % 251) as u8).collect(),
            etag: etag.to_vec(),
            block_size,
        }
    }

    /// The block covering the requested offset, at the server's block size if smaller
    pub(super) fn block(&self, request: &Request) -> (BlockInfo, &[u8]) {
        let size = request.block.size().min(self.block_size);
        let seq = request.block.offset() / size;
        let start = (seq * size).min(self.data.len());
        let end = (start + size).min(self.data.len());
        let block = BlockInfo::new(seq as u32, size, end < self.data.len()).unwrap();
        (block, &self.data[start..end])
    }

    /// Piggybacked response to `request`
    pub(super) fn respond(&self, request: &Request) -> Vec<u8> {
        let (block, payload) = self.block(request);
        response(
            request,
            MsgType::Acknowledgement,
            Code::CONTENT,
            &self.etag,
            Some(block),
            payload,
        )
    }
}
