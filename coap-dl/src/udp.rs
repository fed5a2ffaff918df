use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use bytes::Bytes;
use proto::{DatagramSocket, SecurityInfo, Target, TransferId, Transport, TransportMode};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, trace};

/// Largest datagram the reader tasks accept
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Attempts at finding an ephemeral port outside the reserved set
const BIND_ATTEMPTS: usize = 16;

/// Opens one connected UDP socket per transfer
///
/// Each socket gets a reader task that queues incoming datagrams and announces the transfer on a
/// channel shared by all sockets. Only plain `coap` is supported; secured targets are refused.
#[derive(Debug)]
pub struct UdpTransport {
    readable: mpsc::UnboundedSender<TransferId>,
    reserved_ports: Vec<u16>,
    recv_buffer_size: Option<usize>,
}

impl UdpTransport {
    /// Create a transport that announces readable transfers on `readable`
    pub fn new(
        readable: mpsc::UnboundedSender<TransferId>,
        reserved_ports: Vec<u16>,
        recv_buffer_size: Option<usize>,
    ) -> Self {
        Self {
            readable,
            reserved_ports,
            recv_buffer_size,
        }
    }

    fn bind(&self, remote: SocketAddr) -> io::Result<std::net::UdpSocket> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        // Rejected sockets stay bound until a usable one is found so the OS hands out another port
        let mut rejected = Vec::new();
        for _ in 0..BIND_ATTEMPTS {
            let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
            if let Some(size) = self.recv_buffer_size {
                socket.set_recv_buffer_size(size)?;
            }
            socket.bind(&local.into())?;
            let port = socket
                .local_addr()?
                .as_socket()
                .map_or(0, |addr| addr.port());
            if self.reserved_ports.contains(&port) {
                trace!(port, "bound a reserved port, rebinding");
                rejected.push(socket);
                continue;
            }
            socket.connect(&remote.into())?;
            socket.set_nonblocking(true)?;
            return Ok(socket.into());
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no unreserved local port available",
        ))
    }
}

impl Transport for UdpTransport {
    fn connect(
        &mut self,
        transfer: TransferId,
        mode: TransportMode,
        target: &Target,
        _security: Option<&SecurityInfo>,
    ) -> io::Result<Box<dyn DatagramSocket>> {
        if mode == TransportMode::Secured {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "DTLS is not available over plain UDP",
            ));
        }
        let port = target.port().unwrap_or(mode.default_port());
        let remote = (target.host(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} did not resolve", target.host()),
                )
            })?;

        let std_socket = self.bind(remote)?;
        let sender = std_socket.try_clone()?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        debug!(%transfer, %remote, local = ?socket.local_addr().ok(), "socket open");

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_datagrams(
            transfer,
            socket,
            inbox_tx,
            self.readable.clone(),
        ));
        Ok(Box::new(UdpDatagramSocket {
            sender,
            inbox,
            reader,
        }))
    }
}

/// Forward datagrams and receive errors from `socket` until the transfer goes away
///
/// Errors such as an ICMP port unreachable are reported once and do not stop the reader.
async fn read_datagrams(
    transfer: TransferId,
    socket: Arc<UdpSocket>,
    inbox: mpsc::UnboundedSender<io::Result<Bytes>>,
    readable: mpsc::UnboundedSender<TransferId>,
) {
    let mut buf = vec![0; MAX_DATAGRAM_SIZE];
    loop {
        let result = socket
            .recv(&mut buf)
            .await
            .map(|len| Bytes::copy_from_slice(&buf[..len]));
        if let Err(e) = &result {
            trace!(%transfer, "receive failed: {e}");
        }
        if inbox.send(result).is_err() || readable.send(transfer).is_err() {
            return;
        }
    }
}

/// A transfer's end of a connected socket
///
/// Sends go straight to a duplicate of the socket; receives come from the reader task.
struct UdpDatagramSocket {
    sender: std::net::UdpSocket,
    inbox: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    reader: JoinHandle<()>,
}

impl DatagramSocket for UdpDatagramSocket {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.sender.send(datagram).map(|_| ())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbox.try_recv() {
            Ok(Ok(datagram)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(datagram.len())
            }
            Ok(Err(e)) => Err(e),
            Err(TryRecvError::Empty) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TryRecvError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }
}

impl Drop for UdpDatagramSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
