//! Datagram transport consumed by transfers

use std::{fmt, io};

use crate::{downloader::TransferId, target::Target};

/// Plain or secured datagram transport, chosen once from the URL scheme
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportMode {
    /// `coap://` over UDP
    Plain,
    /// `coaps://` over DTLS
    Secured,
}

impl TransportMode {
    /// Map a lowercase URL scheme to a transport
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "coap" => Some(Self::Plain),
            "coaps" => Some(Self::Secured),
            _ => None,
        }
    }

    /// Port used when the URL does not name one
    pub fn default_port(self) -> u16 {
        match self {
            Self::Plain => 5683,
            Self::Secured => 5684,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Plain => "coap",
            Self::Secured => "coaps",
        })
    }
}

/// Credentials for a secured transport
#[derive(Clone, Eq, PartialEq)]
pub enum SecurityInfo {
    /// Pre-shared key
    Psk {
        /// PSK identity sent to the server
        identity: Vec<u8>,
        /// The shared secret
        key: Vec<u8>,
    },
    /// Certificate-based authentication, DER encoded
    Certificate {
        /// Client certificate chain, leaf first
        chain: Vec<Vec<u8>>,
        /// Private key of the leaf certificate
        private_key: Vec<u8>,
        /// Trust anchors for the server certificate
        trusted: Vec<Vec<u8>>,
    },
}

impl fmt::Debug for SecurityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep key material out of logs
        match self {
            Self::Psk { identity, .. } => f
                .debug_struct("Psk")
                .field("identity", &String::from_utf8_lossy(identity))
                .finish_non_exhaustive(),
            Self::Certificate { chain, trusted, .. } => f
                .debug_struct("Certificate")
                .field("chain_len", &chain.len())
                .field("trusted_len", &trusted.len())
                .finish_non_exhaustive(),
        }
    }
}

/// A connected datagram socket owned by a single transfer
///
/// Dropping the socket closes it.
pub trait DatagramSocket {
    /// Send one datagram to the connected peer
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;
    /// Receive one datagram into `buf`, returning its full length
    ///
    /// Must not block: returns `ErrorKind::WouldBlock` if nothing is pending. A datagram larger
    /// than `buf` fills it and still reports its original length, so callers can detect the
    /// truncation.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens the dedicated socket of each transfer
///
/// Sockets must be bound to a local endpoint not shared with any other protocol traffic, or
/// responses may be delivered to the wrong socket.
pub trait Transport {
    /// Connect a fresh socket to `target`
    fn connect(
        &mut self,
        transfer: TransferId,
        mode: TransportMode,
        target: &Target,
        security: Option<&SecurityInfo>,
    ) -> io::Result<Box<dyn DatagramSocket>>;
}
