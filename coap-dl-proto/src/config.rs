use std::time::Duration;

use thiserror::Error;

use crate::block::{self, MAX_HEADER_SIZE, MAX_TOKEN_LEN};

/// Fixed parameters governing retransmission of confirmable requests (RFC 7252 §4.8)
///
/// Shared by every transfer of a `Downloader`. Defaults are the values recommended by the RFC.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParams {
    pub(crate) ack_timeout: Duration,
    pub(crate) ack_random_factor: f64,
    pub(crate) max_retransmit: u32,
}

impl TransmissionParams {
    /// Minimum time to wait for a response before the first retransmission
    ///
    /// Must be nonzero and at most one hour. Defaults to 2 seconds.
    pub fn ack_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() || value > MAX_ACK_TIMEOUT {
            return Err(ConfigError::OutOfBounds);
        }
        self.ack_timeout = value;
        Ok(self)
    }

    /// Upper bound of the random multiplier applied to `ack_timeout`
    ///
    /// Must be between 1 and 16. Defaults to 1.5.
    pub fn ack_random_factor(&mut self, value: f64) -> Result<&mut Self, ConfigError> {
        if !(1.0..=MAX_ACK_RANDOM_FACTOR).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.ack_random_factor = value;
        Ok(self)
    }

    /// How many times an unanswered request is sent again before the transfer fails
    ///
    /// Defaults to 4.
    pub fn max_retransmit(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value > 16 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_retransmit = value;
        Ok(self)
    }

    /// Time from the first transmission of a request to its last retransmission
    pub fn max_transmit_span(&self) -> Duration {
        let steps = (1u32 << self.max_retransmit) - 1;
        self.ack_timeout
            .mul_f64(steps as f64 * self.ack_random_factor)
    }
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

/// Global configuration of a `Downloader`
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub(crate) tx_params: TransmissionParams,
    pub(crate) in_buffer_size: usize,
    pub(crate) out_buffer_size: usize,
    pub(crate) rng_seed: Option<[u8; 32]>,
    pub(crate) max_transfers: usize,
}

impl DownloaderConfig {
    /// Retransmission parameters shared by all transfers
    pub fn tx_params(&mut self, value: TransmissionParams) -> &mut Self {
        self.tx_params = value;
        self
    }

    /// Size of the scratch buffer responses are received into
    ///
    /// Bounds the block size requested from servers: the largest power of two that still leaves
    /// room for worst-case header and options, capped at 1024 bytes. Must allow at least a
    /// 16-byte block. Defaults to 1152 bytes.
    pub fn in_buffer_size(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if block::max_acceptable_block_size(value).is_none() {
            return Err(ConfigError::BufferTooSmall(value));
        }
        self.in_buffer_size = value;
        Ok(self)
    }

    /// Size of the scratch buffer requests are built in
    ///
    /// Requests carrying long paths or queries fail if they do not fit. Defaults to 1152 bytes.
    pub fn out_buffer_size(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value < MIN_OUT_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(value));
        }
        self.out_buffer_size = value;
        Ok(self)
    }

    /// Seed for token generation and retransmission jitter, for reproducible runs
    ///
    /// Seeded from OS entropy if unset.
    pub fn rng_seed(&mut self, seed: Option<[u8; 32]>) -> &mut Self {
        self.rng_seed = seed;
        self
    }

    /// Maximum number of transfers in flight at once
    ///
    /// Further downloads are refused with `DownloadError::OutOfMemory`. Defaults to 16.
    pub fn max_transfers(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_transfers = value;
        Ok(self)
    }

    /// Largest block size requested from servers
    pub fn max_block_size(&self) -> usize {
        block::max_acceptable_block_size(self.in_buffer_size).unwrap_or(block::MIN_BLOCK_SIZE)
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            tx_params: TransmissionParams::default(),
            in_buffer_size: 1152,
            out_buffer_size: 1152,
            rng_seed: None,
            max_transfers: 16,
        }
    }
}

// Keep `max_transmit_span` and timer deadlines far from `Duration`/`Instant` overflow
const MAX_ACK_TIMEOUT: Duration = Duration::from_secs(3600);
const MAX_ACK_RANDOM_FACTOR: f64 = 16.0;

/// Smallest request: header, token and a Block2 option
const MIN_OUT_BUFFER_SIZE: usize = MAX_HEADER_SIZE + MAX_TOKEN_LEN + block::BLOCK_OPT_MAX_SIZE;

/// Errors in the configuration of a downloader
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// A scratch buffer cannot hold the smallest possible message
    #[error("buffer of {0} bytes is too small")]
    BufferTooSmall(usize),
}
