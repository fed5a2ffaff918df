use std::time::Duration;

use rand::Rng;

use crate::config::TransmissionParams;

/// Progression of response timeouts for one confirmable request
///
/// The first timeout is drawn uniformly from `[ack_timeout, ack_timeout * ack_random_factor]`;
/// each later one doubles the previous.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct RetryState {
    retry_count: u32,
    recv_timeout: Duration,
}

impl RetryState {
    pub(crate) fn update<R: Rng>(&mut self, params: &TransmissionParams, rng: &mut R) {
        self.recv_timeout = if self.retry_count == 0 {
            let factor = rng.random_range(1.0..=params.ack_random_factor);
            params.ack_timeout.mul_f64(factor)
        } else {
            self.recv_timeout * 2
        };
        self.retry_count += 1;
    }

    pub(crate) fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }
}

/// How a retryable job is re-armed each time it asks to be retried
///
/// The job fires again after `delay`; the delay then doubles, saturating at `max_delay`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Backoff {
    /// Delay before the next firing
    pub delay: Duration,
    /// Ceiling for `delay`
    pub max_delay: Duration,
}

impl Backoff {
    /// The backoff that applies after one more retry
    pub fn next(self) -> Self {
        Self {
            delay: (self.delay * 2).min(self.max_delay),
            max_delay: self.max_delay,
        }
    }
}

/// Delay before the first retransmission, and the backoff for the rest
pub(crate) fn retransmission_schedule<R: Rng>(
    params: &TransmissionParams,
    rng: &mut R,
) -> (Duration, Backoff) {
    let mut state = RetryState::default();
    state.update(params, rng);
    let first = state.recv_timeout();
    state.update(params, rng);
    let backoff = Backoff {
        delay: state.recv_timeout(),
        max_delay: params.max_transmit_span(),
    };
    (first, backoff)
}
