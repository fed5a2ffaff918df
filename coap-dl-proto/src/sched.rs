//! Timer contract between the download logic and whatever drives time

use std::{collections::BTreeSet, fmt, time::Duration, time::Instant};

use slab::Slab;
use thiserror::Error;
use tracing::trace;

use crate::{downloader::TransferId, retry::Backoff};

/// Arms and cancels timed jobs on behalf of transfers
///
/// Fired jobs are handed back to `Downloader::handle_timeout`, whose [`JobOutcome`] tells a
/// retryable job whether to fire again.
pub trait Scheduler {
    /// Current time as seen by the scheduler
    fn now(&self) -> Instant;
    /// Fire `job` once after `delay`
    fn arm(&mut self, delay: Duration, job: Job) -> Result<JobHandle, ScheduleError>;
    /// Fire `job` after `delay`, then keep re-firing it according to `backoff` for as long as it
    /// reports [`JobOutcome::Retry`]
    fn arm_retryable(
        &mut self,
        delay: Duration,
        backoff: Backoff,
        job: Job,
    ) -> Result<JobHandle, ScheduleError>;
    /// Forget a job; it will not fire again. Unknown or stale handles are ignored.
    fn cancel(&mut self, handle: JobHandle);
}

/// Identifies one armed job for as long as it stays armed
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct JobHandle {
    key: usize,
    generation: u64,
}

impl JobHandle {
    /// Build a handle for a custom `Scheduler` implementation
    ///
    /// `generation` must never repeat for the same `key`.
    pub fn new(key: usize, generation: u64) -> Self {
        Self { key, generation }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobHandle({}/{})", self.key, self.generation)
    }
}

/// What a fired job should do
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Job {
    /// Transfer the job belongs to
    pub transfer: TransferId,
    /// Which phase of the transfer armed it
    pub kind: JobKind,
}

/// The reasons a transfer arms a timer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JobKind {
    /// Send the first block request
    InitialSend,
    /// Resend the outstanding request
    Retransmit,
    /// Give up waiting for a separate response
    SeparateResponseTimeout,
}

/// Result of running a fired job
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JobOutcome {
    /// The job is finished and must not fire again
    Done,
    /// Fire again after the next backoff step
    Retry,
}

/// The scheduler could not arm a job
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("could not schedule job")]
pub struct ScheduleError;

/// A deterministic [`Scheduler`] driven by externally supplied time
///
/// Holds no clock of its own: the owner advances it with [`TimerQueue::advance`] and then drains
/// expired jobs with [`TimerQueue::poll_expired`], reporting each job's outcome through
/// [`TimerQueue::complete`].
#[derive(Debug)]
pub struct TimerQueue {
    jobs: Slab<Entry>,
    /// Armed jobs in expiry order; jobs currently firing are absent
    queue: BTreeSet<(Instant, usize)>,
    now: Instant,
    next_generation: u64,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    job: Job,
    expiry: Option<Instant>,
    backoff: Option<Backoff>,
}

impl TimerQueue {
    /// Create an empty queue whose clock starts at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            jobs: Slab::new(),
            queue: BTreeSet::new(),
            now,
            next_generation: 0,
        }
    }

    /// Move the clock forward; `now` earlier than the current time is ignored
    pub fn advance(&mut self, now: Instant) {
        self.now = self.now.max(now);
    }

    /// Earliest expiry among armed jobs
    pub fn next_timeout(&self) -> Option<Instant> {
        self.queue.first().map(|&(expiry, _)| expiry)
    }

    /// Take the next job whose expiry has passed
    ///
    /// The job stays allocated until its outcome is reported to `complete`, or it is cancelled.
    pub fn poll_expired(&mut self) -> Option<(JobHandle, Job)> {
        let &(expiry, key) = self.queue.first()?;
        if expiry > self.now {
            return None;
        }
        self.queue.remove(&(expiry, key));
        let entry = &mut self.jobs[key];
        entry.expiry = None;
        Some((
            JobHandle {
                key,
                generation: entry.generation,
            },
            entry.job,
        ))
    }

    /// Report the outcome of a job returned by `poll_expired`
    ///
    /// Jobs cancelled while firing are left alone.
    pub fn complete(&mut self, handle: JobHandle, outcome: JobOutcome) {
        let Some(entry) = live_entry(&mut self.jobs, handle) else {
            return;
        };
        if entry.expiry.is_some() {
            // Not firing; nothing to complete
            return;
        }
        match (outcome, entry.backoff) {
            (JobOutcome::Retry, Some(backoff)) => {
                let expiry = self.now + backoff.delay;
                entry.backoff = Some(backoff.next());
                entry.expiry = Some(expiry);
                trace!(?handle, delay = ?backoff.delay, "retrying job");
                self.queue.insert((expiry, handle.key));
            }
            _ => {
                self.jobs.remove(handle.key);
            }
        }
    }

    /// Whether `handle` refers to a job that has not finished or been cancelled
    pub fn is_live(&self, handle: JobHandle) -> bool {
        self.jobs
            .get(handle.key)
            .is_some_and(|entry| entry.generation == handle.generation)
    }

    /// Live jobs belonging to `transfer`
    pub fn jobs_for(&self, transfer: TransferId) -> usize {
        self.jobs
            .iter()
            .filter(|(_, entry)| entry.job.transfer == transfer)
            .count()
    }

    /// Number of live jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is live
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn insert(&mut self, delay: Duration, backoff: Option<Backoff>, job: Job) -> JobHandle {
        let expiry = self.now + delay;
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = self.jobs.insert(Entry {
            generation,
            job,
            expiry: Some(expiry),
            backoff,
        });
        self.queue.insert((expiry, key));
        JobHandle { key, generation }
    }
}

fn live_entry(jobs: &mut Slab<Entry>, handle: JobHandle) -> Option<&mut Entry> {
    jobs.get_mut(handle.key)
        .filter(|entry| entry.generation == handle.generation)
}

impl Scheduler for TimerQueue {
    fn now(&self) -> Instant {
        self.now
    }

    fn arm(&mut self, delay: Duration, job: Job) -> Result<JobHandle, ScheduleError> {
        Ok(self.insert(delay, None, job))
    }

    fn arm_retryable(
        &mut self,
        delay: Duration,
        backoff: Backoff,
        job: Job,
    ) -> Result<JobHandle, ScheduleError> {
        Ok(self.insert(delay, Some(backoff), job))
    }

    fn cancel(&mut self, handle: JobHandle) {
        let Some(entry) = live_entry(&mut self.jobs, handle) else {
            return;
        };
        if let Some(expiry) = entry.expiry {
            self.queue.remove(&(expiry, handle.key));
        }
        self.jobs.remove(handle.key);
    }
}
