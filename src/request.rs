//! Asynchronous I/O tickets.
//!
//! A [`Request`] owns its block buffer from submission until it reaches a terminal state. It is
//! shared between the submitter and the disk worker serving it, and lives until both let go.
//! States only move forward: `Pending -> InFlight -> Completed | Failed`, and `Pending -> Failed`
//! on cancellation.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::block::Bid;
use crate::buffer::AlignedBuffer;
use crate::error::{Error, Result};
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

struct Slot {
    state: RequestState,
    buffer: Option<AlignedBuffer>,
    error: Option<Error>,
}

struct Shared {
    kind: RequestKind,
    bid: Bid,
    slot: Mutex<Slot>,
    done: Condvar,
    stats: Arc<Stats>,
}

/// Shared handle to one block transfer.
#[derive(Clone)]
pub struct Request {
    shared: Arc<Shared>,
}

impl Request {
    pub(crate) fn new(kind: RequestKind, bid: Bid, buffer: AlignedBuffer, stats: Arc<Stats>) -> Self {
        Request {
            shared: Arc::new(Shared {
                kind,
                bid,
                slot: Mutex::new(Slot {
                    state: RequestState::Pending,
                    buffer: Some(buffer),
                    error: None,
                }),
                done: Condvar::new(),
                stats,
            }),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.shared.kind
    }

    pub fn bid(&self) -> Bid {
        self.shared.bid
    }

    pub fn state(&self) -> RequestState {
        self.shared.slot.lock().state
    }

    /// Returns `true` once the request is terminal. Never blocks.
    pub fn poll(&self) -> bool {
        self.state().is_terminal()
    }

    /// Blocks until the request is terminal and reports its outcome.
    ///
    /// Idempotent: later calls return the same outcome immediately.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock();
        if !slot.state.is_terminal() {
            let started = Instant::now();
            while !slot.state.is_terminal() {
                self.shared.done.wait(&mut slot);
            }
            match self.shared.kind {
                RequestKind::Read => self.shared.stats.record_read_wait(started.elapsed()),
                RequestKind::Write => self.shared.stats.record_write_wait(started.elapsed()),
            }
        }

        match &slot.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Cancels the request if no worker has picked it up yet.
    pub fn cancel(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state != RequestState::Pending {
            return false;
        }

        log::trace!("cancelled {:?} of {}", self.shared.kind, self.shared.bid);
        slot.state = RequestState::Failed;
        slot.error = Some(Error::Cancelled);
        self.shared.done.notify_all();
        return true;
    }

    /// Waits for completion and takes the block buffer back.
    pub fn into_buffer(self) -> Result<AlignedBuffer> {
        self.wait()?;
        let buffer = self.shared.slot.lock().buffer.take();
        buffer.ok_or_else(|| Error::logic(format!("buffer of {} taken twice", self.shared.bid)))
    }

    /// Moves a pending request in flight and lends its buffer to the worker.
    ///
    /// Returns `None` when the request was cancelled meanwhile.
    pub(crate) fn start(&self) -> Option<AlignedBuffer> {
        let mut slot = self.shared.slot.lock();
        if slot.state != RequestState::Pending {
            return None;
        }
        slot.state = RequestState::InFlight;
        slot.buffer.take()
    }

    /// Returns the buffer and publishes the terminal state.
    pub(crate) fn complete(&self, buffer: AlignedBuffer, outcome: Result<()>) {
        let mut slot = self.shared.slot.lock();
        slot.buffer = Some(buffer);
        match outcome {
            Ok(()) => slot.state = RequestState::Completed,
            Err(err) => {
                slot.state = RequestState::Failed;
                slot.error = Some(err);
            }
        }
        self.shared.done.notify_all();
    }

    pub(crate) fn same_as(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.shared.kind)
            .field("bid", &self.shared.bid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{Request, RequestKind, RequestState};
    use crate::block::{Bid, PAGE_SIZE};
    use crate::buffer::AlignedBuffer;
    use crate::error::Error;
    use crate::stats::Stats;

    fn request(kind: RequestKind) -> Request {
        let buffer = AlignedBuffer::new(PAGE_SIZE).unwrap();
        Request::new(kind, Bid::new(0, 0, PAGE_SIZE), buffer, Arc::new(Stats::new()))
    }

    #[test]
    fn test_request_lifecycle() {
        let req = request(RequestKind::Read);
        assert_eq!(req.state(), RequestState::Pending);
        assert!(!req.poll());

        let worker = req.clone();
        let handle = thread::spawn(move || {
            let mut buffer = worker.start().unwrap();
            thread::sleep(Duration::from_millis(10));
            buffer[0] = 42;
            worker.complete(buffer, Ok(()));
        });

        req.wait().unwrap();
        req.wait().unwrap();
        assert!(req.poll());
        assert_eq!(req.state(), RequestState::Completed);
        assert!(!req.cancel());
        assert_eq!(req.into_buffer().unwrap()[0], 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_request_cancel() {
        let req = request(RequestKind::Write);
        assert!(req.cancel());
        assert!(!req.cancel());
        assert!(req.start().is_none());
        assert!(matches!(req.wait(), Err(Error::Cancelled)));
        assert_eq!(req.state(), RequestState::Failed);
    }

    #[test]
    fn test_request_failure_is_sticky() {
        let req = request(RequestKind::Read);
        let buffer = req.start().unwrap();
        assert!(!req.cancel());
        req.complete(buffer, Err(Error::BadParameter("boom".to_string())));

        assert!(matches!(req.wait(), Err(Error::BadParameter(_))));
        assert!(matches!(req.wait(), Err(Error::BadParameter(_))));
    }
}
