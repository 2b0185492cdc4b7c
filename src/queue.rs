//! Per-disk request queues served by worker threads.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::QueuePolicy;
use crate::error::{Error, Result};
use crate::file::BlockFile;
use crate::request::{Request, RequestKind};
use crate::stats::Stats;

/// Sequence number given to promoted requests; sorts before every regular submission.
const CRITICAL: u64 = 0;

struct Pending {
    seq: u64,
    request: Request,
}

struct QueueState {
    reads: VecDeque<Pending>,
    writes: VecDeque<Pending>,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    fn pop(&mut self, policy: QueuePolicy) -> Option<Request> {
        let take_read = match (self.reads.front(), self.writes.front()) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(read), Some(write)) => match policy {
                QueuePolicy::Fifo => read.seq <= write.seq,
                QueuePolicy::PrioritizeReads => read.seq <= write.seq || write.seq != CRITICAL,
            },
        };

        let queue = if take_read { &mut self.reads } else { &mut self.writes };
        queue.pop_front().map(|pending| pending.request)
    }

    /// Marks a queued request critical and moves it to the head of its queue.
    fn promote(&mut self, request: &Request) -> bool {
        let queue = match request.kind() {
            RequestKind::Read => &mut self.reads,
            RequestKind::Write => &mut self.writes,
        };

        match queue.iter().position(|pending| pending.request.same_as(request)) {
            Some(pos) => {
                if let Some(mut pending) = queue.remove(pos) {
                    pending.seq = CRITICAL;
                    queue.push_front(pending);
                }
                true
            }
            None => false,
        }
    }
}

struct Shared {
    disk: usize,
    policy: QueuePolicy,
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Queue of one disk plus the threads draining it.
///
/// Dropping the queue lets the workers finish every queued request, then joins them.
pub struct DiskQueue {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl DiskQueue {
    pub fn start(
        disk: usize,
        file: Arc<dyn BlockFile>,
        threads: usize,
        policy: QueuePolicy,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            disk,
            policy,
            state: Mutex::new(QueueState {
                reads: VecDeque::new(),
                writes: VecDeque::new(),
                next_seq: CRITICAL + 1,
                shutdown: false,
            }),
            ready: Condvar::new(),
        });

        let mut queue = DiskQueue {
            shared: shared.clone(),
            workers: Vec::with_capacity(threads),
        };
        for idx in 0..threads {
            let shared = shared.clone();
            let file = file.clone();
            let stats = stats.clone();
            let handle = thread::Builder::new()
                .name(format!("extmem-disk{}-{}", disk, idx))
                .spawn(move || serve(shared, file, stats))
                .map_err(|err| Error::device(format!("disk {} worker", disk), err))?;
            queue.workers.push(handle);
        }

        log::debug!("disk {} queue started ({} workers, {:?})", disk, threads, policy);
        return Ok(queue);
    }

    /// Appends a request. O(1).
    pub fn submit(&self, request: Request) {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        log::trace!("disk {}: queued {:?}", self.shared.disk, request);
        let pending = Pending { seq, request };
        match pending.request.kind() {
            RequestKind::Read => state.reads.push_back(pending),
            RequestKind::Write => state.writes.push_back(pending),
        }
        self.shared.ready.notify_one();
    }

    /// Moves a still-queued request to the head of the queue.
    ///
    /// Returns `false` if a worker already took it.
    pub fn promote(&self, request: &Request) -> bool {
        let promoted = self.shared.state.lock().promote(request);
        if promoted {
            log::trace!("disk {}: promoted {:?}", self.shared.disk, request);
        }
        promoted
    }

    /// Number of requests waiting for a worker.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.reads.len() + state.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().is_empty()
    }
}

impl Drop for DiskQueue {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.ready.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("disk {} worker panicked", self.shared.disk);
            }
        }
        log::debug!("disk {} queue stopped", self.shared.disk);
    }
}

fn serve(shared: Arc<Shared>, file: Arc<dyn BlockFile>, stats: Arc<Stats>) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if let Some(request) = state.pop(shared.policy) {
                    break request;
                }
                if state.shutdown {
                    return;
                }
                shared.ready.wait(&mut state);
            }
        };

        let mut buffer = match request.start() {
            Some(buffer) => buffer,
            None => continue,
        };

        let bid = request.bid();
        let started = Instant::now();
        let outcome = match request.kind() {
            RequestKind::Read => file.read_at(bid.offset, &mut buffer[..bid.size]),
            RequestKind::Write => file.write_at(bid.offset, &buffer[..bid.size]),
        };
        let elapsed = started.elapsed();

        let outcome = match outcome {
            Ok(()) => {
                match request.kind() {
                    RequestKind::Read => stats.record_read(bid.size, elapsed),
                    RequestKind::Write => stats.record_write(bid.size, elapsed),
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(Error::Eof {
                bid,
                file_size: file.size().unwrap_or(0),
            }),
            Err(err) => {
                log::warn!("{:?} of {} on {} failed: {}", request.kind(), bid, file.name(), err);
                Err(Error::io(bid, err))
            }
        };

        log::trace!("disk {}: finished {:?}", shared.disk, request);
        request.complete(buffer, outcome);
    }
}
