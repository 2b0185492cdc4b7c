//! I/O statistics.

use std::fmt;
use std::ops::Sub;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotone I/O counters shared by all disks of a storage subsystem.
pub struct Stats {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_wait_ns: AtomicU64,
    write_wait_ns: AtomicU64,
    io_ns: AtomicU64,
    created: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_wait_ns: AtomicU64::new(0),
            write_wait_ns: AtomicU64::new(0),
            io_ns: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub(crate) fn record_read(&self, bytes: usize, elapsed: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.io_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, bytes: usize, elapsed: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.io_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read_wait(&self, waited: Duration) {
        self.read_wait_ns.fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_wait(&self, waited: Duration) {
        self.write_wait_ns.fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Reads all counters at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_wait: Duration::from_nanos(self.read_wait_ns.load(Ordering::Relaxed)),
            write_wait: Duration::from_nanos(self.write_wait_ns.load(Ordering::Relaxed)),
            io_time: Duration::from_nanos(self.io_ns.load(Ordering::Relaxed)),
            elapsed: self.created.elapsed(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

/// Point-in-time copy of [`Stats`]. The difference of two snapshots describes one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Time callers spent blocked on reads.
    pub read_wait: Duration,
    /// Time callers spent blocked on writes.
    pub write_wait: Duration,
    /// Time disk workers spent inside the device.
    pub io_time: Duration,
    pub elapsed: Duration,
}

impl Sub for StatsSnapshot {
    type Output = StatsSnapshot;

    fn sub(self, rhs: StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.saturating_sub(rhs.reads),
            writes: self.writes.saturating_sub(rhs.writes),
            bytes_read: self.bytes_read.saturating_sub(rhs.bytes_read),
            bytes_written: self.bytes_written.saturating_sub(rhs.bytes_written),
            read_wait: self.read_wait.saturating_sub(rhs.read_wait),
            write_wait: self.write_wait.saturating_sub(rhs.write_wait),
            io_time: self.io_time.saturating_sub(rhs.io_time),
            elapsed: self.elapsed.saturating_sub(rhs.elapsed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "blocks read:     {}", self.reads)?;
        writeln!(f, "blocks written:  {}", self.writes)?;
        writeln!(f, "bytes read:      {}", bytesize::ByteSize(self.bytes_read))?;
        writeln!(f, "bytes written:   {}", bytesize::ByteSize(self.bytes_written))?;
        writeln!(f, "read wait:       {:.3?}", self.read_wait)?;
        writeln!(f, "write wait:      {:.3?}", self.write_wait)?;
        writeln!(f, "device time:     {:.3?}", self.io_time)?;
        write!(f, "elapsed:         {:.3?}", self.elapsed)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::Stats;

    #[test]
    fn test_snapshot_difference() {
        let stats = Stats::new();
        stats.record_read(4096, Duration::from_millis(1));
        let before = stats.snapshot();

        stats.record_read(4096, Duration::from_millis(1));
        stats.record_write(8192, Duration::from_millis(2));
        stats.record_read_wait(Duration::from_millis(3));
        let phase = stats.snapshot() - before;

        assert_eq!(phase.reads, 1);
        assert_eq!(phase.writes, 1);
        assert_eq!(phase.bytes_read, 4096);
        assert_eq!(phase.bytes_written, 8192);
        assert_eq!(phase.read_wait, Duration::from_millis(3));
        assert_eq!(phase.io_time, Duration::from_millis(3));
    }
}
