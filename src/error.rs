//! Library error type.

use std::io;
use std::sync::Arc;

use crate::block::Bid;

pub type Result<T> = std::result::Result<T, Error>;

/// Error surfaced at the nearest synchronous boundary: `Request::wait`, a prefetcher pull,
/// a writer flush or the top-level algorithm call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Read or write failed on the underlying device.
    #[error("I/O error on {bid}: {source}")]
    Io {
        bid: Bid,
        #[source]
        source: Arc<io::Error>,
    },
    /// Attempt to read past the end of a device.
    #[error("read of {bid} past end of file ({file_size} bytes)")]
    Eof { bid: Bid, file_size: u64 },
    /// Misaligned buffer, unsupported block size, fan-in below two and the like.
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// The block manager could not satisfy an allocation.
    #[error("no space left on disk {disk} for {requested} bytes")]
    NoSpace { disk: usize, requested: u64 },
    /// User comparator signaled a failure.
    #[error("comparator failed: {0}")]
    Comparator(String),
    /// Internal invariant violation.
    #[error("logic error: {0}")]
    Logic(String),
    /// Request was cancelled before a worker picked it up.
    #[error("request cancelled")]
    Cancelled,
    /// Malformed disk configuration.
    #[error("configuration error at line {line}: {reason}")]
    Config { line: usize, reason: String },
    /// Sorting thread pool could not be started.
    #[error("thread pool initialization failed")]
    ThreadPool(#[source] Arc<rayon::ThreadPoolBuildError>),
    /// Device could not be opened or resized outside of a request.
    #[error("device error on {path}: {source}")]
    Device {
        path: String,
        #[source]
        source: Arc<io::Error>,
    },
}

impl Error {
    pub(crate) fn io(bid: Bid, err: io::Error) -> Self {
        Error::Io {
            bid,
            source: Arc::new(err),
        }
    }

    pub(crate) fn device(path: impl Into<String>, err: io::Error) -> Self {
        Error::Device {
            path: path.into(),
            source: Arc::new(err),
        }
    }

    /// Builds a logic error. Invariant violations abort debug builds.
    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("invariant violated: {}", msg);
        debug_assert!(false, "invariant violated: {}", msg);
        Error::Logic(msg)
    }

    /// Returns `true` for errors the algorithms recover from by cleaning up and reporting.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Logic(_))
    }
}
