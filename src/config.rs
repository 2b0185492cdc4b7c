//! Disk configuration.
//!
//! A configuration file lists one disk per line:
//!
//! ```text
//! # path, capacity (0 grows as needed), flavor
//! disk=/var/tmp/extmem.$$.0,0,syscall
//! disk=/dev/sdb1,500GiB,direct
//! threads_per_disk=2
//! queue=prioritize_reads
//! ```
//!
//! `$$` inside a path is replaced by the process id. Blank lines and `#` comments are ignored.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytesize::ByteSize;

use crate::error::{Error, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "EXTMEM_CONFIG";

/// How a disk's file is opened and accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFlavor {
    /// Positional read/write system calls.
    Syscall,
    /// Unbuffered I/O bypassing the page cache (Linux `O_DIRECT`).
    Direct,
    /// Memory-mapped file.
    Mmap,
    /// Windows native positional I/O.
    Wincall,
    /// RAM-backed scratch device.
    Memory,
}

impl FromStr for IoFlavor {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "syscall" => Ok(IoFlavor::Syscall),
            "direct" => Ok(IoFlavor::Direct),
            "mmap" => Ok(IoFlavor::Mmap),
            "wincall" => Ok(IoFlavor::Wincall),
            "memory" => Ok(IoFlavor::Memory),
            other => Err(format!("unknown I/O flavor '{}'", other)),
        }
    }
}

impl fmt::Display for IoFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoFlavor::Syscall => "syscall",
            IoFlavor::Direct => "direct",
            IoFlavor::Mmap => "mmap",
            IoFlavor::Wincall => "wincall",
            IoFlavor::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Order in which a disk worker serves its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Strict submission order.
    Fifo,
    /// Reads are served before queued writes.
    PrioritizeReads,
}

impl FromStr for QueuePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "fifo" => Ok(QueuePolicy::Fifo),
            "prioritize_reads" => Ok(QueuePolicy::PrioritizeReads),
            other => Err(format!("unknown queue policy '{}'", other)),
        }
    }
}

/// One configured disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub path: PathBuf,
    /// Capacity in bytes. Zero grows the disk as needed.
    pub capacity: u64,
    pub flavor: IoFlavor,
}

impl DiskConfig {
    pub fn new(path: impl Into<PathBuf>, capacity: u64, flavor: IoFlavor) -> Self {
        DiskConfig {
            path: path.into(),
            capacity,
            flavor,
        }
    }

    fn parse(value: &str, line: usize) -> Result<Self> {
        let fields: Vec<&str> = value.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(Error::Config {
                line,
                reason: format!("expected <path>,<size>,<flavor>, got '{}'", value),
            });
        }
        if fields[0].is_empty() {
            return Err(Error::Config {
                line,
                reason: "empty disk path".to_string(),
            });
        }

        let path = fields[0].replace("$$", &std::process::id().to_string());
        let capacity = parse_size(fields[1]).map_err(|reason| Error::Config { line, reason })?;
        let flavor = fields[2].parse().map_err(|reason| Error::Config { line, reason })?;

        return Ok(DiskConfig::new(path, capacity, flavor));
    }
}

/// Cuts a `#` comment that opens the line or follows whitespace. `#` inside a value is kept.
fn strip_comment(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b'#' && (idx == 0 || bytes[idx - 1].is_ascii_whitespace()) {
            return &raw[..idx];
        }
    }
    raw
}

fn parse_size(value: &str) -> std::result::Result<u64, String> {
    if let Ok(bytes) = value.parse::<u64>() {
        return Ok(bytes);
    }
    value
        .parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|err| format!("invalid size '{}': {}", value, err))
}

/// Process-wide storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub disks: Vec<DiskConfig>,
    /// Worker threads serving each disk queue.
    pub threads_per_disk: usize,
    pub queue_policy: QueuePolicy,
    /// Resolve disk paths inside a fresh temporary directory removed on shutdown.
    pub scratch: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::scratch(1)
    }
}

impl StorageConfig {
    /// `disks` grow-as-needed syscall disks inside a temporary directory.
    pub fn scratch(disks: usize) -> Self {
        StorageConfig {
            disks: (0..disks)
                .map(|idx| DiskConfig::new(format!("extmem.{}.disk", idx), 0, IoFlavor::Syscall))
                .collect(),
            threads_per_disk: 1,
            queue_policy: QueuePolicy::Fifo,
            scratch: true,
        }
    }

    /// `disks` RAM-backed disks of `capacity` bytes each (zero grows as needed).
    pub fn memory(disks: usize, capacity: u64) -> Self {
        StorageConfig {
            disks: (0..disks)
                .map(|idx| DiskConfig::new(format!("memory.{}", idx), capacity, IoFlavor::Memory))
                .collect(),
            threads_per_disk: 1,
            queue_policy: QueuePolicy::Fifo,
            scratch: false,
        }
    }

    pub fn with_threads_per_disk(mut self, threads: usize) -> Self {
        self.threads_per_disk = threads;
        return self;
    }

    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        return self;
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = StorageConfig {
            disks: Vec::new(),
            threads_per_disk: 1,
            queue_policy: QueuePolicy::Fifo,
            scratch: false,
        };

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let content = strip_comment(raw).trim();
            if content.is_empty() {
                continue;
            }

            let (key, value) = content.split_once('=').ok_or_else(|| Error::Config {
                line,
                reason: format!("expected key=value, got '{}'", content),
            })?;

            match key.trim() {
                "disk" => config.disks.push(DiskConfig::parse(value, line)?),
                "threads_per_disk" => {
                    config.threads_per_disk = value.trim().parse().map_err(|err| Error::Config {
                        line,
                        reason: format!("invalid thread count: {}", err),
                    })?
                }
                "queue" => config.queue_policy = value.parse().map_err(|reason| Error::Config { line, reason })?,
                other => {
                    return Err(Error::Config {
                        line,
                        reason: format!("unknown key '{}'", other),
                    })
                }
            }
        }

        config.validate()?;
        return Ok(config);
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| Error::device(path.display().to_string(), err))?;
        log::info!("reading disk configuration from {}", path.display());
        Self::parse(&text)
    }

    /// Reads the file named by [`CONFIG_ENV`], or falls back to a single scratch disk.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => {
                log::info!("{} not set, using a temporary scratch disk", CONFIG_ENV);
                Ok(StorageConfig::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.disks.is_empty() {
            return Err(Error::BadParameter("no disks configured".to_string()));
        }
        if self.threads_per_disk == 0 {
            return Err(Error::BadParameter("threads_per_disk must be positive".to_string()));
        }
        return Ok(());
    }
}
