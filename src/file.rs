//! Block device abstraction.
//!
//! A [`BlockFile`] performs blocking positional I/O. Asynchrony lives one level up: disk
//! workers call into the file and post the outcome to a [`crate::request::Request`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::PAGE_SIZE;
use crate::config::{DiskConfig, IoFlavor};
use crate::error::{Error, Result};

/// Device interface consumed by the disk queues.
///
/// Reads past the current size fail with [`io::ErrorKind::UnexpectedEof`].
pub trait BlockFile: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn set_size(&self, size: u64) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;

    /// Required alignment of buffers, offsets and lengths.
    fn alignment(&self) -> usize {
        1
    }

    /// Name used in diagnostics.
    fn name(&self) -> &str;
}

#[cfg(target_os = "linux")]
fn check_aligned(alignment: usize, offset: u64, buf: &[u8]) -> io::Result<()> {
    if alignment > 1
        && (offset % alignment as u64 != 0 || buf.len() % alignment != 0 || buf.as_ptr() as usize % alignment != 0)
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "unaligned access (offset {}, length {}, alignment {})",
                offset,
                buf.len(),
                alignment
            ),
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn pread(file: &fs::File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &fs::File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &fs::File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite(file: &fs::File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

/// File accessed with positional read/write system calls.
pub struct SyscallFile {
    file: fs::File,
    name: String,
}

impl SyscallFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(Self::from_file(file, path.display().to_string()))
    }

    pub fn from_file(file: fs::File, name: impl Into<String>) -> Self {
        SyscallFile { file, name: name.into() }
    }
}

impl BlockFile for SyscallFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        pread(&self.file, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        pwrite(&self.file, offset, buf)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// File opened with `O_DIRECT`; every access must be page aligned.
#[cfg(target_os = "linux")]
pub struct DirectFile {
    file: fs::File,
    name: String,
}

#[cfg(target_os = "linux")]
impl DirectFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;
        Ok(DirectFile {
            file,
            name: path.display().to_string(),
        })
    }
}

#[cfg(target_os = "linux")]
impl BlockFile for DirectFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_aligned(PAGE_SIZE, offset, buf)?;
        pread(&self.file, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_aligned(PAGE_SIZE, offset, buf)?;
        pwrite(&self.file, offset, buf)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn alignment(&self) -> usize {
        PAGE_SIZE
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Memory-mapped file. Growing the file remaps it.
pub struct MmapFile {
    file: fs::File,
    map: RwLock<Option<memmap2::MmapMut>>,
    name: String,
}

impl MmapFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let map = Self::map(&file)?;
        Ok(MmapFile {
            file,
            map: RwLock::new(map),
            name: path.display().to_string(),
        })
    }

    fn map(file: &fs::File) -> io::Result<Option<memmap2::MmapMut>> {
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        // SAFETY: the file is owned by this MmapFile and only resized under the map's write lock.
        let map = unsafe { memmap2::MmapMut::map_mut(file)? };
        Ok(Some(map))
    }

    fn mapped_len(map: &Option<memmap2::MmapMut>) -> u64 {
        map.as_ref().map_or(0, |map| map.len() as u64)
    }
}

impl BlockFile for MmapFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let map = self.map.read();
        let end = offset + buf.len() as u64;
        match map.as_ref() {
            Some(map) if end <= map.len() as u64 => {
                buf.copy_from_slice(&map[offset as usize..end as usize]);
                Ok(())
            }
            _ => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
        }
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut map = self.map.write();
        let end = offset + buf.len() as u64;
        if end > Self::mapped_len(&map) {
            *map = None;
            self.file.set_len(end)?;
            *map = Self::map(&self.file)?;
        }
        match map.as_mut() {
            Some(map) => {
                map[offset as usize..end as usize].copy_from_slice(buf);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "file is not mapped")),
        }
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&self, size: u64) -> io::Result<()> {
        let mut map = self.map.write();
        if let Some(map) = map.as_ref() {
            map.flush()?;
        }
        *map = None;
        self.file.set_len(size)?;
        *map = Self::map(&self.file)?;
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        match self.map.read().as_ref() {
            Some(map) => map.flush(),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// RAM-backed device.
pub struct MemoryFile {
    data: RwLock<Vec<u8>>,
    name: String,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryFile {
            data: RwLock::new(Vec::new()),
            name: name.into(),
        }
    }
}

impl BlockFile for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.read();
        let end = offset as usize + buf.len();
        if end > data.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        buf.copy_from_slice(&data[offset as usize..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.write();
        let end = offset as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_size(&self, size: u64) -> io::Result<()> {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens the device described by `config`, resolving relative paths against `base_dir`.
pub fn open_file(config: &DiskConfig, base_dir: Option<&Path>) -> Result<Arc<dyn BlockFile>> {
    let path: PathBuf = match base_dir {
        Some(dir) if config.path.is_relative() => dir.join(&config.path),
        _ => config.path.clone(),
    };
    let name = path.display().to_string();

    let file: Arc<dyn BlockFile> = match config.flavor {
        IoFlavor::Syscall => Arc::new(SyscallFile::open(&path).map_err(|err| Error::device(&name, err))?),
        IoFlavor::Mmap => Arc::new(MmapFile::open(&path).map_err(|err| Error::device(&name, err))?),
        IoFlavor::Memory => Arc::new(MemoryFile::new(&name)),
        IoFlavor::Direct => open_direct(&path)?,
        IoFlavor::Wincall => open_wincall(&path)?,
    };

    if config.capacity > 0 {
        if config.capacity % PAGE_SIZE as u64 != 0 {
            return Err(Error::BadParameter(format!(
                "capacity {} of {} is not a multiple of {}",
                config.capacity, name, PAGE_SIZE
            )));
        }
        file.set_size(config.capacity).map_err(|err| Error::device(&name, err))?;
    }

    log::info!(
        "opened disk {} ({}, capacity {})",
        name,
        config.flavor,
        if config.capacity == 0 {
            "grows as needed".to_string()
        } else {
            bytesize::ByteSize(config.capacity).to_string()
        }
    );

    return Ok(file);
}

#[cfg(target_os = "linux")]
fn open_direct(path: &Path) -> Result<Arc<dyn BlockFile>> {
    let file = DirectFile::open(path).map_err(|err| Error::device(path.display().to_string(), err))?;
    Ok(Arc::new(file))
}

#[cfg(not(target_os = "linux"))]
fn open_direct(path: &Path) -> Result<Arc<dyn BlockFile>> {
    Err(Error::BadParameter(format!(
        "direct I/O is not available on this platform ({})",
        path.display()
    )))
}

#[cfg(windows)]
fn open_wincall(path: &Path) -> Result<Arc<dyn BlockFile>> {
    let file = SyscallFile::open(path).map_err(|err| Error::device(path.display().to_string(), err))?;
    Ok(Arc::new(file))
}

#[cfg(not(windows))]
fn open_wincall(path: &Path) -> Result<Arc<dyn BlockFile>> {
    Err(Error::BadParameter(format!(
        "wincall I/O is only available on Windows ({})",
        path.display()
    )))
}

#[cfg(test)]
mod test {
    use std::io;
    use std::sync::Arc;

    use rstest::*;

    use super::{open_file, BlockFile, MemoryFile};
    use crate::config::{DiskConfig, IoFlavor};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn exercise(file: Arc<dyn BlockFile>) {
        let block = vec![0xabu8; 4096];
        file.write_at(8192, &block).unwrap();
        assert_eq!(file.size().unwrap(), 12288);

        let mut restored = vec![0u8; 4096];
        file.read_at(8192, &mut restored).unwrap();
        assert_eq!(restored, block);

        let mut hole = vec![1u8; 4096];
        file.read_at(0, &mut hole).unwrap();
        assert!(hole.iter().all(|b| *b == 0));

        let err = file.read_at(12288, &mut restored).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        file.set_size(4096 * 16).unwrap();
        assert_eq!(file.size().unwrap(), 4096 * 16);
        file.read_at(8192, &mut restored).unwrap();
        assert_eq!(restored, block);
        file.sync().unwrap();
    }

    #[rstest]
    #[case(IoFlavor::Syscall)]
    #[case(IoFlavor::Mmap)]
    #[case(IoFlavor::Memory)]
    fn test_file_flavors(tmp_dir: tempfile::TempDir, #[case] flavor: IoFlavor) {
        let config = DiskConfig::new("disk.0", 0, flavor);
        let file = open_file(&config, Some(tmp_dir.path())).unwrap();
        exercise(file);
    }

    #[rstest]
    fn test_fixed_capacity(tmp_dir: tempfile::TempDir) {
        let config = DiskConfig::new("disk.0", 1 << 20, IoFlavor::Syscall);
        let file = open_file(&config, Some(tmp_dir.path())).unwrap();
        assert_eq!(file.size().unwrap(), 1 << 20);
    }

    #[test]
    fn test_memory_file_name() {
        assert_eq!(MemoryFile::new("ram").name(), "ram");
    }
}
