//! Storage-device abstraction.
//!
//! A [`Device`] is a bytes-and-seek surface with a single scoped
//! exclusive-access primitive. Three concrete backends are provided: a
//! seekable OS file, a growable in-memory buffer, and a caller-supplied set
//! of operation pointers (`Device` trait objects standing in for C function
//! pointers).

mod file;
mod memory;
mod ops;

pub use file::FileDevice;
pub use memory::MemoryDevice;
pub use ops::{OpsDevice, OpsTable};

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Where a [`Device::seek`] offset is relative to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// The size of the transfer buffer used by [`copy`].
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Bytes-and-seek surface every stream is built on top of.
pub trait Device: std::fmt::Debug {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Acquire the device's exclusive-access primitive. Non-blocking:
    /// returns `Error::Contention` if already held. Callers must call
    /// [`Device::unlock`] on every exit path.
    fn lock(&self) -> Result<()>;

    /// Release a previously acquired exclusive-access primitive.
    fn unlock(&self);

    /// Read exactly `buf.len()` bytes, looping over short reads.
    fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.read(buf)?;
            if n == 0 {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "device read returned 0 bytes before buffer was filled",
                )));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Write all of `buf`, looping over short writes.
    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "device write accepted 0 bytes",
                )));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Streams the entire valid contents of `src` (from offset 0) into `dst` at
/// its current position, using a ~1 MiB transfer buffer.
pub fn copy(dst: &mut dyn Device, src: &mut dyn Device) -> Result<u64> {
    src.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// A single non-blocking exclusive-access primitive shared by every
/// concrete [`Device`] backend.
#[derive(Debug, Default)]
pub(crate) struct ExclusiveAccess {
    held: AtomicBool,
}

impl ExclusiveAccess {
    pub(crate) fn new() -> Self {
        Self { held: AtomicBool::new(false) }
    }

    pub(crate) fn lock(&self) -> Result<()> {
        match self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Contention),
        }
    }

    pub(crate) fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_access_is_non_blocking() {
        let lock = ExclusiveAccess::new();
        lock.lock().unwrap();
        assert!(matches!(lock.lock(), Err(Error::Contention)));
        lock.unlock();
        lock.lock().unwrap();
        lock.unlock();
    }

    #[test]
    fn copy_streams_full_source_contents() {
        let mut src = MemoryDevice::from_vec(vec![1, 2, 3, 4, 5]);
        let mut dst = MemoryDevice::new();
        let n = copy(&mut dst, &mut src).unwrap();
        assert_eq!(n, 5);
        assert_eq!(dst.into_vec(), vec![1, 2, 3, 4, 5]);
    }
}
