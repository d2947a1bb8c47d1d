//! Ops device: a caller-supplied set of operation closures, for hosts
//! that want to plug in their own storage backend without adopting the
//! `Device` trait directly.

use super::{Device, ExclusiveAccess, SeekFrom};
use crate::error::{Error, Result};

/// Caller-supplied device operations. `seek` and `read` are always
/// required; `write` is required only if the device is opened for a
/// writable image; `close` is optional and runs once, when the device is
/// dropped.
pub struct OpsTable {
    pub seek: Box<dyn FnMut(SeekFrom) -> Result<u64>>,
    pub read: Box<dyn FnMut(&mut [u8]) -> Result<usize>>,
    pub write: Option<Box<dyn FnMut(&[u8]) -> Result<usize>>>,
    pub close: Option<Box<dyn FnMut()>>,
}

pub struct OpsDevice {
    ops: OpsTable,
    lock: ExclusiveAccess,
}

impl OpsDevice {
    /// Construct an ops-backed device. Rejected at construction if
    /// `writable` is true but `ops.write` is absent.
    pub fn new(ops: OpsTable, writable: bool) -> Result<Self> {
        if writable && ops.write.is_none() {
            return Err(Error::Unsupported("ops backend has no write operation"));
        }
        Ok(Self { ops, lock: ExclusiveAccess::new() })
    }
}

impl Drop for OpsDevice {
    fn drop(&mut self) {
        if let Some(close) = self.ops.close.as_mut() {
            close();
        }
    }
}

impl std::fmt::Debug for OpsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsDevice")
            .field("writable", &self.ops.write.is_some())
            .finish()
    }
}

impl Device for OpsDevice {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (self.ops.seek)(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (self.ops.read)(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.ops.write.as_mut() {
            Some(write) => write(buf),
            None => Err(Error::Unsupported("ops backend has no write operation")),
        }
    }

    fn lock(&self) -> Result<()> {
        self.lock.lock()
    }

    fn unlock(&self) {
        self.lock.unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn rejects_write_required_but_missing() {
        let ops = OpsTable {
            seek: Box::new(|_| Ok(0)),
            read: Box::new(|_| Ok(0)),
            write: None,
            close: None,
        };
        assert!(matches!(
            OpsDevice::new(ops, true),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn read_only_backend_is_fine_for_read_mode() {
        let ops = OpsTable {
            seek: Box::new(|_| Ok(0)),
            read: Box::new(|_| Ok(0)),
            write: None,
            close: None,
        };
        assert!(OpsDevice::new(ops, false).is_ok());
    }

    #[test]
    fn delegates_to_backing_vec() {
        let backing = Rc::new(RefCell::new(vec![1u8, 2, 3, 4]));
        let pos = Rc::new(RefCell::new(0usize));

        let b1 = backing.clone();
        let p1 = pos.clone();
        let seek = Box::new(move |s: SeekFrom| -> Result<u64> {
            let new_pos = match s {
                SeekFrom::Start(n) => n as usize,
                SeekFrom::Current(n) => (*p1.borrow() as i64 + n) as usize,
                SeekFrom::End(n) => (b1.borrow().len() as i64 + n) as usize,
            };
            *p1.borrow_mut() = new_pos;
            Ok(new_pos as u64)
        });

        let b2 = backing.clone();
        let p2 = pos.clone();
        let read = Box::new(move |buf: &mut [u8]| -> Result<usize> {
            let data = b2.borrow();
            let start = *p2.borrow();
            let n = (data.len() - start).min(buf.len());
            buf[..n].copy_from_slice(&data[start..start + n]);
            *p2.borrow_mut() += n;
            Ok(n)
        });

        let ops = OpsTable { seek, read, write: None, close: None };
        let mut dev = OpsDevice::new(ops, false).unwrap();
        dev.seek(SeekFrom::Start(1)).unwrap();
        let mut buf = [0u8; 2];
        dev.read(&mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn close_runs_on_drop() {
        let closed = Rc::new(RefCell::new(false));
        let c = closed.clone();
        let ops = OpsTable {
            seek: Box::new(|_| Ok(0)),
            read: Box::new(|_| Ok(0)),
            write: None,
            close: Some(Box::new(move || *c.borrow_mut() = true)),
        };
        {
            let _dev = OpsDevice::new(ops, false).unwrap();
        }
        assert!(*closed.borrow());
    }
}
