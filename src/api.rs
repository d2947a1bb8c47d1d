//! Handle-based public surface: directory/file/symlink handles layered
//! over [`Image`]. This is the entry point most callers use instead of
//! reaching into `descriptor::tree` or the streams directly.

use crate::descriptor::tree::{self, Node, NodeRef};
use crate::engine::{Image, Mode};
use crate::error::{Error, Result};
use crate::feature::FeatureRecord;
use crate::guid::Guid;

/// What kind of entry a directory listing entry or a stat result names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

fn entry_type(node: &NodeRef) -> EntryType {
    match &*node.borrow() {
        Node::File(_) => EntryType::File,
        Node::Directory(_) => EntryType::Directory,
        Node::Symlink(_) => EntryType::Symlink,
    }
}

/// Result of [`Image::path_stat`]. Always describes the entry a path
/// resolves to after following every symlink on the way, including a
/// final one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub entry_type: EntryType,
    pub permissions: u32,
    pub size: u64,
}

pub struct DirectoryHandle {
    node: NodeRef,
    cursor: usize,
}

pub struct FileHandle {
    node: NodeRef,
    position: u64,
    writing: bool,
}

pub struct SymlinkHandle {
    node: NodeRef,
}

impl Image {
    /// Opens the root directory. Valid in either mode.
    pub fn open_root(&mut self) -> Result<DirectoryHandle> {
        Ok(DirectoryHandle { node: self.root(), cursor: 0 })
    }

    /// Opens the directory at `path`, following symlinks.
    pub fn open_directory(&mut self, path: &str) -> Result<DirectoryHandle> {
        let node = self.resolve_path(path)?;
        if !node.borrow().is_directory() {
            return Err(Error::NotADirectory);
        }
        Ok(DirectoryHandle { node, cursor: 0 })
    }

    /// Creates a new subdirectory under `parent`. Write mode only.
    pub fn create_directory(
        &mut self,
        parent: &DirectoryHandle,
        name: &str,
        permissions: u32,
    ) -> Result<DirectoryHandle> {
        if self.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        let node = tree::create_directory(&parent.node, name, permissions)?;
        Ok(DirectoryHandle { node, cursor: 0 })
    }

    /// Opens `name` as a subdirectory of `parent`, without following a
    /// trailing symlink (callers wanting that should go through
    /// [`Image::open_directory`] with a full path instead).
    pub fn open_subdirectory(&mut self, parent: &DirectoryHandle, name: &str) -> Result<DirectoryHandle> {
        let child = self.find_child(parent, name)?;
        if !child.borrow().is_directory() {
            return Err(Error::NotADirectory);
        }
        Ok(DirectoryHandle { node: child, cursor: 0 })
    }

    /// Advances a directory's iteration cursor and returns the next
    /// entry's name and type, or `Error::NotFound` once exhausted.
    pub fn read_entry(&mut self, handle: &mut DirectoryHandle) -> Result<(String, EntryType)> {
        self.ensure_directory_loaded(&handle.node)?;
        let child = {
            let node = handle.node.borrow();
            let dir = match &*node {
                Node::Directory(d) => d,
                _ => return Err(Error::NotADirectory),
            };
            dir.children.get(handle.cursor).cloned()
        }
        .ok_or(Error::NotFound)?;
        handle.cursor += 1;
        let name = child.borrow().name().to_string();
        Ok((name, entry_type(&child)))
    }

    pub fn directory_close(&mut self, _handle: DirectoryHandle) {}

    /// Opens an existing file under `parent` for reading. Read mode only.
    pub fn open_file(&mut self, parent: &DirectoryHandle, name: &str) -> Result<FileHandle> {
        if self.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        let child = self.find_child(parent, name)?;
        if !matches!(&*child.borrow(), Node::File(_)) {
            return Err(Error::IsADirectory);
        }
        Ok(FileHandle { node: child, position: 0, writing: false })
    }

    /// Creates a new file under `parent` and opens it for writing. Write
    /// mode only. Acquires the data stream's exclusive-access lock for
    /// the handle's whole lifetime, so only one file write can be in
    /// flight at a time; the lock releases on [`Image::file_close`].
    pub fn create_file(&mut self, parent: &DirectoryHandle, name: &str, permissions: u32) -> Result<FileHandle> {
        if self.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        self.data_stream.lock()?;
        match tree::create_file(&parent.node, name, permissions) {
            Ok(node) => Ok(FileHandle { node, position: 0, writing: true }),
            Err(e) => {
                self.data_stream.unlock();
                Err(e)
            }
        }
    }

    pub fn file_length(&self, handle: &FileHandle) -> Result<u64> {
        match &*handle.node.borrow() {
            Node::File(f) => Ok(f.file_length as u64),
            _ => Err(Error::IsADirectory),
        }
    }

    pub fn file_permissions(&self, handle: &FileHandle) -> Result<u32> {
        match &*handle.node.borrow() {
            Node::File(f) => Ok(f.permissions),
            _ => Err(Error::IsADirectory),
        }
    }

    /// Repositions a read handle's logical cursor. Not valid while
    /// writing: a write handle always appends.
    pub fn file_seek(&mut self, handle: &mut FileHandle, position: u64) -> Result<()> {
        if handle.writing {
            return Err(Error::Unsupported("write handles are append-only"));
        }
        handle.position = position;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at the handle's current
    /// position, clipped to the file's length. Holds the data stream's
    /// lock only for the duration of this call.
    pub fn file_read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if self.mode() != Mode::Read {
            return Err(Error::PermissionDenied);
        }
        let (data_pos, file_length) = match &*handle.node.borrow() {
            Node::File(f) => (f.data_pos, f.file_length as u64),
            _ => return Err(Error::IsADirectory),
        };
        if handle.position >= file_length {
            return Ok(0);
        }
        let remaining = (file_length - handle.position) as usize;
        let want = buf.len().min(remaining);
        if want == 0 {
            return Ok(0);
        }

        self.data_stream.lock()?;
        let outcome = (|| {
            let block_size = self.data_stream.block_size() as u64;
            let absolute = data_pos.byte_offset as u64 + handle.position;
            let block_index = data_pos.block_index + (absolute / block_size) as u32;
            let byte_offset = (absolute % block_size) as u32;
            self.data_stream.seek(block_index, byte_offset)?;
            self.data_stream.read(&mut buf[..want])
        })();
        self.data_stream.unlock();

        let n = outcome?;
        handle.position += n as u64;
        Ok(n)
    }

    /// Appends `buf` to the file's data, extending `file_length`. The
    /// file's starting position in the data stream is captured on the
    /// first call.
    pub fn file_write(&mut self, handle: &mut FileHandle, buf: &[u8]) -> Result<usize> {
        if self.mode() != Mode::Write || !handle.writing {
            return Err(Error::PermissionDenied);
        }
        let needs_start = matches!(&*handle.node.borrow(), Node::File(f) if f.data_pos == crate::header::BlockPosition::INVALID);
        if needs_start {
            let pos = self.data_stream.position();
            if let Node::File(f) = &mut *handle.node.borrow_mut() {
                f.data_pos = pos;
            }
        }
        let written = self.data_stream.write(buf)?;
        if let Node::File(f) = &mut *handle.node.borrow_mut() {
            f.file_length += written as u32;
        }
        handle.position += written as u64;
        Ok(written)
    }

    pub fn file_close(&mut self, handle: FileHandle) {
        if handle.writing {
            self.data_stream.unlock();
        }
    }

    /// Creates a symlink under `parent` whose target is stored verbatim
    /// (not canonicalized or validated against the tree). Write mode
    /// only.
    pub fn create_symlink(&mut self, parent: &DirectoryHandle, name: &str, target: &str) -> Result<SymlinkHandle> {
        if self.mode() != Mode::Write {
            return Err(Error::PermissionDenied);
        }
        let node = tree::create_symlink(&parent.node, name, target)?;
        Ok(SymlinkHandle { node })
    }

    /// Opens `name` under `parent` as a symlink, without following it.
    pub fn read_symlink(&mut self, parent: &DirectoryHandle, name: &str) -> Result<SymlinkHandle> {
        let child = self.find_child(parent, name)?;
        if !child.borrow().is_symlink() {
            return Err(Error::InvalidArgument("entry is not a symlink"));
        }
        Ok(SymlinkHandle { node: child })
    }

    pub fn symlink_target(&self, handle: &SymlinkHandle) -> String {
        match &*handle.node.borrow() {
            Node::Symlink(s) => s.target.clone(),
            _ => unreachable!("SymlinkHandle never wraps a non-symlink node"),
        }
    }

    pub fn symlink_close(&mut self, _handle: SymlinkHandle) {}

    /// Resolves `path`, following every symlink on the way including a
    /// final one, and reports the resulting entry's type, permissions,
    /// and size (byte length for a file, child count for a directory,
    /// target length for a symlink, though a symlink never survives
    /// resolution here).
    pub fn path_stat(&mut self, path: &str) -> Result<Stat> {
        let node = self.resolve_path(path)?;
        let stat = match &*node.borrow() {
            Node::File(f) => Stat { entry_type: EntryType::File, permissions: f.permissions, size: f.file_length as u64 },
            Node::Directory(d) => {
                Stat { entry_type: EntryType::Directory, permissions: d.permissions, size: d.children.len() as u64 }
            }
            Node::Symlink(_) => unreachable!("resolve_path always follows a final symlink"),
        };
        Ok(stat)
    }

    pub fn feature_add_record(&mut self, guid: Guid, data: Vec<u8>) -> Result<()> {
        self.feature_add(FeatureRecord::new(guid, data))
    }

    fn resolve_path(&mut self, path: &str) -> Result<NodeRef> {
        let root = self.root();
        match self.mode() {
            Mode::Read => tree::resolve(&root, path, Some(&mut self.descriptor_stream)),
            Mode::Write => tree::resolve(&root, path, None),
        }
    }

    fn find_child(&mut self, parent: &DirectoryHandle, name: &str) -> Result<NodeRef> {
        self.ensure_directory_loaded(&parent.node)?;
        let node = parent.node.borrow();
        let dir = match &*node {
            Node::Directory(d) => d,
            _ => return Err(Error::NotADirectory),
        };
        dir.children.iter().find(|c| c.borrow().name() == name).cloned().ok_or(Error::NotFound)
    }

    fn ensure_directory_loaded(&mut self, node: &NodeRef) -> Result<()> {
        match self.mode() {
            Mode::Read => tree::ensure_loaded(node, &mut self.descriptor_stream),
            Mode::Write => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;
    use crate::device::MemoryDevice;
    use crate::header::Architecture;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn shared() -> crate::stream::SharedDevice {
        Rc::new(RefCell::new(MemoryDevice::new()))
    }

    #[test]
    fn write_then_read_small_file() {
        let device = shared();
        {
            let mut image = Image::create(device.clone(), ImageConfig::new(Architecture::X64)).unwrap();
            let root = image.open_root().unwrap();
            let mut file = image.create_file(&root, "hello.txt", 0o644).unwrap();
            image.file_write(&mut file, b"hello world").unwrap();
            image.file_close(file);
            image.directory_close(root);
            image.close().unwrap();
        }

        let mut image = Image::open(device).unwrap();
        let root = image.open_root().unwrap();
        let mut file = image.open_file(&root, "hello.txt").unwrap();
        assert_eq!(image.file_length(&file).unwrap(), 11);
        let mut buf = [0u8; 11];
        let n = image.file_read(&mut file, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
        image.file_close(file);
    }

    #[test]
    fn nested_directories_and_listing() {
        let device = shared();
        {
            let mut image = Image::create(device.clone(), ImageConfig::new(Architecture::X64)).unwrap();
            let root = image.open_root().unwrap();
            let sub = image.create_directory(&root, "bin", 0o755).unwrap();
            image.create_file(&sub, "sh", 0o755).unwrap();
            image.close().unwrap();
        }

        let mut image = Image::open(device).unwrap();
        let root = image.open_root().unwrap();
        let mut bin = image.open_subdirectory(&root, "bin").unwrap();
        let (name, kind) = image.read_entry(&mut bin).unwrap();
        assert_eq!(name, "sh");
        assert_eq!(kind, EntryType::File);
        assert!(matches!(image.read_entry(&mut bin), Err(Error::NotFound)));
    }

    #[test]
    fn symlink_resolves_through_path_stat() {
        let device = shared();
        {
            let mut image = Image::create(device.clone(), ImageConfig::new(Architecture::X64)).unwrap();
            let root = image.open_root().unwrap();
            let a = image.create_directory(&root, "a", 0o755).unwrap();
            let mut file = image.create_file(&a, "b", 0o644).unwrap();
            image.file_write(&mut file, b"xyz").unwrap();
            image.file_close(file);
            image.create_symlink(&root, "c", "/a").unwrap();
            image.close().unwrap();
        }

        let mut image = Image::open(device).unwrap();
        let stat = image.path_stat("/c/b").unwrap();
        assert_eq!(stat.entry_type, EntryType::File);
        assert_eq!(stat.size, 3);
    }

    #[test]
    fn second_concurrent_write_handle_is_rejected() {
        let device = shared();
        let mut image = Image::create(device, ImageConfig::new(Architecture::X64)).unwrap();
        let root = image.open_root().unwrap();
        let _first = image.create_file(&root, "a", 0o644).unwrap();
        assert!(matches!(image.create_file(&root, "b", 0o644), Err(Error::Contention)));
    }

    #[test]
    fn file_spanning_multiple_blocks_round_trips() {
        let device = shared();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        {
            let mut image = Image::create(device.clone(), ImageConfig::new(Architecture::X64).with_data_block_size(8 * 1024))
                .unwrap();
            let root = image.open_root().unwrap();
            let mut file = image.create_file(&root, "big", 0o644).unwrap();
            image.file_write(&mut file, &payload).unwrap();
            image.file_close(file);
            image.close().unwrap();
        }

        let mut image = Image::open(device).unwrap();
        let root = image.open_root().unwrap();
        let mut file = image.open_file(&root, "big").unwrap();
        let mut buf = vec![0u8; payload.len()];
        let mut total = 0;
        while total < buf.len() {
            let n = image.file_read(&mut file, &mut buf[total..]).unwrap();
            assert!(n > 0);
            total += n;
        }
        assert_eq!(buf, payload);
    }
}
