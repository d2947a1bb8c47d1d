//! In-memory descriptor tree: directories, files, and symlinks, plus
//! path parsing, symlink resolution, and lazy loading of a directory's
//! children from the descriptor stream.

use super::DescriptorRecord;
use crate::error::{Error, Result};
use crate::header::BlockPosition;
use crate::stream::BlockStream;
use std::cell::RefCell;
use std::rc::Rc;

/// Path tokens are capped at 128 bytes when a new name is being
/// created, 255 bytes when a path is only being parsed for lookup.
pub const WRITER_NAME_CAP: usize = 128;
pub const READER_NAME_CAP: usize = 255;

/// Recursion guard for symlink resolution; the format has no built-in
/// cycle detection, so this crate bounds it explicitly.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// Upper bound on the total length of the token list accumulated while
/// chasing a chain of symlinks.
pub const MAX_RESOLUTION_BUFFER: usize = 4096;

pub type NodeRef = Rc<RefCell<Node>>;

pub struct FileNode {
    pub name: String,
    pub permissions: u32,
    pub data_pos: BlockPosition,
    pub file_length: u32,
}

pub struct DirectoryNode {
    pub name: String,
    pub permissions: u32,
    pub children: Vec<NodeRef>,
    pub loaded: bool,
    pub child_pos: BlockPosition,
}

pub struct SymlinkNode {
    pub name: String,
    pub target: String,
}

pub enum Node {
    File(FileNode),
    Directory(DirectoryNode),
    Symlink(SymlinkNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::File(f) => &f.name,
            Node::Directory(d) => &d.name,
            Node::Symlink(s) => &s.name,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Node::Symlink(_))
    }
}

/// Splits a path on `/`, stripping a leading separator and collapsing
/// repeated ones; `""` and `"/"` both tokenize to an empty list (root).
pub fn split_path(path: &str, cap: usize) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    for tok in path.split('/') {
        if tok.is_empty() {
            continue;
        }
        if tok.len() > cap {
            return Err(Error::NameTooLong);
        }
        tokens.push(tok.to_string());
    }
    Ok(tokens)
}

fn canonicalize(tokens: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tok in tokens {
        match tok.as_str() {
            "." => {}
            ".." => {
                out.pop();
            }
            _ => out.push(tok),
        }
    }
    out
}

pub fn create_root() -> NodeRef {
    Rc::new(RefCell::new(Node::Directory(DirectoryNode {
        name: "root".to_string(),
        permissions: 0o777,
        children: Vec::new(),
        loaded: true,
        child_pos: BlockPosition::INVALID,
    })))
}

/// Materializes a directory's children from the descriptor stream on
/// first access; a no-op if already loaded (or in write mode, where
/// directories are always `loaded`).
pub fn ensure_loaded(node: &NodeRef, stream: &mut BlockStream) -> Result<()> {
    let (already_loaded, child_pos) = {
        let n = node.borrow();
        match &*n {
            Node::Directory(dir) => (dir.loaded, dir.child_pos),
            _ => return Err(Error::NotADirectory),
        }
    };
    if already_loaded {
        return Ok(());
    }

    stream.lock()?;
    let loaded = load_children(child_pos, stream);
    stream.unlock();
    let children = loaded?;

    if let Node::Directory(dir) = &mut *node.borrow_mut() {
        dir.children = children;
        dir.loaded = true;
    }
    Ok(())
}

fn load_children(pos: BlockPosition, stream: &mut BlockStream) -> Result<Vec<NodeRef>> {
    stream.seek(pos.block_index, pos.byte_offset)?;
    let mut count_buf = [0u8; 4];
    stream.read_exact(&mut count_buf)?;
    let count = u32::from_le_bytes(count_buf);

    let mut children = Vec::with_capacity(count as usize);
    for _ in 0..count {
        children.push(record_to_node(read_record(stream)?));
    }
    Ok(children)
}

fn read_record(stream: &mut BlockStream) -> Result<DescriptorRecord> {
    let mut base = [0u8; 4];
    stream.read_exact(&mut base)?;
    let length = u16::from_le_bytes(base[2..4].try_into().unwrap()) as usize;
    if length < base.len() {
        return Err(Error::IntegrityError);
    }
    let mut buf = vec![0u8; length];
    buf[..4].copy_from_slice(&base);
    stream.read_exact(&mut buf[4..])?;
    DescriptorRecord::decode(&buf)
}

fn record_to_node(record: DescriptorRecord) -> NodeRef {
    let node = match record {
        DescriptorRecord::File { data_pos, file_length, permissions, name } => {
            Node::File(FileNode { name, permissions, data_pos, file_length })
        }
        DescriptorRecord::Directory { child_pos, permissions, name } => {
            Node::Directory(DirectoryNode {
                name,
                permissions,
                children: Vec::new(),
                loaded: false,
                child_pos,
            })
        }
        DescriptorRecord::Symlink { name, target } => Node::Symlink(SymlinkNode { name, target }),
    };
    Rc::new(RefCell::new(node))
}

fn to_descriptor_record(node: &NodeRef) -> DescriptorRecord {
    match &*node.borrow() {
        Node::File(f) => DescriptorRecord::File {
            data_pos: f.data_pos,
            file_length: f.file_length,
            permissions: f.permissions,
            name: f.name.clone(),
        },
        Node::Directory(d) => DescriptorRecord::Directory {
            child_pos: d.child_pos,
            permissions: d.permissions,
            name: d.name.clone(),
        },
        Node::Symlink(s) => DescriptorRecord::Symlink { name: s.name.clone(), target: s.target.clone() },
    }
}

/// Resolves `path` starting from `root`. `stream` is `Some` in read
/// mode (needed to lazily load directory listings) and `None` in write
/// mode, where the whole tree already lives in memory. Follows
/// symlinks encountered at every path component, including the final
/// one.
pub fn resolve(root: &NodeRef, path: &str, stream: Option<&mut BlockStream>) -> Result<NodeRef> {
    resolve_inner(root, path, stream, true)
}

/// Like [`resolve`] but does not follow a symlink that is the final
/// path component; used by the symlink-handle API, which wants the
/// symlink itself.
pub fn resolve_no_final_follow(
    root: &NodeRef,
    path: &str,
    stream: Option<&mut BlockStream>,
) -> Result<NodeRef> {
    resolve_inner(root, path, stream, false)
}

fn resolve_inner(
    root: &NodeRef,
    path: &str,
    mut stream: Option<&mut BlockStream>,
    follow_final: bool,
) -> Result<NodeRef> {
    let mut tokens = split_path(path, READER_NAME_CAP)?;
    let mut depth = 0usize;

    'restart: loop {
        let mut current = root.clone();
        let mut consumed: Vec<String> = Vec::new();
        let mut idx = 0usize;

        while idx < tokens.len() {
            let tok = tokens[idx].clone();
            let is_last = idx == tokens.len() - 1;

            if !current.borrow().is_directory() {
                return Err(Error::NotADirectory);
            }
            if let Some(s) = stream.as_deref_mut() {
                ensure_loaded(&current, s)?;
            }

            let child = {
                let node = current.borrow();
                let dir = match &*node {
                    Node::Directory(d) => d,
                    _ => unreachable!(),
                };
                dir.children.iter().find(|c| c.borrow().name() == tok).cloned()
            }
            .ok_or(Error::NotFound)?;

            if child.borrow().is_symlink() && (!is_last || follow_final) {
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH {
                    return Err(Error::TooManyLinks);
                }
                let target = match &*child.borrow() {
                    Node::Symlink(s) => s.target.clone(),
                    _ => unreachable!(),
                };
                let mut new_tokens = if let Some(rest) = target.strip_prefix('/') {
                    split_path(rest, READER_NAME_CAP)?
                } else {
                    let mut combo = consumed.clone();
                    combo.extend(split_path(&target, READER_NAME_CAP)?);
                    combo
                };
                new_tokens = canonicalize(new_tokens);
                new_tokens.extend_from_slice(&tokens[idx + 1..]);

                let total_len: usize = new_tokens.iter().map(|t| t.len() + 1).sum();
                if total_len > MAX_RESOLUTION_BUFFER {
                    return Err(Error::InvalidArgument("symlink resolution buffer exceeded"));
                }
                tokens = new_tokens;
                continue 'restart;
            }

            consumed.push(tok);
            current = child;
            idx += 1;
        }

        return Ok(current);
    }
}

/// Resolves all but the last component of `path` (following symlinks
/// along the way) and returns the parent directory plus the final
/// token, for use by the write-mode `create_*` operations.
pub fn resolve_parent(root: &NodeRef, path: &str) -> Result<(NodeRef, String)> {
    let mut tokens = split_path(path, WRITER_NAME_CAP)?;
    let last = tokens.pop().ok_or(Error::InvalidArgument("path has no final component"))?;

    let mut current = root.clone();
    for tok in tokens {
        let child = {
            let node = current.borrow();
            let dir = match &*node {
                Node::Directory(d) => d,
                _ => return Err(Error::NotADirectory),
            };
            dir.children.iter().find(|c| c.borrow().name() == tok).cloned()
        }
        .ok_or(Error::NotFound)?;
        current = child;
    }
    if !current.borrow().is_directory() {
        return Err(Error::NotADirectory);
    }
    Ok((current, last))
}

fn insert_child(parent: &NodeRef, name: &str, node: Node) -> Result<NodeRef> {
    let mut p = parent.borrow_mut();
    let dir = match &mut *p {
        Node::Directory(d) => d,
        _ => return Err(Error::NotADirectory),
    };
    if dir.children.iter().any(|c| c.borrow().name() == name) {
        return Err(Error::AlreadyExists);
    }
    let node_ref = Rc::new(RefCell::new(node));
    // New children go to the head of the list: iteration order is
    // therefore reverse-of-insertion, which is fine as long as it's
    // consistent between build and a subsequent read-back.
    dir.children.insert(0, node_ref.clone());
    Ok(node_ref)
}

pub fn create_directory(parent: &NodeRef, name: &str, permissions: u32) -> Result<NodeRef> {
    if name.len() > WRITER_NAME_CAP {
        return Err(Error::NameTooLong);
    }
    insert_child(
        parent,
        name,
        Node::Directory(DirectoryNode {
            name: name.to_string(),
            permissions,
            children: Vec::new(),
            loaded: true,
            child_pos: BlockPosition::INVALID,
        }),
    )
}

pub fn create_file(parent: &NodeRef, name: &str, permissions: u32) -> Result<NodeRef> {
    if name.len() > WRITER_NAME_CAP {
        return Err(Error::NameTooLong);
    }
    insert_child(
        parent,
        name,
        Node::File(FileNode {
            name: name.to_string(),
            permissions,
            data_pos: BlockPosition::INVALID,
            file_length: 0,
        }),
    )
}

pub fn create_symlink(parent: &NodeRef, name: &str, target: &str) -> Result<NodeRef> {
    if name.len() > WRITER_NAME_CAP {
        return Err(Error::NameTooLong);
    }
    insert_child(parent, name, Node::Symlink(SymlinkNode { name: name.to_string(), target: target.to_string() }))
}

/// Serializes a directory's subtree in post-order: every subdirectory
/// is written before its parent's listing, so the parent already knows
/// each subdirectory's child-listing position when it writes that
/// child's descriptor. Returns the position of this directory's own
/// listing.
pub fn serialize_directory(node: &NodeRef, stream: &mut BlockStream) -> Result<BlockPosition> {
    let children: Vec<NodeRef> = {
        let n = node.borrow();
        match &*n {
            Node::Directory(dir) => dir.children.clone(),
            _ => return Err(Error::NotADirectory),
        }
    };

    for child in &children {
        let is_dir = child.borrow().is_directory();
        if is_dir {
            let pos = serialize_directory(child, stream)?;
            if let Node::Directory(d) = &mut *child.borrow_mut() {
                d.child_pos = pos;
            }
        }
    }

    let listing_pos = stream.position();
    stream.write(&(children.len() as u32).to_le_bytes())?;
    for child in &children {
        let record = to_descriptor_record(child);
        let mut buf = vec![0u8; record.encoded_len()];
        record.encode(&mut buf);
        stream.write(&buf)?;
    }
    Ok(listing_pos)
}
