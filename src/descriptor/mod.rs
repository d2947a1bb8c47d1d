//! On-disk descriptor records and the in-memory tree built from them.
//!
//! Every record begins with a 4-byte base (`type`, `length`); `length`
//! covers the whole record including its inline name/target bytes, which
//! are never null-terminated on disk.

pub mod tree;

use crate::error::{Error, Result};
use crate::header::BlockPosition;

const BASE_SIZE: usize = 4;
const FILE_FIXED_SIZE: usize = BASE_SIZE + BlockPosition::SIZE + 4 + 4;
const DIRECTORY_FIXED_SIZE: usize = BASE_SIZE + BlockPosition::SIZE + 4;
const SYMLINK_FIXED_SIZE: usize = BASE_SIZE + 2 + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DescriptorKind {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl DescriptorKind {
    fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(DescriptorKind::File),
            2 => Ok(DescriptorKind::Directory),
            3 => Ok(DescriptorKind::Symlink),
            _ => Err(Error::IntegrityError),
        }
    }
}

/// One on-disk descriptor record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DescriptorRecord {
    File { data_pos: BlockPosition, file_length: u32, permissions: u32, name: String },
    Directory { child_pos: BlockPosition, permissions: u32, name: String },
    Symlink { name: String, target: String },
}

impl DescriptorRecord {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DescriptorRecord::File { .. } => DescriptorKind::File,
            DescriptorRecord::Directory { .. } => DescriptorKind::Directory,
            DescriptorRecord::Symlink { .. } => DescriptorKind::Symlink,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            DescriptorRecord::File { name, .. } => FILE_FIXED_SIZE + name.len(),
            DescriptorRecord::Directory { name, .. } => DIRECTORY_FIXED_SIZE + name.len(),
            DescriptorRecord::Symlink { name, target } => {
                SYMLINK_FIXED_SIZE + name.len() + target.len()
            }
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let len = self.encoded_len();
        debug_assert!(buf.len() >= len);
        buf[0..2].copy_from_slice(&(self.kind() as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&(len as u16).to_le_bytes());
        match self {
            DescriptorRecord::File { data_pos, file_length, permissions, name } => {
                data_pos.encode(&mut buf[4..12]);
                buf[12..16].copy_from_slice(&file_length.to_le_bytes());
                buf[16..20].copy_from_slice(&permissions.to_le_bytes());
                buf[20..20 + name.len()].copy_from_slice(name.as_bytes());
            }
            DescriptorRecord::Directory { child_pos, permissions, name } => {
                child_pos.encode(&mut buf[4..12]);
                buf[12..16].copy_from_slice(&permissions.to_le_bytes());
                buf[16..16 + name.len()].copy_from_slice(name.as_bytes());
            }
            DescriptorRecord::Symlink { name, target } => {
                buf[4..6].copy_from_slice(&(name.len() as u16).to_le_bytes());
                buf[6..8].copy_from_slice(&(target.len() as u16).to_le_bytes());
                buf[8..8 + name.len()].copy_from_slice(name.as_bytes());
                buf[8 + name.len()..8 + name.len() + target.len()].copy_from_slice(target.as_bytes());
            }
        }
    }

    /// Decodes one record starting at `buf[0]`. `buf` must already hold
    /// at least `length` bytes (the caller reads the 4-byte base first
    /// to learn `length`, then reads the rest before calling this).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BASE_SIZE {
            return Err(Error::IntegrityError);
        }
        let kind = DescriptorKind::from_u16(u16::from_le_bytes(buf[0..2].try_into().unwrap()))?;
        let length = u16::from_le_bytes(buf[2..4].try_into().unwrap()) as usize;
        if length > buf.len() {
            return Err(Error::IntegrityError);
        }
        match kind {
            DescriptorKind::File => {
                if length < FILE_FIXED_SIZE {
                    return Err(Error::IntegrityError);
                }
                let data_pos = BlockPosition::decode(&buf[4..12]).ok_or(Error::IntegrityError)?;
                let file_length = u32::from_le_bytes(buf[12..16].try_into().unwrap());
                let permissions = u32::from_le_bytes(buf[16..20].try_into().unwrap());
                let name = String::from_utf8(buf[20..length].to_vec())
                    .map_err(|_| Error::IntegrityError)?;
                Ok(DescriptorRecord::File { data_pos, file_length, permissions, name })
            }
            DescriptorKind::Directory => {
                if length < DIRECTORY_FIXED_SIZE {
                    return Err(Error::IntegrityError);
                }
                let child_pos = BlockPosition::decode(&buf[4..12]).ok_or(Error::IntegrityError)?;
                let permissions = u32::from_le_bytes(buf[12..16].try_into().unwrap());
                let name = String::from_utf8(buf[16..length].to_vec())
                    .map_err(|_| Error::IntegrityError)?;
                Ok(DescriptorRecord::Directory { child_pos, permissions, name })
            }
            DescriptorKind::Symlink => {
                if length < SYMLINK_FIXED_SIZE {
                    return Err(Error::IntegrityError);
                }
                let name_len = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
                let target_len = u16::from_le_bytes(buf[6..8].try_into().unwrap()) as usize;
                if SYMLINK_FIXED_SIZE + name_len + target_len != length {
                    return Err(Error::IntegrityError);
                }
                let name = String::from_utf8(buf[8..8 + name_len].to_vec())
                    .map_err(|_| Error::IntegrityError)?;
                let target = String::from_utf8(buf[8 + name_len..8 + name_len + target_len].to_vec())
                    .map_err(|_| Error::IntegrityError)?;
                Ok(DescriptorRecord::Symlink { name, target })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_record_round_trips() {
        let record = DescriptorRecord::File {
            data_pos: BlockPosition { block_index: 2, byte_offset: 10 },
            file_length: 3,
            permissions: 0o644,
            name: "hello".to_string(),
        };
        let mut buf = vec![0u8; record.encoded_len()];
        record.encode(&mut buf);
        let back = DescriptorRecord::decode(&buf).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn directory_record_round_trips() {
        let record = DescriptorRecord::Directory {
            child_pos: BlockPosition { block_index: 0, byte_offset: 4 },
            permissions: 0o777,
            name: "root".to_string(),
        };
        let mut buf = vec![0u8; record.encoded_len()];
        record.encode(&mut buf);
        let back = DescriptorRecord::decode(&buf).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn symlink_record_round_trips() {
        let record = DescriptorRecord::Symlink { name: "c".to_string(), target: "/a".to_string() };
        let mut buf = vec![0u8; record.encoded_len()];
        record.encode(&mut buf);
        let back = DescriptorRecord::decode(&buf).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&9u16.to_le_bytes());
        buf[2..4].copy_from_slice(&8u16.to_le_bytes());
        assert!(matches!(DescriptorRecord::decode(&buf), Err(Error::IntegrityError)));
    }

    #[test]
    fn decode_rejects_length_shorter_than_base() {
        let record = DescriptorRecord::Directory {
            child_pos: BlockPosition::INVALID,
            permissions: 0,
            name: "x".to_string(),
        };
        let mut buf = vec![0u8; record.encoded_len()];
        record.encode(&mut buf);
        buf[2..4].copy_from_slice(&3u16.to_le_bytes()); // shorter than DIRECTORY_FIXED_SIZE
        assert!(matches!(DescriptorRecord::decode(&buf), Err(Error::IntegrityError)));
    }
}
