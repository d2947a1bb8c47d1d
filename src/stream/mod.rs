//! Block stream: a block-structured region of a device with a pluggable
//! codec, per-block CRC, and a hot-block cache.
//!
//! Layout within the stream's region: `[stream header][block 0
//! bytes]...[block-index table]`. The table's location is recorded in
//! the stream header and is only known once every block has been
//! flushed, so it's written last and the header is patched in place;
//! the one in-place rewrite this crate ever performs.

mod cache;

pub use cache::BlockCache;

use crate::crc::crc32;
use crate::device::{Device, SeekFrom};
use crate::error::{Error, Result};
use crate::header::BlockPosition;
use std::cell::RefCell;
use std::rc::Rc;

/// A device shared by more than one stream (the descriptor and data
/// streams read from the same file in read mode) or handed off whole
/// between build phases (temporary devices during a write). `Rc<RefCell<_>>`
/// is enough because the engine never runs more than one thread.
pub type SharedDevice = Rc<RefCell<dyn Device>>;

pub const STREAM_MAGIC: u32 = 0x314D_5356; // "VSM1"

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BlockFlags: u16 {
        const NONE = 0;
    }
}

#[derive(Clone, Debug)]
pub struct StreamHeader {
    pub magic: u32,
    pub block_size: u32,
    pub block_headers_offset: u32,
    pub block_headers_count: u32,
}

impl StreamHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_headers_offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_headers_count.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::IntegrityError);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != STREAM_MAGIC {
            return Err(Error::IntegrityError);
        }
        Ok(Self {
            magic,
            block_size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            block_headers_offset: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            block_headers_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BlockHeader {
    pub length_on_disk: u32,
    pub offset: u32,
    pub crc: u32,
    pub flags: BlockFlags,
}

impl BlockHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.length_on_disk.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.crc.to_le_bytes());
        buf[12..14].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[14..16].copy_from_slice(&0u16.to_le_bytes()); // reserved
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::IntegrityError);
        }
        let flags_bits = u16::from_le_bytes(buf[12..14].try_into().unwrap());
        Ok(Self {
            length_on_disk: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            offset: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: BlockFlags::from_bits_truncate(flags_bits),
        })
    }
}

const _: () = assert!(StreamHeader::SIZE == 16);
const _: () = assert!(BlockHeader::SIZE == 16);

/// A paired encode/decode function installed on a stream. Absent means
/// blocks are stored uncompressed.
///
/// Backed by `Rc<RefCell<_>>` rather than a plain `Box` so a single
/// `Codec` built from a Filter-Ops feature can be cloned onto both the
/// descriptor and the data stream.
#[derive(Clone)]
pub struct Codec {
    encode: Rc<RefCell<dyn FnMut(&[u8]) -> Result<Vec<u8>>>>,
    decode: Rc<RefCell<dyn FnMut(&[u8], usize) -> Result<Vec<u8>>>>,
}

impl Codec {
    pub fn new(
        encode: impl FnMut(&[u8]) -> Result<Vec<u8>> + 'static,
        decode: impl FnMut(&[u8], usize) -> Result<Vec<u8>> + 'static,
    ) -> Self {
        Self { encode: Rc::new(RefCell::new(encode)), decode: Rc::new(RefCell::new(decode)) }
    }
}

pub struct BlockStream {
    device: SharedDevice,
    device_offset: u64,
    block_size: u32,
    writable: bool,
    staging: Vec<u8>,
    used_bytes: usize,
    staging_loaded: bool,
    block_index: u32,
    intra_offset: u32,
    block_headers: Vec<BlockHeader>,
    codec: Option<Codec>,
    cache: BlockCache,
    write_cursor: u64,
    finished: bool,
}

impl BlockStream {
    /// Opens a fresh stream for writing at `device_offset`, writing a
    /// placeholder stream header immediately so the write cursor for
    /// the first block is known.
    pub fn create(device: SharedDevice, device_offset: u64, block_size: u32) -> Result<Self> {
        let header = StreamHeader {
            magic: STREAM_MAGIC,
            block_size,
            block_headers_offset: 0,
            block_headers_count: 0,
        };
        {
            let mut dev = device.borrow_mut();
            dev.seek(SeekFrom::Start(device_offset))?;
            let mut buf = [0u8; StreamHeader::SIZE];
            header.encode(&mut buf);
            dev.write_all(&buf)?;
        }
        Ok(Self {
            device,
            device_offset,
            block_size,
            writable: true,
            staging: vec![0u8; block_size as usize],
            used_bytes: 0,
            staging_loaded: true,
            block_index: 0,
            intra_offset: 0,
            block_headers: Vec::with_capacity(8),
            codec: None,
            cache: BlockCache::new(cache::DEFAULT_CAPACITY),
            write_cursor: device_offset + StreamHeader::SIZE as u64,
            finished: false,
        })
    }

    /// Opens an existing stream for reading: parses the stream header
    /// and the whole block-index table up front.
    pub fn open(device: SharedDevice, device_offset: u64) -> Result<Self> {
        let header = {
            let mut dev = device.borrow_mut();
            dev.seek(SeekFrom::Start(device_offset))?;
            let mut buf = [0u8; StreamHeader::SIZE];
            dev.read_exact(&mut buf)?;
            StreamHeader::decode(&buf)?
        };
        let mut block_headers = Vec::with_capacity(header.block_headers_count as usize);
        {
            let mut dev = device.borrow_mut();
            dev.seek(SeekFrom::Start(
                device_offset + header.block_headers_offset as u64,
            ))?;
            let mut buf = [0u8; BlockHeader::SIZE];
            for _ in 0..header.block_headers_count {
                dev.read_exact(&mut buf)?;
                block_headers.push(BlockHeader::decode(&buf)?);
            }
        }
        Ok(Self {
            device,
            device_offset,
            block_size: header.block_size,
            writable: false,
            staging: vec![0u8; header.block_size as usize],
            used_bytes: 0,
            staging_loaded: false,
            block_index: 0,
            intra_offset: 0,
            block_headers,
            codec: None,
            cache: BlockCache::new(cache::DEFAULT_CAPACITY),
            write_cursor: 0,
            finished: false,
        })
    }

    pub fn set_codec(&mut self, codec: Codec) {
        self.codec = Some(codec);
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_headers.len()
    }

    /// Number of blocks currently held in the hot-block cache.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Whether `index` is currently cached.
    pub fn cache_contains(&self, index: u32) -> bool {
        self.cache.contains(index)
    }

    /// Total length in bytes of this stream's region, valid once
    /// `finish()` has run (write mode) or immediately (read mode, where
    /// it's derived from the parsed block-index table).
    pub fn total_len(&self) -> u64 {
        if self.writable {
            self.write_cursor - self.device_offset
        } else {
            self.block_headers
                .iter()
                .map(|h| h.offset as u64 + h.length_on_disk as u64)
                .max()
                .map(|data_end| data_end.max(StreamHeader::SIZE as u64))
                .unwrap_or(StreamHeader::SIZE as u64)
        }
    }

    /// The device this stream reads from and writes to.
    pub fn device(&self) -> SharedDevice {
        self.device.clone()
    }

    /// The stream's current position. In write mode this is where the
    /// next byte written will land; in read mode it's the cursor left
    /// by the last `read`/`seek`.
    pub fn position(&self) -> BlockPosition {
        if self.writable {
            BlockPosition { block_index: self.block_index, byte_offset: self.used_bytes as u32 }
        } else {
            BlockPosition { block_index: self.block_index, byte_offset: self.intra_offset }
        }
    }

    /// Seeks to a block position. `byte_offset` may exceed `block_size`;
    /// the stream walks `block_index` forward until the residual offset
    /// falls within a single block.
    pub fn seek(&mut self, mut block_index: u32, mut byte_offset: u32) -> Result<()> {
        while byte_offset >= self.block_size {
            byte_offset -= self.block_size;
            block_index += 1;
        }
        if self.writable {
            if block_index != self.block_index {
                return Err(Error::Unsupported("write-mode stream is append-only"));
            }
        } else if block_index != self.block_index || !self.staging_loaded {
            self.load_block(block_index)?;
        }
        self.intra_offset = byte_offset;
        Ok(())
    }

    fn load_block(&mut self, index: u32) -> Result<()> {
        if let Some(cached) = self.cache.get(index) {
            let n = cached.len();
            self.staging[..n].copy_from_slice(&cached);
            self.used_bytes = n;
            self.block_index = index;
            self.staging_loaded = true;
            return Ok(());
        }

        let entry = *self
            .block_headers
            .get(index as usize)
            .ok_or(Error::NotFound)?;
        let mut scratch = vec![0u8; entry.length_on_disk as usize];
        {
            let mut dev = self.device.borrow_mut();
            dev.seek(SeekFrom::Start(self.device_offset + entry.offset as u64))?;
            dev.read_exact(&mut scratch)?;
        }

        let decoded_len = if let Some(codec) = self.codec.as_ref() {
            let decoded = (codec.decode.borrow_mut())(&scratch, self.block_size as usize)?;
            let n = decoded.len().min(self.staging.len());
            self.staging[..n].copy_from_slice(&decoded[..n]);
            n
        } else {
            let n = scratch.len();
            self.staging[..n].copy_from_slice(&scratch);
            n
        };

        if crc32(&self.staging[..decoded_len]) != entry.crc {
            return Err(Error::IntegrityError);
        }

        self.used_bytes = decoded_len;
        self.block_index = index;
        self.staging_loaded = true;
        self.cache.set(index, self.staging[..decoded_len].to_vec())?;
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.writable {
            return Err(Error::PermissionDenied);
        }
        if !self.staging_loaded {
            self.load_block(self.block_index)?;
        }
        let mut written = 0;
        while written < buf.len() {
            if self.intra_offset as usize >= self.used_bytes {
                let next = self.block_index + 1;
                if next as usize >= self.block_headers.len() {
                    break;
                }
                self.load_block(next)?;
                self.intra_offset = 0;
            }
            let available = self.used_bytes - self.intra_offset as usize;
            let want = (buf.len() - written).min(available);
            let start = self.intra_offset as usize;
            buf[written..written + want].copy_from_slice(&self.staging[start..start + want]);
            self.intra_offset += want as u32;
            written += want;
        }
        Ok(written)
    }

    /// Reads exactly `buf.len()` bytes, looping over short reads until
    /// the buffer is filled or the stream is exhausted.
    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.read(buf)?;
            if n == 0 {
                return Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "block stream exhausted before buffer was filled",
                )));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::PermissionDenied);
        }
        let mut written = 0;
        while written < buf.len() {
            if self.used_bytes == self.block_size as usize {
                self.flush()?;
            }
            let available = self.block_size as usize - self.used_bytes;
            let want = (buf.len() - written).min(available);
            let start = self.used_bytes;
            self.staging[start..start + want].copy_from_slice(&buf[written..written + want]);
            self.used_bytes += want;
            written += want;
        }
        Ok(written)
    }

    /// Flushes the in-progress block, if any, to the device.
    pub fn flush(&mut self) -> Result<()> {
        if self.used_bytes == 0 {
            return Ok(());
        }
        let uncompressed = &self.staging[..self.used_bytes];
        let crc = crc32(uncompressed);
        let encoded: Vec<u8> = match self.codec.as_ref() {
            Some(codec) => (codec.encode.borrow_mut())(uncompressed)?,
            None => uncompressed.to_vec(),
        };

        let relative_offset = (self.write_cursor - self.device_offset) as u32;
        {
            let mut dev = self.device.borrow_mut();
            dev.seek(SeekFrom::Start(self.write_cursor))?;
            dev.write_all(&encoded)?;
        }
        self.write_cursor += encoded.len() as u64;

        self.block_headers.push(BlockHeader {
            length_on_disk: encoded.len() as u32,
            offset: relative_offset,
            crc,
            flags: BlockFlags::empty(),
        });
        self.block_index += 1;
        self.used_bytes = 0;
        Ok(())
    }

    /// Flushes, writes the block-index table, and patches the stream
    /// header in place with its final offset and count. The only
    /// rewrite of already-written bytes this crate ever performs.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.writable {
            return Err(Error::PermissionDenied);
        }
        self.flush()?;

        let table_offset = (self.write_cursor - self.device_offset) as u32;
        {
            let mut dev = self.device.borrow_mut();
            dev.seek(SeekFrom::Start(self.write_cursor))?;
            for header in &self.block_headers {
                let mut buf = [0u8; BlockHeader::SIZE];
                header.encode(&mut buf);
                dev.write_all(&buf)?;
            }
        }
        self.write_cursor += (self.block_headers.len() * BlockHeader::SIZE) as u64;

        let header = StreamHeader {
            magic: STREAM_MAGIC,
            block_size: self.block_size,
            block_headers_offset: table_offset,
            block_headers_count: self.block_headers.len() as u32,
        };
        {
            let mut dev = self.device.borrow_mut();
            dev.seek(SeekFrom::Start(self.device_offset))?;
            let mut buf = [0u8; StreamHeader::SIZE];
            header.encode(&mut buf);
            dev.write_all(&buf)?;
        }
        self.finished = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.writable && !self.finished {
            return Err(Error::InvalidArgument("write stream closed before finish()"));
        }
        Ok(())
    }

    pub fn lock(&self) -> Result<()> {
        self.device.borrow().lock()
    }

    pub fn unlock(&self) {
        self.device.borrow().unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn shared() -> SharedDevice {
        Rc::new(RefCell::new(MemoryDevice::new()))
    }

    #[test]
    fn write_then_read_single_block() {
        let device = shared();
        {
            let mut stream = BlockStream::create(device.clone(), 0, 16).unwrap();
            stream.write(b"hello world").unwrap();
            stream.finish().unwrap();
        }
        let mut reader = BlockStream::open(device, 0).unwrap();
        assert_eq!(reader.block_count(), 1);
        let mut buf = [0u8; 11];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn write_spans_multiple_blocks() {
        let device = shared();
        let payload: Vec<u8> = (0..50u32).map(|i| (i % 251) as u8).collect();
        {
            let mut stream = BlockStream::create(device.clone(), 0, 16).unwrap();
            stream.write(&payload).unwrap();
            stream.finish().unwrap();
        }
        let mut reader = BlockStream::open(device, 0).unwrap();
        assert_eq!(reader.block_count(), 4); // 3*16 + 2
        let mut buf = vec![0u8; payload.len()];
        let mut total = 0;
        while total < buf.len() {
            let n = reader.read(&mut buf[total..]).unwrap();
            assert!(n > 0);
            total += n;
        }
        assert_eq!(buf, payload);
    }

    #[test]
    fn seek_mid_stream_reads_from_correct_offset() {
        let device = shared();
        let payload: Vec<u8> = (0..40u32).map(|i| i as u8).collect();
        {
            let mut stream = BlockStream::create(device.clone(), 0, 16).unwrap();
            stream.write(&payload).unwrap();
            stream.finish().unwrap();
        }
        let mut reader = BlockStream::open(device, 0).unwrap();
        reader.seek(0, 20).unwrap(); // normalizes to block 1, offset 4
        let mut buf = [0u8; 4];
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, [20, 21, 22, 23]);
    }

    #[test]
    fn corrupted_block_fails_integrity_check() {
        let device = shared();
        {
            let mut stream = BlockStream::create(device.clone(), 0, 16).unwrap();
            stream.write(b"0123456789abcdef").unwrap();
            stream.finish().unwrap();
        }
        // Flip a bit inside block 0's uncompressed bytes on disk.
        {
            let mut dev = device.borrow_mut();
            dev.seek(SeekFrom::Start(StreamHeader::SIZE as u64)).unwrap();
            let mut byte = [0u8; 1];
            dev.read_exact(&mut byte).unwrap();
            byte[0] ^= 0xFF;
            dev.seek(SeekFrom::Start(StreamHeader::SIZE as u64)).unwrap();
            dev.write_all(&byte).unwrap();
        }
        let mut reader = BlockStream::open(device, 0).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(reader.read(&mut buf), Err(Error::IntegrityError)));
    }

    #[test]
    fn write_mode_rejects_read() {
        let device = shared();
        let mut stream = BlockStream::create(device, 0, 16).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(stream.read(&mut buf), Err(Error::PermissionDenied)));
    }

    fn xor_codec() -> Codec {
        Codec::new(
            |bytes: &[u8]| Ok(bytes.iter().map(|b| b ^ 0xAA).collect()),
            |bytes: &[u8], _max_len: usize| Ok(bytes.iter().map(|b| b ^ 0xAA).collect()),
        )
    }

    #[test]
    fn installed_codec_round_trips_through_encode_and_decode() {
        let device = shared();
        {
            let mut stream = BlockStream::create(device.clone(), 0, 16).unwrap();
            stream.set_codec(xor_codec());
            stream.write(b"hello world").unwrap();
            stream.finish().unwrap();
        }
        let mut reader = BlockStream::open(device, 0).unwrap();
        reader.set_codec(xor_codec());
        let mut buf = [0u8; 11];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn cloned_codec_shares_the_same_function_pair() {
        let codec = xor_codec();
        let clone = codec.clone();
        let device = shared();
        let mut stream = BlockStream::create(device, 0, 16).unwrap();
        stream.set_codec(codec);
        stream.write(b"abc").unwrap();
        stream.finish().unwrap();
        drop(clone);
    }
}
