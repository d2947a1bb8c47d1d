//! The image engine: open (read mode) and create/close (write mode).

use crate::config::ImageConfig;
use crate::descriptor::tree::{self, NodeRef};
use crate::device::{Device, MemoryDevice, SeekFrom};
use crate::error::{Error, Result};
use crate::feature::{FeatureRecord, FeatureTable, FEATURE_FILTER, FEATURE_HEADER_SIZE, FEATURE_OVERVIEW};
use crate::header::{ImageHeader, DESCRIPTOR_BLOCK_SIZE};
use crate::stream::{BlockStream, Codec, SharedDevice};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Aggregate counts persisted in the Overview feature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OverviewCounts {
    pub files: u32,
    pub directories: u32,
    pub symlinks: u32,
    pub total_bytes: u32,
}

impl OverviewCounts {
    pub const SIZE: usize = 16;

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.files.to_le_bytes());
        buf[4..8].copy_from_slice(&self.directories.to_le_bytes());
        buf[8..12].copy_from_slice(&self.symlinks.to_le_bytes());
        buf[12..16].copy_from_slice(&self.total_bytes.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::IntegrityError);
        }
        Ok(Self {
            files: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            directories: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            symlinks: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            total_bytes: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

fn count_tree(node: &NodeRef, counts: &mut OverviewCounts) {
    use crate::descriptor::tree::Node;
    match &*node.borrow() {
        Node::File(f) => {
            counts.files += 1;
            counts.total_bytes += f.file_length;
        }
        Node::Symlink(_) => counts.symlinks += 1,
        Node::Directory(d) => {
            counts.directories += 1;
            for child in &d.children {
                count_tree(child, counts);
            }
        }
    }
}

/// An open VaFs image, in either read or write mode.
pub struct Image {
    mode: Mode,
    device: SharedDevice,
    pub(crate) descriptor_stream: BlockStream,
    pub(crate) data_stream: BlockStream,
    features: FeatureTable,
    pub(crate) root: NodeRef,
    header: ImageHeader,
    closed: bool,
}

impl Image {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    /// Opens an existing image for reading.
    pub fn open(device: SharedDevice) -> Result<Self> {
        let header = {
            let mut dev = device.borrow_mut();
            dev.seek(SeekFrom::Start(0))?;
            let mut buf = [0u8; ImageHeader::SIZE];
            dev.read_exact(&mut buf)?;
            ImageHeader::decode(&buf)?
        };

        let mut features = FeatureTable::new();
        {
            let mut dev = device.borrow_mut();
            dev.seek(SeekFrom::Start(ImageHeader::SIZE as u64))?;
            for _ in 0..header.feature_count {
                let mut head = [0u8; FEATURE_HEADER_SIZE];
                dev.read_exact(&mut head)?;
                let len = u32::from_le_bytes(head[16..20].try_into().unwrap()) as usize;
                if len < FEATURE_HEADER_SIZE {
                    return Err(Error::IntegrityError);
                }
                let mut full = vec![0u8; len];
                full[..FEATURE_HEADER_SIZE].copy_from_slice(&head);
                dev.read_exact(&mut full[FEATURE_HEADER_SIZE..])?;
                let (record, _) = FeatureRecord::decode(&full)?;
                features.insert(record)?;
            }
        }

        let descriptor_stream = BlockStream::open(device.clone(), header.descriptor_offset as u64)?;
        let data_stream = BlockStream::open(device.clone(), header.data_offset as u64)?;

        let root = Rc::new(RefCell::new(crate::descriptor::tree::Node::Directory(
            crate::descriptor::tree::DirectoryNode {
                name: "root".to_string(),
                permissions: 0o777,
                children: Vec::new(),
                loaded: false,
                child_pos: header.root_position,
            },
        )));

        log::debug!("opened image: {} features, root at {:?}", features.len(), header.root_position);

        Ok(Self {
            mode: Mode::Read,
            device,
            descriptor_stream,
            data_stream,
            features,
            root,
            header,
            closed: false,
        })
    }

    /// Begins building a new image. `device` is the final destination;
    /// the tree and both streams are staged in memory until `close`.
    pub fn create(device: SharedDevice, config: ImageConfig) -> Result<Self> {
        config.validate()?;

        let temp_descriptor: SharedDevice = Rc::new(RefCell::new(MemoryDevice::new()));
        let temp_data: SharedDevice = Rc::new(RefCell::new(MemoryDevice::new()));

        let descriptor_stream = BlockStream::create(temp_descriptor, 0, DESCRIPTOR_BLOCK_SIZE)?;
        let data_stream = BlockStream::create(temp_data, 0, config.data_block_size)?;

        let mut features = FeatureTable::new();
        features.insert(FeatureRecord::new(FEATURE_OVERVIEW, OverviewCounts::default().encode()))?;

        let root = tree::create_root();
        let mut header = ImageHeader::new(config.architecture);
        header.attributes = config.attributes;

        log::debug!("created new image, architecture={:?}", config.architecture);

        Ok(Self {
            mode: Mode::Write,
            device,
            descriptor_stream,
            data_stream,
            features,
            root,
            header,
            closed: false,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn descriptor_block_count(&self) -> usize {
        self.descriptor_stream.block_count()
    }

    pub fn data_block_count(&self) -> usize {
        self.data_stream.block_count()
    }

    /// Number of blocks currently held in the data stream's hot-block cache.
    pub fn data_cache_len(&self) -> usize {
        self.data_stream.cache_len()
    }

    /// Whether data block `index` is currently cached.
    pub fn data_cache_contains(&self, index: u32) -> bool {
        self.data_stream.cache_contains(index)
    }

    pub fn feature_add(&mut self, record: FeatureRecord) -> Result<()> {
        self.features.insert(record)
    }

    /// Installs a Filter-Ops codec on both streams, attached immediately:
    /// every block flushed or loaded from this point on goes through it.
    /// The codec itself is never persisted; in write mode this also
    /// records the Filter feature marker so a reader knows one is in use.
    pub fn set_codec(&mut self, codec: Codec) -> Result<()> {
        self.descriptor_stream.set_codec(codec.clone());
        self.data_stream.set_codec(codec);
        if self.mode == Mode::Write {
            self.feature_add(FeatureRecord::new(FEATURE_FILTER, Vec::new()))?;
        }
        Ok(())
    }

    pub fn feature_query(&self, guid: crate::guid::Guid) -> Option<&FeatureRecord> {
        self.features.get(guid)
    }

    /// Reads back the persisted aggregate counts (files, directories,
    /// symlinks, total bytes). Accurate as of the last `close` for a
    /// write-mode image that has been reopened; a live write-mode image
    /// hasn't recomputed it yet.
    pub fn overview(&self) -> Result<OverviewCounts> {
        let record = self.features.get(FEATURE_OVERVIEW).ok_or(Error::NotFound)?;
        OverviewCounts::decode(&record.data)
    }

    /// Finalizes a write-mode image: serializes the tree, finishes both
    /// streams, writes the header and features, then appends the
    /// staged descriptor/data bytes onto the final device.
    pub fn close(mut self) -> Result<()> {
        match self.mode {
            Mode::Read => {
                log::debug!("closed read-mode image");
                Ok(())
            }
            Mode::Write => self.close_write(),
        }
    }

    fn close_write(&mut self) -> Result<()> {
        let root_pos = tree::serialize_directory(&self.root, &mut self.descriptor_stream)?;

        self.descriptor_stream.finish()?;
        self.data_stream.finish()?;

        let mut counts = OverviewCounts::default();
        count_tree(&self.root, &mut counts);
        self.features.insert(FeatureRecord::new(FEATURE_OVERVIEW, counts.encode()))?;

        self.header.feature_count = self.features.len() as u16;
        self.header.root_position = root_pos;

        let features_len = self.features.encoded_len();
        self.header.descriptor_offset = (ImageHeader::SIZE + features_len) as u32;
        self.header.data_offset =
            self.header.descriptor_offset + self.descriptor_stream.total_len() as u32;

        {
            let mut dev = self.device.borrow_mut();
            dev.seek(SeekFrom::Start(0))?;
            let mut buf = [0u8; ImageHeader::SIZE];
            self.header.encode(&mut buf);
            dev.write_all(&buf)?;

            let mut feature_buf = vec![0u8; features_len];
            self.features.encode(&mut feature_buf);
            dev.write_all(&feature_buf)?;
        }

        crate::device::copy(&mut *self.device.borrow_mut(), &mut *self.descriptor_stream_device().borrow_mut())?;
        crate::device::copy(&mut *self.device.borrow_mut(), &mut *self.data_stream_device().borrow_mut())?;

        self.closed = true;
        log::debug!(
            "closed write-mode image: descr_off={} data_off={}",
            self.header.descriptor_offset,
            self.header.data_offset
        );
        Ok(())
    }

    fn descriptor_stream_device(&self) -> SharedDevice {
        self.descriptor_stream.device()
    }

    fn data_stream_device(&self) -> SharedDevice {
        self.data_stream.device()
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("mode", &self.mode).field("closed", &self.closed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;
    use crate::device::MemoryDevice;
    use crate::feature::FEATURE_FILTER;
    use crate::header::Architecture;

    fn shared() -> SharedDevice {
        Rc::new(RefCell::new(MemoryDevice::new()))
    }

    fn xor_codec() -> Codec {
        Codec::new(
            |bytes: &[u8]| Ok(bytes.iter().map(|b| b ^ 0xAA).collect()),
            |bytes: &[u8], _max_len: usize| Ok(bytes.iter().map(|b| b ^ 0xAA).collect()),
        )
    }

    #[test]
    fn installed_codec_round_trips_a_file_and_records_filter_feature() {
        let device = shared();
        {
            let mut image = Image::create(device.clone(), ImageConfig::new(Architecture::X64)).unwrap();
            image.set_codec(xor_codec()).unwrap();
            assert!(image.feature_query(FEATURE_FILTER).is_some());

            let root = image.open_root().unwrap();
            let mut file = image.create_file(&root, "payload", 0o644).unwrap();
            image.file_write(&mut file, b"filtered bytes").unwrap();
            image.file_close(file);
            image.close().unwrap();
        }

        let mut image = Image::open(device).unwrap();
        image.set_codec(xor_codec()).unwrap();
        let root = image.open_root().unwrap();
        let mut file = image.open_file(&root, "payload").unwrap();
        let mut buf = [0u8; 14]; // b"filtered bytes".len()
        image.file_read(&mut file, &mut buf).unwrap();
        assert_eq!(&buf, b"filtered bytes");
    }

    #[test]
    fn overview_counts_a_small_tree() {
        let device = shared();
        let mut image = Image::create(device, ImageConfig::new(Architecture::X64)).unwrap();
        let root = image.open_root().unwrap();
        let sub = image.create_directory(&root, "bin", 0o755).unwrap();
        let mut file = image.create_file(&sub, "sh", 0o755).unwrap();
        image.file_write(&mut file, b"abcde").unwrap();
        image.file_close(file);

        let mut counts = OverviewCounts::default();
        count_tree(&image.root(), &mut counts);
        assert_eq!(counts.directories, 2); // root + bin
        assert_eq!(counts.files, 1);
        assert_eq!(counts.total_bytes, 5);
    }
}
