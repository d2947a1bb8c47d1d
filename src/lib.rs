//! VaFs: a read-optimized archive/filesystem-image format for
//! initrd-style boot images.
//!
//! An image is a device-backed tree of files, directories, and symlinks
//! split into two block streams (descriptors, data), plus a small table
//! of GUID-tagged feature records. Images are built once in write mode
//! and read many times in read mode; the on-disk layout and the block
//! cache are both shaped around that access pattern.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use vafs::config::ImageConfig;
//! use vafs::device::MemoryDevice;
//! use vafs::header::Architecture;
//! use vafs::Image;
//!
//! let device = Rc::new(RefCell::new(MemoryDevice::new()));
//! let mut image = Image::create(device.clone(), ImageConfig::new(Architecture::X64))?;
//! let root = image.open_root()?;
//! let mut file = image.create_file(&root, "init", 0o755)?;
//! image.file_write(&mut file, b"#!/bin/sh\n")?;
//! image.file_close(file);
//! image.close()?;
//! # Ok::<(), vafs::Error>(())
//! ```

pub mod api;
pub mod config;
pub mod crc;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod error;
pub mod feature;
pub mod guid;
pub mod header;
pub mod logging;
pub mod stream;

pub use api::{DirectoryHandle, EntryType, FileHandle, Stat, SymlinkHandle};
pub use config::ImageConfig;
pub use engine::{Image, Mode, OverviewCounts};
pub use error::{Error, Result};
pub use guid::Guid;
