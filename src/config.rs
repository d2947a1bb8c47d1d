//! Build-time configuration for a new image.

use crate::error::{Error, Result};
use crate::header::{Architecture, DATA_DEFAULT_BLOCK_SIZE, DATA_MAX_BLOCK_SIZE, DATA_MIN_BLOCK_SIZE};

#[derive(Clone, Debug)]
pub struct ImageConfig {
    pub architecture: Architecture,
    pub data_block_size: u32,
    pub attributes: u32,
}

impl ImageConfig {
    pub fn new(architecture: Architecture) -> Self {
        Self { architecture, data_block_size: DATA_DEFAULT_BLOCK_SIZE, attributes: 0 }
    }

    pub fn with_data_block_size(mut self, size: u32) -> Self {
        self.data_block_size = size;
        self
    }

    pub fn with_attributes(mut self, attributes: u32) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_block_size < DATA_MIN_BLOCK_SIZE || self.data_block_size > DATA_MAX_BLOCK_SIZE {
            return Err(Error::InvalidArgument("data_block_size out of range"));
        }
        if self.data_block_size % DATA_MIN_BLOCK_SIZE != 0 {
            return Err(Error::InvalidArgument("data_block_size must be block-aligned"));
        }
        Ok(())
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self::new(Architecture::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ImageConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_block_size_below_minimum() {
        let cfg = ImageConfig::new(Architecture::X64).with_data_block_size(1024);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_block_size_above_maximum() {
        let cfg = ImageConfig::new(Architecture::X64).with_data_block_size(2 * 1024 * 1024);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_misaligned_block_size() {
        let cfg = ImageConfig::new(Architecture::X64).with_data_block_size(8 * 1024 + 1);
        assert!(matches!(cfg.validate(), Err(Error::InvalidArgument(_))));
    }
}
