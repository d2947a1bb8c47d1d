//! 128-bit GUIDs used to tag feature records.

use std::fmt;

/// A 128-bit GUID laid out on disk as `{ u32, u16, u16, [u8; 8] }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Guid {
    pub d1: u32,
    pub d2: u16,
    pub d3: u16,
    pub d4: [u8; 8],
}

impl Guid {
    pub const SIZE: usize = 16;

    pub const fn new(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        Self { d1, d2, d3, d4 }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.d1.to_le_bytes());
        buf[4..6].copy_from_slice(&self.d2.to_le_bytes());
        buf[6..8].copy_from_slice(&self.d3.to_le_bytes());
        buf[8..16].copy_from_slice(&self.d4);
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let d1 = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let d2 = u16::from_le_bytes(buf[4..6].try_into().ok()?);
        let d3 = u16::from_le_bytes(buf[6..8].try_into().ok()?);
        let mut d4 = [0u8; 8];
        d4.copy_from_slice(&buf[8..16]);
        Some(Self { d1, d2, d3, d4 })
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.d1,
            self.d2,
            self.d3,
            self.d4[0],
            self.d4[1],
            self.d4[2],
            self.d4[3],
            self.d4[4],
            self.d4[5],
            self.d4[6],
            self.d4[7]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let g = Guid::new(0x1234_5678, 0xabcd, 0xef01, [1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = [0u8; Guid::SIZE];
        g.encode(&mut buf);
        let back = Guid::decode(&buf).unwrap();
        assert_eq!(g, back);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(Guid::decode(&[0u8; 10]).is_none());
    }
}
