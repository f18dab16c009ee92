//! Binary header prefixed to every raw frame read from a hardware camera.
//!
//! Big-endian layout, 32 bytes:
//!
//! | offset | size | field                |
//! |--------|------|----------------------|
//! | 0      | 4    | magic                |
//! | 4      | 2    | version              |
//! | 6      | 2    | image mode           |
//! | 8      | 8    | frame sequence (i64) |
//! | 16     | 4    | width (i32)          |
//! | 20     | 4    | height (i32)         |
//! | 24     | 8    | 4 x reserved u16     |

use crate::error::HeaderError;

pub const HEADER_SIZE: usize = 32;

/// Magic written by the camera video servers ("VDEO").
pub const HEADER_MAGIC: u32 = 0x5644_454f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub image_mode: u16,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub reserved: [u16; 4],
}

impl FrameHeader {
    /// Offset of the pixel payload within the buffer.
    pub const PAYLOAD_OFFSET: usize = HEADER_SIZE;

    pub fn new(sequence: u64, width: u32, height: u32, image_mode: u16) -> Self {
        Self {
            magic: HEADER_MAGIC,
            version: 1,
            image_mode,
            sequence,
            width,
            height,
            reserved: [0; 4],
        }
    }

    /// Decode the header at the start of `buf`.
    ///
    /// The magic is reported but not enforced; cameras in the field are not
    /// consistent about it.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated {
                len: buf.len(),
                needed: HEADER_SIZE,
            });
        }

        let u16_at = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
        let i32_at = |at: usize| i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[8..16]);
        let sequence = i64::from_be_bytes(seq);
        let width = i32_at(16);
        let height = i32_at(20);

        if width <= 0 || height <= 0 {
            return Err(HeaderError::BadGeometry { width, height });
        }
        if sequence < 0 {
            return Err(HeaderError::BadSequence(sequence));
        }

        Ok(Self {
            magic,
            version: u16_at(4),
            image_mode: u16_at(6),
            sequence: sequence as u64,
            width: width as u32,
            height: height as u32,
            reserved: [u16_at(24), u16_at(26), u16_at(28), u16_at(30)],
        })
    }

    /// Decode the header and return it with the payload that follows.
    pub fn split(buf: &[u8]) -> Result<(Self, &[u8]), HeaderError> {
        let header = Self::decode(buf)?;
        Ok((header, &buf[Self::PAYLOAD_OFFSET..]))
    }

    /// Append the header to `out`.
    ///
    /// Fails, writing nothing, for values `decode` would not give back:
    /// sequences above `i64::MAX` and geometry outside `1..=i32::MAX`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), HeaderError> {
        let sequence =
            i64::try_from(self.sequence).map_err(|_| HeaderError::SequenceRange(self.sequence))?;
        let (width, height) = match (i32::try_from(self.width), i32::try_from(self.height)) {
            (Ok(width), Ok(height)) if width > 0 && height > 0 => (width, height),
            _ => {
                return Err(HeaderError::GeometryRange {
                    width: self.width,
                    height: self.height,
                })
            }
        };

        out.reserve(HEADER_SIZE);
        out.extend_from_slice(&self.magic.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.image_mode.to_be_bytes());
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        for field in self.reserved {
            out.extend_from_slice(&field.to_be_bytes());
        }
        Ok(())
    }

    /// Bytes of pixel data this header's geometry implies at `bytes_per_pixel`.
    pub fn payload_len(&self, bytes_per_pixel: usize) -> usize {
        self.width as usize * self.height as usize * bytes_per_pixel
    }
}
