//! Table footer: fixed-size trailer locating the filter and index blocks.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::sstable::{FOOTER_SIZE, TABLE_MAGIC};

/// Location of a block within the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// File offset of the block's first byte.
    pub offset: u64,
    /// Size of the block contents, excluding the trailer.
    pub size: u64,
}

impl BlockHandle {
    /// Creates a handle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Encodes as 16 bytes: offset then size, little-endian.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decodes from at least 16 bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::corruption("block handle too short"));
        }
        Ok(Self {
            offset: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }
}

/// The last [`FOOTER_SIZE`] bytes of every table file.
///
/// ```text
/// [filter_handle: 16] [index_handle: 16] [padding: 8] [magic: 8]
/// ```
///
/// A zero-sized filter handle means the table carries no filter block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// Handle of the bloom filter block, size 0 when absent.
    pub filter_handle: BlockHandle,
    /// Handle of the index block.
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Creates a footer.
    pub fn new(filter_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self { filter_handle, index_handle }
    }

    /// Encodes to the fixed footer size.
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..16].copy_from_slice(&self.filter_handle.encode());
        buf[16..32].copy_from_slice(&self.index_handle.encode());
        buf[40..48].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
        buf
    }

    /// Decodes and validates the magic number.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::corruption(format!(
                "footer size mismatch: expected {}, got {}",
                FOOTER_SIZE,
                data.len()
            )));
        }
        let magic = u64::from_le_bytes(data[40..48].try_into().unwrap());
        if magic != TABLE_MAGIC {
            return Err(Error::corruption("not an sstable (bad magic number)"));
        }
        Ok(Self {
            filter_handle: BlockHandle::decode(&data[0..16])?,
            index_handle: BlockHandle::decode(&data[16..32])?,
        })
    }

    /// Writes the footer to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Reads a footer from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;
        Self::decode(&buf)
    }
}
