//! Splitting an image into address-ordered blocks

use bytes::Bytes;

/// One contiguous slice of the image and its target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    pub address: u32,
    pub data: Bytes,
}

/// Number of blocks needed for `len` bytes
pub fn block_count(len: usize, block_size: u32) -> usize {
    len.div_ceil(block_size.max(1) as usize)
}

/// Split `data` into `ceil(len / block_size)` blocks starting at `base`.
///
/// Blocks share the buffer; the last block carries the remainder.
pub fn split_blocks(base: u32, data: &Bytes, block_size: u32) -> Vec<Block> {
    let size = block_size.max(1) as usize;
    (0..block_count(data.len(), block_size))
        .map(|index| {
            let start = index * size;
            let end = (start + size).min(data.len());
            Block {
                index,
                address: base.wrapping_add(start as u32),
                data: data.slice(start..end),
            }
        })
        .collect()
}
