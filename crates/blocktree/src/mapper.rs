//! Byte-range to block translation.
//!
//! The NBD layer deals in arbitrary offsets and lengths; the store deals in
//! fixed-size blocks at `blocks/<N>`. The mapper walks the covered blocks,
//! substituting zeros for absent objects, performing read-modify-write on
//! partial overlaps, and converting blocks that become all zero into delete
//! requests so they vanish from the store.

use std::sync::Arc;

use crate::{BlockTree, TreeError, Value};
use stratus_core::block_path;

fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Maps byte ranges onto a [`BlockTree`].
pub struct BlockMapper {
    tree: Arc<BlockTree>,
    bs: u64,
}

impl BlockMapper {
    /// A mapper over `tree` with block size `bs`.
    pub fn new(tree: Arc<BlockTree>, bs: u32) -> Self {
        Self { tree, bs: u64::from(bs.max(1)) }
    }

    /// The configured block size.
    pub fn block_size(&self) -> u64 {
        self.bs
    }

    /// Fetch one block's payload, verifying its length. `None` means the
    /// block is absent and reads as zeros.
    fn fetch(&self, index: u64) -> Result<Value, TreeError> {
        let path = block_path(index);
        match self.tree.get(&path)? {
            Some(data) => {
                if data.len() as u64 != self.bs {
                    return Err(TreeError::BlockLength {
                        path,
                        expected: self.bs as usize,
                        actual: data.len(),
                    });
                }
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Read `length` bytes starting at `offset`. Always returns exactly
    /// `length` bytes; holes read as zeros. An empty request is a no-op.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, TreeError> {
        let mut out = Vec::with_capacity(length);
        if length == 0 {
            return Ok(out);
        }
        let end = offset + length as u64;
        let mut block = offset / self.bs;
        while block * self.bs < end {
            let base = block * self.bs;
            let from = (offset.max(base) - base) as usize;
            let to = (end.min(base + self.bs) - base) as usize;
            match self.fetch(block)? {
                Some(data) => out.extend_from_slice(&data[from..to]),
                None => out.resize(out.len() + (to - from), 0),
            }
            block += 1;
        }
        debug_assert_eq!(out.len(), length);
        Ok(out)
    }

    /// Write `data` starting at `offset`.
    ///
    /// Full-block spans replace the block outright; partial spans
    /// read-modify-write against the current payload (zeros when absent),
    /// reusing the cached buffer the read just produced. A block that ends
    /// up all zero is queued as a delete instead of a store.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), TreeError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        let mut block = offset / self.bs;
        let mut consumed = 0usize;
        while block * self.bs < end {
            let base = block * self.bs;
            let from = (offset.max(base) - base) as usize;
            let to = (end.min(base + self.bs) - base) as usize;
            let chunk = &data[consumed..consumed + (to - from)];
            let payload = if (to - from) as u64 == self.bs {
                if is_zero(chunk) {
                    None
                } else {
                    Some(chunk.to_vec())
                }
            } else {
                let mut buf = match self.fetch(block)? {
                    Some(current) => current.as_ref().clone(),
                    None => vec![0u8; self.bs as usize],
                };
                buf[from..to].copy_from_slice(chunk);
                if is_zero(&buf) {
                    None
                } else {
                    Some(buf)
                }
            };
            self.tree.set(&block_path(block), payload);
            consumed += to - from;
            block += 1;
        }
        Ok(())
    }

    /// Discard `length` bytes starting at `offset`: fully covered blocks are
    /// deleted from the store, partially covered ones are zeroed in place.
    pub fn trim(&self, offset: u64, length: u64) -> Result<(), TreeError> {
        if length == 0 {
            return Ok(());
        }
        let end = offset + length;
        let mut block = offset / self.bs;
        while block * self.bs < end {
            let base = block * self.bs;
            let from = (offset.max(base) - base) as usize;
            let to = (end.min(base + self.bs) - base) as usize;
            if (to - from) as u64 == self.bs {
                self.tree.set(&block_path(block), None);
            } else if let Some(current) = self.fetch(block)? {
                let mut buf = current.as_ref().clone();
                buf[from..to].fill(0);
                let payload = if is_zero(&buf) { None } else { Some(buf) };
                self.tree.set(&block_path(block), payload);
            }
            // an absent block is already zero
            block += 1;
        }
        Ok(())
    }

    /// Whole-volume flush barrier; byte-range arguments of the NBD FLUSH are
    /// deliberately ignored.
    pub fn flush(&self) {
        self.tree.flush();
    }
}
