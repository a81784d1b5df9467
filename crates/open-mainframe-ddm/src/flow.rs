//! Query block splitting for QRYDTA flow control.
//!
//! Rows are written into a QRYDTA DSS until it grows past the negotiated
//! query block size (QRYBLKSZ). The bytes past the block boundary are cut off
//! and carried into the next block, which opens with them.

use crate::code_points::QRYDTA;
use crate::writer::DdmWriter;

/// Smallest QRYBLKSZ a requester may ask for.
pub const MIN_QUERY_BLOCK_SIZE: usize = 512;
/// Largest QRYBLKSZ a requester may ask for.
pub const MAX_QUERY_BLOCK_SIZE: usize = 10_485_760;

/// DSS header plus QRYDTA header at the start of every block.
const BLOCK_OVERHEAD: usize = 10;

/// Carries overflow row data from one query block to the next.
#[derive(Debug, Clone)]
pub struct QueryBlockSplitter {
    block_size: usize,
    leftover: Vec<u8>,
}

impl QueryBlockSplitter {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.clamp(MIN_QUERY_BLOCK_SIZE, MAX_QUERY_BLOCK_SIZE),
            leftover: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Overflow bytes still waiting for a block.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    pub fn has_leftover(&self) -> bool {
        !self.leftover.is_empty()
    }

    /// Cut the current DSS back to the block size when it has grown past it.
    ///
    /// Returns whether the block is full; the cut bytes are kept for
    /// [`write_leftover`](Self::write_leftover).
    pub fn split_if_needed(&mut self, writer: &mut DdmWriter) -> bool {
        let length = writer.dss_length();
        if length <= self.block_size {
            return false;
        }
        let mut overflow = writer.copy_dss_data_to_end(self.block_size);
        overflow.extend_from_slice(&self.leftover);
        self.leftover = overflow;
        writer.truncate_dss(self.block_size);
        tracing::trace!(
            dss_length = length,
            block_size = self.block_size,
            leftover = self.leftover.len(),
            "Split query block"
        );
        true
    }

    /// Write carried-over bytes into the current QRYDTA.
    ///
    /// At most a block's worth of data is written; anything beyond stays for
    /// the following block. Returns the number of bytes written.
    pub fn write_leftover(&mut self, writer: &mut DdmWriter) -> usize {
        let count = self.leftover.len().min(self.block_size - BLOCK_OVERHEAD);
        writer.write_bytes(&self.leftover[..count]);
        self.leftover.drain(..count);
        count
    }

    /// Open the next QRYDTA reply object, starting with any leftover data.
    pub fn start_block(&mut self, writer: &mut DdmWriter) {
        writer.create_dss_object();
        writer.start_ddm(QRYDTA);
        self.write_leftover(writer);
    }
}
