//! The streaming buffer shared by the SDO client and server state machines.

use alloc::vec::Vec;

/// A fragment-reassembly buffer over an SDO payload of up to 4 GiB.
///
/// For downloads the producer pushes fragments as they arrive and the
/// consumer takes the reassembled payload at the end. For uploads the whole
/// payload is loaded up front and served out in fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferBuffer {
    /// Total payload size, if announced by the peer.
    size: Option<u32>,
    data: Vec<u8>,
    /// Read cursor for fragment extraction (upload direction).
    pos: usize,
}

impl TransferBuffer {
    /// An empty buffer with unknown total size.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer expecting exactly `size` bytes.
    pub fn with_size(size: u32) -> Self {
        Self {
            size: Some(size),
            data: Vec::new(),
            pos: 0,
        }
    }

    /// A buffer pre-loaded with a complete payload, ready for fragment
    /// extraction.
    pub fn from_payload(data: Vec<u8>) -> Self {
        Self {
            size: Some(data.len() as u32),
            data,
            pos: 0,
        }
    }

    /// The announced total size, if known.
    pub fn size(&self) -> Option<u32> {
        self.size
    }

    /// Bytes accumulated (download) or loaded (upload) so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends an arrived fragment.
    ///
    /// Returns `false` if the fragment would exceed the announced size.
    #[must_use]
    pub fn push(&mut self, fragment: &[u8]) -> bool {
        if let Some(size) = self.size {
            if self.data.len() + fragment.len() > size as usize {
                return false;
            }
        }
        self.data.extend_from_slice(fragment);
        true
    }

    /// Drops the `n` most recently pushed bytes. Used by block downloads to
    /// discard the padding of the final sub-frame.
    pub fn truncate_tail(&mut self, n: usize) {
        let len = self.data.len().saturating_sub(n);
        self.data.truncate(len);
    }

    /// True once the accumulated bytes match the announced size (always true
    /// when no size was announced).
    pub fn is_complete(&self) -> bool {
        match self.size {
            Some(size) => self.data.len() as u32 == size,
            None => true,
        }
    }

    /// Bytes not yet served out as fragments.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Serves out the next fragment of at most `max` bytes, advancing the
    /// cursor.
    pub fn next_fragment(&mut self, max: usize) -> &[u8] {
        let n = self.remaining().min(max);
        let start = self.pos;
        self.pos += n;
        &self.data[start..start + n]
    }

    /// Peeks at the next fragment without advancing the cursor.
    pub fn peek_fragment(&self, max: usize) -> &[u8] {
        let n = self.remaining().min(max);
        &self.data[self.pos..self.pos + n]
    }

    /// Rewinds the cursor by `n` bytes. Used by block uploads to retransmit
    /// from a NAK'd sequence number.
    pub fn rewind(&mut self, n: usize) {
        self.pos = self.pos.saturating_sub(n);
    }

    /// Consumes the buffer, yielding the reassembled payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.data
    }

    /// Borrows the full payload.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}
