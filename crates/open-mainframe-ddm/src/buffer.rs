//! Growable message buffer with an explicit write cursor.
//!
//! Unlike `BytesMut::put_*`, the cursor here can be moved backwards so that
//! length fields written as placeholders can be patched once the extent of a
//! DSS or DDM object is known. Offsets stay valid across growth because the
//! writer only ever stores integer positions.

use bytes::BytesMut;

/// Default buffer size: one full DSS.
pub const DEFAULT_BUFFER_SIZE: usize = 32767;

/// Byte order of PDU data fields, negotiated through TYPDEFNAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network order; used for every DDM length, code point and header field.
    #[default]
    BigEndian,
    /// Intel order, requested with `QTDSQLX86`.
    LittleEndian,
}

impl ByteOrder {
    /// Byte order implied by a TYPDEFNAM value. Unknown names keep network order.
    pub fn from_typdefnam(typdefnam: &str) -> Self {
        match typdefnam.trim() {
            "QTDSQLX86" => ByteOrder::LittleEndian,
            _ => ByteOrder::BigEndian,
        }
    }
}

/// Contiguous byte region with a movable cursor.
///
/// The capacity is the length of the backing region; bytes between the
/// cursor and the capacity are garbage and get overwritten.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    data: BytesMut,
    position: usize,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    /// Create a buffer with [`DEFAULT_BUFFER_SIZE`] capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(capacity.max(1)),
            position: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor to an absolute offset.
    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.capacity(), "cursor beyond capacity");
        self.position = position.min(self.capacity());
    }

    /// Bytes available between the cursor and the capacity.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.position
    }

    /// Make room for `extra` bytes past the cursor, growing to at least double
    /// the current capacity. Contents and cursor are preserved.
    pub fn ensure_capacity(&mut self, extra: usize) {
        if self.remaining() >= extra {
            return;
        }
        let new_capacity = (self.capacity() * 2).max(self.position + extra);
        tracing::trace!(
            from = self.capacity(),
            to = new_capacity,
            "Expanding message buffer"
        );
        self.data.resize(new_capacity, 0);
    }

    /// Logical truncation: move the cursor back to `offset`.
    pub fn truncate_to(&mut self, offset: usize) {
        debug_assert!(offset <= self.position, "truncate past the cursor");
        self.set_position(offset);
    }

    /// Drop all content.
    pub fn clear(&mut self) {
        self.position = 0;
    }

    /// Written bytes, `0..position`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.position]
    }

    /// Copy of the bytes from `offset` to the cursor.
    pub fn contents_from(&self, offset: usize) -> Vec<u8> {
        self.data[offset..self.position].to_vec()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.ensure_capacity(1);
        self.data[self.position] = value;
        self.position += 1;
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_slice(&value.to_be_bytes());
    }

    pub fn put_u16_ordered(&mut self, value: u16, order: ByteOrder) {
        match order {
            ByteOrder::BigEndian => self.put_slice(&value.to_be_bytes()),
            ByteOrder::LittleEndian => self.put_slice(&value.to_le_bytes()),
        }
    }

    pub fn put_u32_ordered(&mut self, value: u32, order: ByteOrder) {
        match order {
            ByteOrder::BigEndian => self.put_slice(&value.to_be_bytes()),
            ByteOrder::LittleEndian => self.put_slice(&value.to_le_bytes()),
        }
    }

    pub fn put_u64_ordered(&mut self, value: u64, order: ByteOrder) {
        match order {
            ByteOrder::BigEndian => self.put_slice(&value.to_be_bytes()),
            ByteOrder::LittleEndian => self.put_slice(&value.to_le_bytes()),
        }
    }

    /// Append `src` at the cursor.
    pub fn put_slice(&mut self, src: &[u8]) {
        self.ensure_capacity(src.len());
        let end = self.position + src.len();
        self.data[self.position..end].copy_from_slice(src);
        self.position = end;
    }

    /// Append `len` copies of `value`.
    pub fn fill(&mut self, value: u8, len: usize) {
        self.ensure_capacity(len);
        let end = self.position + len;
        self.data[self.position..end].fill(value);
        self.position = end;
    }

    /// Overwrite a 2-byte big-endian field behind the cursor.
    pub fn put_u16_at(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn get_u16_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn put_u8_at(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    pub fn get_u8_at(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// OR `mask` into the byte at `offset`.
    pub fn or_u8_at(&mut self, offset: usize, mask: u8) {
        self.data[offset] |= mask;
    }

    /// Move `len` bytes starting at `src` to `dest` in one overlapping-safe
    /// block copy. Does not move the cursor.
    pub fn copy_within(&mut self, src: usize, len: usize, dest: usize) {
        self.data.copy_within(src..src + len, dest);
    }

    /// Open a gap of `count` bytes at `from` by shifting `from..position`
    /// right; the cursor advances by `count`.
    pub fn shift_right(&mut self, from: usize, count: usize) {
        self.ensure_capacity(count);
        let len = self.position - from;
        self.copy_within(from, len, from + count);
        self.position += count;
    }

    /// Writable region of up to `max` bytes at the cursor, for reading a
    /// stream straight into the buffer. Follow with [`advance`](Self::advance).
    pub fn spare_mut(&mut self, max: usize) -> &mut [u8] {
        self.ensure_capacity(max);
        let start = self.position;
        &mut self.data[start..start + max]
    }

    /// Move the cursor forward over bytes filled through [`spare_mut`](Self::spare_mut).
    pub fn advance(&mut self, count: usize) {
        self.set_position(self.position + count);
    }
}
