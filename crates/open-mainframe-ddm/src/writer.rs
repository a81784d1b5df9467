//! DSS/DDM reply writer.
//!
//! `DdmWriter` assembles outbound DSSes in a [`MessageBuffer`]. Lengths are
//! written as placeholders and patched once the object is complete:
//!
//! ```text
//! DSS:  [len:2][0xD0][fmt|chain][corr:2] ddm...
//! DDM:  [len:2][cp:2] payload                      len <= 0x7FFF
//!       [0x8000|4+n:2][cp:2][payload len:n] payload n = 4, 6 or 8
//! ```
//!
//! A DSS larger than 32767 bytes is split in place into continuation
//! segments, each prefixed by a 2-byte header. Every DSS is written with the
//! "chained, same correlator" bit; [`DdmWriter::finalize_chain`] rewrites the
//! chain bits of the last DSS of a request once the request's own chain state
//! is known, and sends the buffer when the chain ends.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::buffer::{ByteOrder, MessageBuffer, DEFAULT_BUFFER_SIZE};
use crate::ccsid::CcsidManager;
use crate::code_points::{
    CONTINUATION_BIT, CONTINUATION_SEGMENT_DATA, DSSCHAIN_SAME_ID, DSSFMT_OBJDSS, DSSFMT_RPYDSS,
    DSSFMT_RQSDSS, DSS_HEADER_LEN, DSS_ID, DSS_NOCHAIN, MAX_DSS_LENGTH,
};
use crate::decimal::pack_decimal;
use crate::error::{DrdaError, DrdaResult};
use crate::trace::{ComBufferTrace, TraceDirection};

/// Longest LD string sent to requesters that accept 2-byte lengths in full.
pub const MAX_LD_STRING_LENGTH: usize = 0xFFFF;
/// Longest LD string sent to older requesters.
pub const LEGACY_LD_STRING_LENGTH: usize = 32700;

/// DDM length field announcing a layer B stream: no extended length bytes,
/// the object runs to the end of its DSS.
const STREAMING_DDM_LENGTH: u16 = 0x8004;
/// Header bytes in front of the first segment of a streamed object.
const STREAM_HEADER_LEN: usize = DSS_HEADER_LEN + 4;

/// Result of an LD string that had to be cut to fit its length field.
///
/// Sizes are in characters, mirroring a JDBC `DataTruncation` warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdTruncation {
    pub data_size: usize,
    pub transfer_size: usize,
}

/// Number of extended length bytes needed for a DDM object of `ddm_size`
/// bytes. Zero means the 2-byte length field suffices.
///
/// Two-byte extended lengths are never produced; requesters expect at
/// least four.
pub fn calculate_extended_length_byte_count(ddm_size: u64) -> usize {
    if ddm_size <= 0x7FFF {
        0
    } else if ddm_size <= 0xFFFF_FFFF {
        4
    } else if ddm_size <= 0xFFFF_FFFF_FFFF {
        6
    } else if ddm_size <= i64::MAX as u64 {
        8
    } else {
        0
    }
}

/// Writer for DSS replies on one connection.
pub struct DdmWriter {
    buffer: MessageBuffer,
    /// Offsets of open DDM objects, innermost last.
    mark_stack: Vec<usize>,
    dss_length_location: usize,
    correlation_id: Option<u16>,
    next_correlation_id: u16,
    previous_corr_id: Option<u16>,
    previous_chain_byte: u8,
    is_continuation_dss: bool,
    /// Header of the last finalized DSS still in the buffer.
    prev_hdr_location: Option<usize>,
    last_dss_before_mark: Option<usize>,
    mark_depth_before_mark: usize,
    /// Correlation state (next id, previous id, previous chain byte) at the mark.
    correlation_before_mark: (u16, Option<u16>, u8),
    ccsid: CcsidManager,
    long_ld_strings: bool,
    stream_out_buffer_size: usize,
    total_byte_count: u64,
    trace: Option<Arc<dyn ComBufferTrace>>,
}

impl fmt::Debug for DdmWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DdmWriter")
            .field("position", &self.buffer.position())
            .field("capacity", &self.buffer.capacity())
            .field("open_ddms", &self.mark_stack.len())
            .field("dss_length_location", &self.dss_length_location)
            .field("correlation_id", &self.correlation_id)
            .field("next_correlation_id", &self.next_correlation_id)
            .field("previous_chain_byte", &self.previous_chain_byte)
            .field("prev_hdr_location", &self.prev_hdr_location)
            .field("ccsid", &self.ccsid)
            .field("total_byte_count", &self.total_byte_count)
            .finish_non_exhaustive()
    }
}

impl Default for DdmWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DdmWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a writer whose buffer starts at `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: MessageBuffer::with_capacity(capacity),
            mark_stack: Vec::with_capacity(8),
            dss_length_location: 0,
            correlation_id: None,
            next_correlation_id: 1,
            previous_corr_id: None,
            previous_chain_byte: DSS_NOCHAIN,
            is_continuation_dss: false,
            prev_hdr_location: None,
            last_dss_before_mark: None,
            mark_depth_before_mark: 0,
            correlation_before_mark: (1, None, DSS_NOCHAIN),
            ccsid: CcsidManager::default(),
            long_ld_strings: true,
            stream_out_buffer_size: 0,
            total_byte_count: 0,
            trace: None,
        }
    }

    /// Attach a trace sink receiving every byte range sent.
    pub fn set_trace(&mut self, trace: Option<Arc<dyn ComBufferTrace>>) {
        self.trace = trace;
    }

    /// Size of the extra buffer placed in front of the socket while
    /// streaming LOB data; 0 writes segments straight to the sink.
    pub fn set_stream_out_buffer_size(&mut self, size: usize) {
        self.stream_out_buffer_size = size;
    }

    /// Whether LD strings may use the full 2-byte length range.
    pub fn set_long_ld_strings(&mut self, enabled: bool) {
        self.long_ld_strings = enabled;
    }

    pub fn set_utf8_ccsid(&mut self) {
        self.ccsid = CcsidManager::Utf8;
    }

    pub fn set_ebcdic_ccsid(&mut self) {
        self.ccsid = CcsidManager::Ebcdic;
    }

    pub fn ccsid_manager(&self) -> CcsidManager {
        self.ccsid
    }

    /// Bytes successfully sent over the lifetime of the writer.
    pub fn total_byte_count(&self) -> u64 {
        self.total_byte_count
    }

    // ── buffer state ─────────────────────────────────────

    /// Reset for the next message.
    pub fn reset(&mut self) {
        self.clear_buffer();
    }

    /// Drop everything buffered along with open DDMs and the current DSS.
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.mark_stack.clear();
        self.dss_length_location = 0;
        self.correlation_id = None;
        self.next_correlation_id = 1;
    }

    /// Drop bytes already sent mid-chain. Correlation numbering carries on
    /// until the chain is flushed.
    fn discard_sent(&mut self) {
        self.buffer.clear();
        self.mark_stack.clear();
        self.dss_length_location = 0;
    }

    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    pub fn set_position(&mut self, position: usize) {
        self.buffer.set_position(position);
    }

    /// Copy of the buffered bytes from `start` to the cursor.
    pub fn buffer_contents(&self, start: usize) -> Vec<u8> {
        self.buffer.contents_from(start)
    }

    /// Whether anything is waiting to be sent.
    pub fn does_request_contain_data(&self) -> bool {
        self.buffer.position() != 0
    }

    /// Forget the last finalized DSS; called whenever the buffer is sent.
    pub fn reset_chain_state(&mut self) {
        self.prev_hdr_location = None;
    }

    // ── DSS framing ──────────────────────────────────────

    pub fn create_dss_reply(&mut self) {
        self.begin_dss(DSSFMT_RPYDSS);
    }

    /// Request DSSes are only written when acting as a requester, e.g. in tests.
    pub fn create_dss_request(&mut self) {
        self.begin_dss(DSSFMT_RQSDSS);
    }

    pub fn create_dss_object(&mut self) {
        self.begin_dss(DSSFMT_OBJDSS);
    }

    fn begin_dss(&mut self, dss_type: u8) {
        self.dss_length_location = self.buffer.position();
        self.buffer.ensure_capacity(DSS_HEADER_LEN);
        self.buffer.put_u16(0);
        self.buffer.put_u8(DSS_ID);
        self.buffer.put_u8(dss_type | DSSCHAIN_SAME_ID);
        let correlation_id = self.next_dss_correlation_id();
        self.correlation_id = Some(correlation_id);
        self.buffer.put_u16(correlation_id);
    }

    /// Same-ID chaining keeps the previous correlator, anything else takes
    /// the next one in sequence.
    fn next_dss_correlation_id(&mut self) -> u16 {
        match self.previous_corr_id {
            Some(previous) if self.previous_chain_byte == DSSCHAIN_SAME_ID => previous,
            _ => {
                let id = self.next_correlation_id;
                self.next_correlation_id = self.next_correlation_id.wrapping_add(1);
                id
            }
        }
    }

    pub fn end_dss(&mut self) {
        self.end_dss_finalizing(true);
    }

    /// End the DSS and replace its default chain bits with `chain_byte`.
    pub fn end_dss_with_chain(&mut self, chain_byte: u8) {
        self.end_dss_finalizing(true);
        self.override_chain_byte(self.dss_length_location + 3, chain_byte);
        self.previous_chain_byte = chain_byte;
    }

    fn end_dss_finalizing(&mut self, finalize_length: bool) {
        if finalize_length {
            self.finalize_dss_length();
        }
        // continuation segments carry no chaining information
        if self.is_continuation_dss {
            self.is_continuation_dss = false;
            return;
        }
        self.previous_corr_id = self.correlation_id;
        self.prev_hdr_location = Some(self.dss_length_location);
        self.previous_chain_byte = DSSCHAIN_SAME_ID;
    }

    pub fn end_ddm_and_dss(&mut self) {
        self.end_ddm();
        self.end_dss();
    }

    fn override_chain_byte(&mut self, offset: usize, chain_byte: u8) {
        let format = self.buffer.get_u8_at(offset) & 0x0F;
        self.buffer.put_u8_at(offset, format | chain_byte);
    }

    /// Flag the current DSS as continued by the DSS that follows it.
    ///
    /// LOB streams start with the flag already set. Only the first DSS of a
    /// continued sequence carries chaining state.
    pub fn mark_dss_as_continued(&mut self, for_lob: bool) {
        if !for_lob {
            self.buffer.or_u8_at(self.dss_length_location, 0x80);
        }
        if !self.is_continuation_dss {
            self.end_dss_finalizing(!for_lob);
        }
    }

    /// Patch the DSS length; split into continuation segments when the DSS
    /// exceeds 32767 bytes.
    fn finalize_dss_length(&mut self) {
        let offset = self.buffer.position();
        let total_size = offset - self.dss_length_location;
        let header = if total_size > MAX_DSS_LENGTH {
            let mut remaining = total_size - MAX_DSS_LENGTH;
            let header_count = remaining.div_ceil(CONTINUATION_SEGMENT_DATA);
            let mut shift = header_count * 2;
            self.buffer.ensure_capacity(shift);

            // Right to left: the k-th continuation segment moves k * 2 bytes.
            let mut segment_end = offset;
            let mut rightmost = true;
            while remaining > 0 {
                let mut chunk = remaining % CONTINUATION_SEGMENT_DATA;
                if chunk == 0 {
                    chunk = CONTINUATION_SEGMENT_DATA;
                }
                let start = segment_end - chunk;
                self.buffer.copy_within(start, chunk, start + shift);
                segment_end = start;

                let mut continuation_header = (chunk + 2) as u16;
                if !rightmost && continuation_header as usize == MAX_DSS_LENGTH {
                    continuation_header |= CONTINUATION_BIT;
                }
                rightmost = false;
                self.buffer.put_u16_at(start + shift - 2, continuation_header);

                remaining -= chunk;
                shift -= 2;
            }
            self.buffer.advance(header_count * 2);
            tracing::trace!(
                dss_length = total_size,
                continuation_headers = header_count,
                "Split DSS into continuation segments"
            );
            MAX_DSS_LENGTH as u16 | CONTINUATION_BIT
        } else {
            total_size as u16
        };
        self.buffer.put_u16_at(self.dss_length_location, header);
    }

    /// Close out the request's chain.
    ///
    /// Rewrites the chain bits of the last finalized DSS still in the buffer
    /// (if it was already sent, its chaining was settled then). When
    /// `chain_byte` ends the chain, everything buffered is sent.
    pub async fn finalize_chain<W>(&mut self, chain_byte: u8, sink: &mut W) -> DrdaResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if let Some(location) = self.prev_hdr_location {
            self.override_chain_byte(location + 3, chain_byte);
        }
        self.previous_chain_byte = chain_byte;

        if chain_byte != DSS_NOCHAIN {
            return Ok(());
        }

        self.reset_chain_state();
        if self.does_request_contain_data() {
            tracing::trace!(len = self.buffer.position(), "Sending reply chain");
            self.flush(sink).await?;
        }
        Ok(())
    }

    /// Write the buffer to `sink`, flush it and reset the writer.
    ///
    /// The buffer is reset even when the write fails.
    pub async fn flush<W>(&mut self, sink: &mut W) -> DrdaResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let length = self.buffer.position();
        let result = write_buffer(sink, self.buffer.as_slice(), true).await;
        self.trace_send("flush");
        self.reset();
        result.map_err(|source| DrdaError::CommunicationsFailure {
            context: "flush",
            source,
        })?;
        self.total_byte_count += length as u64;
        Ok(())
    }

    /// Send what is buffered without ending the chain.
    async fn send_bytes<W>(&mut self, sink: &mut W, flush_stream: bool) -> DrdaResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.reset_chain_state();
        let length = self.buffer.position();
        let result = write_buffer(sink, self.buffer.as_slice(), flush_stream).await;
        if result.is_ok() {
            self.total_byte_count += length as u64;
        }
        self.trace_send("stream");
        self.discard_sent();
        result.map_err(|source| DrdaError::CommunicationsFailure {
            context: "write_scalar_stream",
            source,
        })
    }

    fn trace_send(&self, label: &str) {
        if let Some(trace) = &self.trace {
            if trace.is_enabled() && self.buffer.position() > 0 {
                trace.record(TraceDirection::Send, label, self.buffer.as_slice());
            }
        }
    }

    // ── DDM objects ──────────────────────────────────────

    /// Open a DDM object; its length is patched by [`end_ddm`](Self::end_ddm).
    pub fn start_ddm(&mut self, code_point: u16) {
        self.mark_stack.push(self.buffer.position());
        self.buffer.ensure_capacity(4);
        self.buffer.put_u16(0);
        self.buffer.put_u16(code_point);
    }

    /// Discard the innermost open DDM and everything written into it.
    pub fn clear_ddm(&mut self) {
        debug_assert!(!self.mark_stack.is_empty(), "clear_ddm without start_ddm");
        match self.mark_stack.pop() {
            Some(location) => self.buffer.set_position(location),
            None => tracing::error!("clear_ddm called with no open DDM object"),
        }
    }

    /// Close the innermost open DDM, inserting extended length bytes when the
    /// object does not fit a 2-byte length.
    pub fn end_ddm(&mut self) {
        debug_assert!(!self.mark_stack.is_empty(), "end_ddm without start_ddm");
        let Some(location) = self.mark_stack.pop() else {
            tracing::error!("end_ddm called with no open DDM object");
            return;
        };
        let length = self.buffer.position() - location;
        let extended_count = calculate_extended_length_byte_count(length as u64);
        let field = if extended_count == 0 {
            length as u16
        } else {
            // the extended length excludes the 4-byte LLCP
            let extended_length = (length - 4) as u64;
            let extended_location = location + 4;
            self.buffer.shift_right(extended_location, extended_count);
            let bytes = extended_length.to_be_bytes();
            for (i, b) in bytes[8 - extended_count..].iter().enumerate() {
                self.buffer.put_u8_at(extended_location + i, *b);
            }
            (extended_count as u16 + 4) | CONTINUATION_BIT
        };
        self.buffer.put_u16_at(location, field);
    }

    // ── query block splitting ────────────────────────────

    /// Bytes written so far into the current DSS, header included.
    pub fn dss_length(&self) -> usize {
        self.buffer.position().saturating_sub(self.dss_length_location)
    }

    /// Copy of the current DSS from `start` (relative to the DSS) to the cursor.
    pub fn copy_dss_data_to_end(&self, start: usize) -> Vec<u8> {
        self.buffer.contents_from(self.dss_length_location + start)
    }

    /// Cut the current DSS down to `length` bytes.
    pub fn truncate_dss(&mut self, length: usize) {
        self.buffer.truncate_to(self.dss_length_location + length);
    }

    // ── error recovery ───────────────────────────────────

    /// Remember the current state so replies written after this point can be
    /// backed out with [`clear_dss_back_to_mark`](Self::clear_dss_back_to_mark).
    pub fn mark_dss_clear_point(&mut self) -> usize {
        self.last_dss_before_mark = self.prev_hdr_location;
        self.mark_depth_before_mark = self.mark_stack.len();
        self.correlation_before_mark = (
            self.next_correlation_id,
            self.previous_corr_id,
            self.previous_chain_byte,
        );
        self.buffer.position()
    }

    /// Drop everything written after `mark` and restore the chain and
    /// correlation state so the next DSS numbers as if nothing had been written.
    pub fn clear_dss_back_to_mark(&mut self, mark: usize) {
        self.buffer.set_position(mark);
        (self.next_correlation_id, self.previous_corr_id, self.previous_chain_byte) =
            self.correlation_before_mark;
        self.prev_hdr_location = self.last_dss_before_mark;
        self.mark_stack.truncate(self.mark_depth_before_mark);
        self.is_continuation_dss = false;
        // a DSS opened after the mark no longer exists
        if self.dss_length_location > mark {
            self.dss_length_location = mark;
        }
    }

    // ── primitives ───────────────────────────────────────

    pub fn write_byte(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn write_network_short(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    pub fn write_network_int(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    pub fn write_short(&mut self, value: i16) {
        self.buffer.put_u16(value as u16);
    }

    /// Boolean as a 2-byte 0/1.
    pub fn write_short_bool(&mut self, value: bool) {
        self.buffer.put_u16(u16::from(value));
    }

    pub fn write_int(&mut self, value: i32) {
        self.buffer.put_u32(value as u32);
    }

    pub fn write_long(&mut self, value: i64) {
        self.buffer.put_u64(value as u64);
    }

    pub fn write_float(&mut self, value: f32) {
        self.buffer.put_u32(value.to_bits());
    }

    pub fn write_double(&mut self, value: f64) {
        self.buffer.put_u64(value.to_bits());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.buffer.put_u8(u8::from(value));
    }

    pub fn write_short_ordered(&mut self, value: i16, order: ByteOrder) {
        self.buffer.put_u16_ordered(value as u16, order);
    }

    pub fn write_int_ordered(&mut self, value: i32, order: ByteOrder) {
        self.buffer.put_u32_ordered(value as u32, order);
    }

    pub fn write_long_ordered(&mut self, value: i64, order: ByteOrder) {
        self.buffer.put_u64_ordered(value as u64, order);
    }

    pub fn write_float_ordered(&mut self, value: f32, order: ByteOrder) {
        self.buffer.put_u32_ordered(value.to_bits(), order);
    }

    pub fn write_double_ordered(&mut self, value: f64, order: ByteOrder) {
        self.buffer.put_u64_ordered(value.to_bits(), order);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    /// 2-byte length followed by the bytes.
    pub fn write_ld_bytes(&mut self, data: &[u8]) {
        self.buffer.ensure_capacity(data.len() + 2);
        self.buffer.put_u16(data.len() as u16);
        self.buffer.put_slice(data);
    }

    pub fn write_code_point_4_bytes(&mut self, code_point: u16, value: u16) {
        self.buffer.ensure_capacity(4);
        self.buffer.put_u16(code_point);
        self.buffer.put_u16(value);
    }

    pub fn write_scalar_1_byte(&mut self, code_point: u16, value: u8) {
        self.buffer.ensure_capacity(5);
        self.buffer.put_u16(5);
        self.buffer.put_u16(code_point);
        self.buffer.put_u8(value);
    }

    pub fn write_scalar_2_bytes(&mut self, code_point: u16, value: u16) {
        self.buffer.ensure_capacity(6);
        self.buffer.put_u16(6);
        self.buffer.put_u16(code_point);
        self.buffer.put_u16(value);
    }

    /// Raw LLCP pair; `length` is written as given.
    pub fn write_length_code_point(&mut self, length: u16, code_point: u16) {
        self.buffer.ensure_capacity(4);
        self.buffer.put_u16(length);
        self.buffer.put_u16(code_point);
    }

    /// LLCP for a scalar of `data_length` bytes that the caller writes next.
    pub fn write_scalar_header(&mut self, code_point: u16, data_length: usize) {
        self.buffer.ensure_capacity(data_length + 4);
        self.buffer.put_u16((data_length + 4) as u16);
        self.buffer.put_u16(code_point);
    }

    /// Scalar holding `value` in the connection's CCSID.
    pub fn write_scalar_string(&mut self, code_point: u16, value: &str) {
        let length = self.ccsid.byte_length(value);
        self.write_scalar_header(code_point, length);
        self.ccsid.encode_into(value, &mut self.buffer);
    }

    /// Scalar holding `value` space-padded to `padded_length` bytes.
    pub fn write_scalar_padded_string(
        &mut self,
        code_point: u16,
        value: &str,
        padded_length: usize,
    ) {
        self.write_scalar_header(code_point, padded_length);
        self.write_padded_string(value, padded_length);
    }

    /// `value` in the connection's CCSID, space-padded to `padded_length`.
    pub fn write_padded_string(&mut self, value: &str, padded_length: usize) {
        let length = self.ccsid.byte_length(value);
        debug_assert!(length <= padded_length, "string longer than its padded field");
        self.ccsid.encode_into(value, &mut self.buffer);
        self.pad_bytes(self.ccsid.space(), padded_length.saturating_sub(length));
    }

    pub fn write_scalar_padded_bytes(
        &mut self,
        code_point: u16,
        data: &[u8],
        padded_length: usize,
        pad_byte: u8,
    ) {
        self.write_scalar_header(code_point, padded_length);
        self.write_padded_bytes(data, padded_length, pad_byte);
    }

    pub fn write_padded_bytes(&mut self, data: &[u8], padded_length: usize, pad_byte: u8) {
        debug_assert!(data.len() <= padded_length, "bytes longer than their padded field");
        self.buffer.put_slice(data);
        self.pad_bytes(pad_byte, padded_length.saturating_sub(data.len()));
    }

    pub fn write_scalar_bytes(&mut self, code_point: u16, data: &[u8]) {
        self.write_scalar_header(code_point, data.len());
        self.buffer.put_slice(data);
    }

    /// UTF-8 string, independent of the negotiated CCSID (FD:OCA data).
    pub fn write_string(&mut self, value: &str) {
        self.buffer.put_slice(value.as_bytes());
    }

    /// 2-byte length followed by the UTF-8 string.
    ///
    /// Strings over the length limit are cut on a character boundary and the
    /// returned [`LdTruncation`] describes what was dropped.
    pub fn write_ld_string(&mut self, value: &str) -> Option<LdTruncation> {
        let length_location = self.buffer.position();
        self.buffer.ensure_capacity(2);
        self.buffer.put_u16(0);
        let string_location = length_location + 2;
        self.write_string(value);

        let max_length = if self.long_ld_strings {
            MAX_LD_STRING_LENGTH
        } else {
            LEGACY_LD_STRING_LENGTH
        };

        let mut byte_length = self.buffer.position() - string_location;
        let mut truncation = None;
        if byte_length > max_length {
            byte_length = max_length;
            while is_continuation_byte(self.buffer.get_u8_at(string_location + byte_length)) {
                byte_length -= 1;
            }
            let truncated_chars = (string_location + byte_length..self.buffer.position())
                .filter(|&i| !is_continuation_byte(self.buffer.get_u8_at(i)))
                .count();
            self.buffer.set_position(string_location + byte_length);

            let data_size = value.chars().count();
            tracing::debug!(data_size, truncated_chars, "LD string truncated");
            truncation = Some(LdTruncation {
                data_size,
                transfer_size: data_size - truncated_chars,
            });
        }
        self.buffer.put_u16_at(length_location, byte_length as u16);
        truncation
    }

    /// Nullable string for newer protocol levels: a null indicator
    /// (0x00 present, 0xFF null) then a 4-byte length and UTF-8 bytes.
    pub fn write_nullable_ld_string(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.buffer.ensure_capacity(value.len() + 5);
                self.buffer.put_u8(0x00);
                self.buffer.put_u32(value.len() as u32);
                self.buffer.put_slice(value.as_bytes());
            }
            None => self.buffer.put_u8(0xFF),
        }
    }

    pub fn pad_bytes(&mut self, value: u8, length: usize) {
        self.buffer.fill(value, length);
    }

    /// Extended length announcement for a value of `size` bytes.
    pub fn write_extended_length(&mut self, size: i64) {
        let byte_count = calculate_extended_length_byte_count(size.max(0) as u64) as u32;
        if size > 0 {
            self.write_network_int(0x8000 | byte_count);
        } else {
            self.write_network_int(byte_count);
        }
    }

    /// Packed decimal DECIMAL(`precision`, `scale`). Nothing is written on error.
    pub fn write_big_decimal(
        &mut self,
        value: &Decimal,
        precision: u32,
        scale: u32,
    ) -> DrdaResult<()> {
        let packed = pack_decimal(value, precision, scale)?;
        self.buffer.put_slice(&packed);
        Ok(())
    }

    // ── LOB streaming ────────────────────────────────────

    /// Stream `source` as one DDM object (normally EXTDTA) in its own OBJDSS.
    ///
    /// Whatever is buffered is sent first. Full 32767-byte segments go out as
    /// soon as they fill; the final segment stays buffered until
    /// [`finalize_chain`](Self::finalize_chain). The DDM length is the layer B
    /// marker `0x8004`, so the object extends to the end of the DSS.
    pub async fn write_scalar_stream<R, W>(
        &mut self,
        chained_with_same_id: bool,
        code_point: u16,
        source: &mut R,
        write_null_byte: bool,
        sink: &mut W,
    ) -> DrdaResult<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let spare = self
            .prep_scalar_stream(chained_with_same_id, code_point, write_null_byte, sink)
            .await?;

        if self.stream_out_buffer_size > 0 {
            let mut out = BufWriter::with_capacity(self.stream_out_buffer_size, &mut *sink);
            self.stream_segments(source, spare, &mut out).await
        } else {
            self.stream_segments(source, spare, sink).await
        }
    }

    async fn prep_scalar_stream<W>(
        &mut self,
        chained_with_same_id: bool,
        code_point: u16,
        write_null_byte: bool,
        sink: &mut W,
    ) -> DrdaResult<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        // earlier DSSes are already finalized, they only need sending
        self.send_bytes(sink, true).await?;
        self.buffer.ensure_capacity(MAX_DSS_LENGTH);

        self.begin_stream_dss(chained_with_same_id, DSSFMT_OBJDSS);
        self.write_length_code_point(STREAMING_DDM_LENGTH, code_point);
        if write_null_byte {
            self.write_byte(0x00);
        }
        Ok(MAX_DSS_LENGTH - STREAM_HEADER_LEN - usize::from(write_null_byte))
    }

    fn begin_stream_dss(&mut self, chained_to_next: bool, dss_type: u8) {
        self.begin_dss(dss_type);
        // continuation flags default on; finalizing the length resets them
        self.buffer.put_u16_at(self.dss_length_location, 0xFFFF);
        let format = if chained_to_next {
            dss_type | DSSCHAIN_SAME_ID
        } else {
            dss_type
        };
        self.buffer.put_u8_at(self.dss_length_location + 3, format);
    }

    async fn stream_segments<R, W>(
        &mut self,
        source: &mut R,
        spare: usize,
        out: &mut W,
    ) -> DrdaResult<()>
    where
        R: AsyncBufRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let io_failure = |source| DrdaError::CommunicationsFailure {
            context: "write_scalar_stream",
            source,
        };

        let mut spare = spare;
        loop {
            let region = self.buffer.spare_mut(spare);
            let read = source.read(region).await.map_err(io_failure)?;
            self.buffer.advance(read);
            spare -= read;

            let last_segment = source.fill_buf().await.map_err(io_failure)?.is_empty();
            if last_segment || spare == 0 {
                self.flush_scalar_stream_segment(last_segment, out).await?;
                if last_segment {
                    break;
                }
                spare = CONTINUATION_SEGMENT_DATA;
            }
        }
        out.flush().await.map_err(io_failure)?;
        Ok(())
    }

    async fn flush_scalar_stream_segment<W>(
        &mut self,
        last_segment: bool,
        out: &mut W,
    ) -> DrdaResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if last_segment {
            self.end_dss();
            return Ok(());
        }
        self.mark_dss_as_continued(true);
        self.send_bytes(out, false).await?;

        // continuation header for the next segment
        self.dss_length_location = self.buffer.position();
        self.buffer.put_u16(0xFFFF);
        self.is_continuation_dss = true;
        Ok(())
    }
}

async fn write_buffer<W>(sink: &mut W, data: &[u8], flush: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    sink.write_all(data).await?;
    if flush {
        sink.flush().await?;
    }
    Ok(())
}

fn is_continuation_byte(b: u8) -> bool {
    b & 0xC0 == 0x80
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_points::*;
    use crate::reader::DssReader;
    use std::io;
    use std::pin::Pin;
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
    }

    /// One SYNTAXRM-shaped reply: DSS + DDM + three 2-byte scalars.
    fn write_three_scalar_reply(writer: &mut DdmWriter) {
        writer.create_dss_reply();
        writer.start_ddm(SYNTAXRM);
        writer.write_scalar_2_bytes(SVRCOD, SVRCOD_ERROR);
        writer.write_scalar_2_bytes(SYNERRCD, 0x0001);
        writer.write_scalar_2_bytes(CODPNT, EXCSAT);
        writer.end_ddm_and_dss();
    }

    #[tokio::test]
    async fn three_scalar_reply_end_to_end() {
        let mut writer = DdmWriter::new();
        write_three_scalar_reply(&mut writer);
        assert_eq!(writer.dss_length(), 28);

        let mut sink = Vec::new();
        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();

        assert_eq!(sink.len(), 6 + 4 + 18);
        assert_eq!(&sink[..6], &[0x00, 0x1C, 0xD0, 0x02, 0x00, 0x01]);
        assert_eq!(&sink[6..10], &[0x00, 0x16, 0x12, 0x4C]);
        assert_eq!(&sink[10..16], &[0x00, 0x06, 0x11, 0x49, 0x00, 0x08]);
        assert_eq!(writer.total_byte_count(), 28);
        assert_eq!(writer.position(), 0);
        assert!(!writer.does_request_contain_data());
    }

    #[test]
    fn ddm_length_boundaries() {
        for (length, expected) in [(0x7FFE_usize, 0x7FFE_u16), (0x7FFF, 0x7FFF)] {
            let mut writer = DdmWriter::new();
            writer.start_ddm(QRYDTA);
            writer.write_bytes(&vec![0xAB; length - 4]);
            writer.end_ddm();
            let bytes = writer.buffer_contents(0);
            assert_eq!(bytes.len(), length);
            assert_eq!(u16_at(&bytes, 0), expected);
            assert_eq!(u16_at(&bytes, 2), QRYDTA);
        }
    }

    #[test]
    fn ddm_extended_length_inserted() {
        let mut writer = DdmWriter::new();
        writer.start_ddm(QRYDTA);
        let payload: Vec<u8> = (0..0x8000 - 4).map(|i| i as u8).collect();
        writer.write_bytes(&payload);
        writer.end_ddm();

        let bytes = writer.buffer_contents(0);
        assert_eq!(bytes.len(), 0x8000 + 4);
        assert_eq!(u16_at(&bytes, 0), 0x8008);
        assert_eq!(u16_at(&bytes, 2), QRYDTA);
        assert_eq!(&bytes[4..8], &0x7FFC_u32.to_be_bytes());
        assert_eq!(&bytes[8..], &payload[..]);
    }

    #[test]
    fn nested_ddm_lengths() {
        let mut writer = DdmWriter::new();
        writer.start_ddm(EXCSATRD);
        writer.start_ddm(MGRLVLLS);
        writer.write_code_point_4_bytes(AGENT, 7);
        writer.end_ddm();
        writer.write_scalar_string(SRVNAM, "DB");
        writer.end_ddm();
        let bytes = writer.buffer_contents(0);
        assert_eq!(u16_at(&bytes, 0) as usize, bytes.len());
        assert_eq!(u16_at(&bytes, 4), 8);
        assert_eq!(&bytes[12..], &[0x00, 0x06, 0x11, 0x6D, 0xC4, 0xC2]);
    }

    #[test]
    fn extended_length_byte_count_thresholds() {
        assert_eq!(calculate_extended_length_byte_count(0x7FFF), 0);
        assert_eq!(calculate_extended_length_byte_count(0x8000), 4);
        assert_eq!(calculate_extended_length_byte_count(0xFFFF_FFFF), 4);
        assert_eq!(calculate_extended_length_byte_count(0x1_0000_0000), 6);
        assert_eq!(calculate_extended_length_byte_count(0xFFFF_FFFF_FFFF), 6);
        assert_eq!(calculate_extended_length_byte_count(0x1_0000_0000_0000), 8);
        assert_eq!(calculate_extended_length_byte_count(i64::MAX as u64), 8);
    }

    #[test]
    fn continuation_split_70000() {
        let mut writer = DdmWriter::new();
        writer.create_dss_reply();
        let data: Vec<u8> = (0..69_994u32).map(|i| (i % 251) as u8).collect();
        writer.write_bytes(&data);
        writer.end_dss();

        let bytes = writer.buffer_contents(0);
        assert_eq!(bytes.len(), 70_004);
        assert_eq!(u16_at(&bytes, 0), 0xFFFF);
        assert_eq!(u16_at(&bytes, 32_767), 0xFFFF);
        assert_eq!(u16_at(&bytes, 32_767 + 32_767), 4_470);

        // strip the two continuation headers and compare the data
        let mut reassembled = bytes[6..32_767].to_vec();
        reassembled.extend_from_slice(&bytes[32_769..65_534]);
        reassembled.extend_from_slice(&bytes[65_536..]);
        assert_eq!(reassembled, data);
    }

    #[test]
    fn continuation_boundary() {
        let mut writer = DdmWriter::new();
        writer.create_dss_object();
        writer.write_bytes(&vec![1; MAX_DSS_LENGTH - 6]);
        writer.end_dss();
        assert_eq!(writer.position(), MAX_DSS_LENGTH);
        assert_eq!(u16_at(&writer.buffer_contents(0), 0), 0x7FFF);

        let mut writer = DdmWriter::new();
        writer.create_dss_object();
        writer.write_bytes(&vec![1; MAX_DSS_LENGTH - 5]);
        writer.end_dss();
        let bytes = writer.buffer_contents(0);
        assert_eq!(bytes.len(), MAX_DSS_LENGTH + 3);
        assert_eq!(u16_at(&bytes, 0), 0xFFFF);
        assert_eq!(u16_at(&bytes, MAX_DSS_LENGTH), 3);
    }

    #[tokio::test]
    async fn chained_requests_share_and_advance_correlators() {
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();

        // request 1: reply + object with the same correlator, chained onward
        writer.create_dss_reply();
        writer.write_scalar_2_bytes(SVRCOD, 0);
        writer.end_dss();
        writer.create_dss_object();
        writer.write_scalar_2_bytes(SVRCOD, 0);
        writer.end_dss();
        writer.finalize_chain(DSSCHAIN, &mut sink).await.unwrap();
        assert!(sink.is_empty());

        // request 2 ends the chain
        writer.create_dss_reply();
        writer.write_scalar_2_bytes(SVRCOD, 0);
        writer.end_dss();
        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();

        assert_eq!(sink.len(), 36);
        assert_eq!(&sink[2..6], &[0xD0, 0x52, 0x00, 0x01]);
        assert_eq!(&sink[14..18], &[0xD0, 0x43, 0x00, 0x01]);
        assert_eq!(&sink[26..30], &[0xD0, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn end_dss_with_chain_overrides_low_nibble_preserved() {
        let mut writer = DdmWriter::new();
        writer.create_dss_request();
        writer.write_scalar_2_bytes(SVRCOD, 0);
        writer.end_dss_with_chain(DSSCHAIN);
        writer.create_dss_request();
        writer.end_dss_with_chain(DSS_NOCHAIN);
        let bytes = writer.buffer_contents(0);
        assert_eq!(bytes[3], 0x41);
        assert_eq!(&bytes[12..], &[0x00, 0x06, 0xD0, 0x01, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn clear_back_to_mark_matches_direct_output() {
        let mut direct = DdmWriter::new();
        write_three_scalar_reply(&mut direct);
        direct.create_dss_object();
        direct.write_scalar_string(SRVNAM, "OK");
        direct.end_dss();
        let mut expected = Vec::new();
        direct.finalize_chain(DSS_NOCHAIN, &mut expected).await.unwrap();

        let mut recovered = DdmWriter::new();
        write_three_scalar_reply(&mut recovered);
        let mark = recovered.mark_dss_clear_point();
        recovered.create_dss_reply();
        recovered.start_ddm(SQLCARD);
        recovered.write_bytes(&[0u8; 40_000]);
        recovered.end_ddm_and_dss();
        recovered.create_dss_object();
        recovered.start_ddm(QRYDTA);
        recovered.clear_dss_back_to_mark(mark);

        recovered.create_dss_object();
        recovered.write_scalar_string(SRVNAM, "OK");
        recovered.end_dss();
        let mut actual = Vec::new();
        recovered.finalize_chain(DSS_NOCHAIN, &mut actual).await.unwrap();

        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn clear_back_to_mark_on_empty_buffer_restarts_correlators() {
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();
        let mark = writer.mark_dss_clear_point();
        writer.create_dss_reply();
        writer.end_dss();
        writer.create_dss_object();
        writer.start_ddm(SQLCARD);
        writer.clear_dss_back_to_mark(mark);

        write_three_scalar_reply(&mut writer);
        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();
        assert_eq!(&sink[..6], &[0x00, 0x1C, 0xD0, 0x02, 0x00, 0x01]);
        assert_eq!(sink.len(), 28);
    }

    async fn mixed_workload(capacity: usize) -> Vec<u8> {
        let mut writer = DdmWriter::with_capacity(capacity);
        let mut sink = Vec::new();
        write_three_scalar_reply(&mut writer);
        writer.create_dss_object();
        writer.start_ddm(QRYDTA);
        writer.write_bytes(&vec![0x5A; 100_000]);
        writer.end_ddm_and_dss();
        writer.finalize_chain(DSSCHAIN, &mut sink).await.unwrap();
        writer.create_dss_reply();
        writer.write_scalar_padded_string(SRVNAM, "SERVER", 18);
        writer.write_ld_string("h\u{e9}llo");
        writer.end_dss();
        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();
        sink
    }

    #[tokio::test]
    async fn output_independent_of_initial_capacity() {
        let reference = mixed_workload(DEFAULT_BUFFER_SIZE).await;
        assert_eq!(mixed_workload(16).await, reference);
        assert_eq!(mixed_workload(1024).await, reference);
    }

    #[test]
    fn ccsid_swap_leaves_written_bytes_alone() {
        let mut writer = DdmWriter::new();
        writer.write_scalar_string(SRVNAM, "\u{e9}A");
        let before = writer.buffer_contents(0);
        assert_eq!(before, vec![0x00, 0x06, 0x11, 0x6D, 0x51, 0xC1]);

        writer.set_utf8_ccsid();
        writer.write_scalar_string(SRVNAM, "\u{e9}A");
        let after = writer.buffer_contents(0);
        assert_eq!(&after[..6], &before[..]);
        assert_eq!(&after[6..], &[0x00, 0x07, 0x11, 0x6D, 0xC3, 0xA9, 0x41]);
        assert_eq!(writer.ccsid_manager(), CcsidManager::Utf8);

        writer.set_ebcdic_ccsid();
        assert_eq!(writer.ccsid_manager(), CcsidManager::Ebcdic);
    }

    #[tokio::test]
    async fn stream_splits_into_segments() {
        let data: Vec<u8> = (0..70_000u32).map(|i| (i % 253) as u8).collect();
        let mut source: &[u8] = &data;
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();

        writer
            .write_scalar_stream(false, EXTDTA, &mut source, true, &mut sink)
            .await
            .unwrap();
        // two full segments sent eagerly, the last one waits for the chain end
        assert_eq!(sink.len(), 2 * MAX_DSS_LENGTH);
        assert_eq!(writer.position(), 2 + 4_479);

        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();
        assert_eq!(
            &sink[..11],
            &[0xFF, 0xFF, 0xD0, 0x03, 0x00, 0x01, 0x80, 0x04, 0x14, 0x6C, 0x00]
        );
        assert_eq!(u16_at(&sink, MAX_DSS_LENGTH), 0xFFFF);
        assert_eq!(u16_at(&sink, 2 * MAX_DSS_LENGTH), 4_481);

        let mut reassembled = sink[11..MAX_DSS_LENGTH].to_vec();
        reassembled.extend_from_slice(&sink[MAX_DSS_LENGTH + 2..2 * MAX_DSS_LENGTH]);
        reassembled.extend_from_slice(&sink[2 * MAX_DSS_LENGTH + 2..]);
        assert_eq!(reassembled, data);
        assert_eq!(writer.total_byte_count(), sink.len() as u64);
    }

    #[tokio::test]
    async fn small_stream_stays_in_one_dss() {
        let mut source: &[u8] = b"0123456789";
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();

        writer
            .write_scalar_stream(true, EXTDTA, &mut source, true, &mut sink)
            .await
            .unwrap();
        assert!(sink.is_empty());
        assert_eq!(writer.buffer_contents(0)[3], 0x53);

        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();
        assert_eq!(
            &sink[..11],
            &[0x00, 0x15, 0xD0, 0x03, 0x00, 0x01, 0x80, 0x04, 0x14, 0x6C, 0x00]
        );
        assert_eq!(&sink[11..], b"0123456789");
    }

    #[tokio::test]
    async fn stream_sends_pending_replies_first() {
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();
        write_three_scalar_reply(&mut writer);
        let data = vec![7u8; 40_000];
        let mut source: &[u8] = &data;
        writer
            .write_scalar_stream(false, EXTDTA, &mut source, false, &mut sink)
            .await
            .unwrap();

        // reply went out with its default chain bits; the stream got corr 1 again
        assert_eq!(&sink[..6], &[0x00, 0x1C, 0xD0, 0x52, 0x00, 0x01]);
        assert_eq!(&sink[28..34], &[0xFF, 0xFF, 0xD0, 0x03, 0x00, 0x01]);
        assert_eq!(sink.len(), 28 + MAX_DSS_LENGTH);
    }

    #[tokio::test]
    async fn finalize_chain_after_eager_send_has_no_header_to_patch() {
        let data = vec![1u8; 50_000];
        let mut source: &[u8] = &data;
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();
        writer
            .write_scalar_stream(false, EXTDTA, &mut source, false, &mut sink)
            .await
            .unwrap();
        let pending = writer.buffer_contents(0);

        writer.finalize_chain(DSSCHAIN, &mut sink).await.unwrap();
        // the buffered continuation segment has no format byte to rewrite
        assert_eq!(writer.buffer_contents(0), pending);
    }

    #[tokio::test]
    async fn next_reply_after_stream_takes_next_correlator() {
        let data = vec![9u8; 100];
        let mut source: &[u8] = &data;
        let mut writer = DdmWriter::new();
        let mut sink = Vec::new();
        write_three_scalar_reply(&mut writer);
        writer
            .write_scalar_stream(false, EXTDTA, &mut source, false, &mut sink)
            .await
            .unwrap();
        writer.finalize_chain(DSSCHAIN, &mut sink).await.unwrap();
        write_three_scalar_reply(&mut writer);
        writer.finalize_chain(DSS_NOCHAIN, &mut sink).await.unwrap();

        let mut input = &sink[..];
        let mut reader = DssReader::for_replies();
        let mut correlators = Vec::new();
        while !input.is_empty() {
            correlators.push(reader.read_dss(&mut input).await.unwrap().correlation_id);
        }
        assert_eq!(correlators, vec![1, 1, 2]);
    }

    #[test]
    fn clear_back_to_mark_drops_dss_opened_after_mark() {
        let mut writer = DdmWriter::new();
        let mark = writer.mark_dss_clear_point();
        write_three_scalar_reply(&mut writer);
        writer.create_dss_object();
        writer.start_ddm(SQLCARD);
        writer.write_int(-1);
        writer.clear_dss_back_to_mark(mark);
        assert_eq!(writer.position(), 0);
        assert_eq!(writer.dss_length(), 0);
    }

    #[tokio::test]
    async fn stream_out_buffer_produces_same_bytes() {
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();

        let mut plain = Vec::new();
        let mut writer = DdmWriter::new();
        let mut source: &[u8] = &data;
        writer
            .write_scalar_stream(false, EXTDTA, &mut source, false, &mut plain)
            .await
            .unwrap();
        writer.finalize_chain(DSS_NOCHAIN, &mut plain).await.unwrap();

        let mut buffered = Vec::new();
        let mut writer = DdmWriter::new();
        writer.set_stream_out_buffer_size(4096);
        let mut source: &[u8] = &data;
        writer
            .write_scalar_stream(false, EXTDTA, &mut source, false, &mut buffered)
            .await
            .unwrap();
        writer.finalize_chain(DSS_NOCHAIN, &mut buffered).await.unwrap();

        assert_eq!(plain, buffered);
    }

    #[test]
    fn ld_string_truncates_on_char_boundary() {
        let mut writer = DdmWriter::new();
        let value = "\u{e9}".repeat(40_000);
        let truncation = writer.write_ld_string(&value).unwrap();
        assert_eq!(u16_at(&writer.buffer_contents(0), 0), 65_534);
        assert_eq!(writer.position(), 65_536);
        assert_eq!(
            truncation,
            LdTruncation {
                data_size: 40_000,
                transfer_size: 32_767
            }
        );

        let mut legacy = DdmWriter::new();
        legacy.set_long_ld_strings(false);
        legacy.write_ld_string(&value);
        assert_eq!(u16_at(&legacy.buffer_contents(0), 0), 32_700);

        let mut short = DdmWriter::new();
        assert!(short.write_ld_string("abc").is_none());
        assert_eq!(short.buffer_contents(0), vec![0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn nullable_ld_string() {
        let mut writer = DdmWriter::new();
        writer.write_nullable_ld_string(Some("ab"));
        writer.write_nullable_ld_string(None);
        assert_eq!(writer.buffer_contents(0), vec![0x00, 0, 0, 0, 2, b'a', b'b', 0xFF]);
    }

    #[test]
    fn fixed_width_primitives() {
        let mut writer = DdmWriter::new();
        writer.write_float(1.0);
        writer.write_double_ordered(1.0, ByteOrder::LittleEndian);
        writer.write_short(-2);
        writer.write_short_bool(true);
        writer.write_boolean(false);
        writer.write_long(1);
        writer.write_int_ordered(1, ByteOrder::LittleEndian);
        let bytes = writer.buffer_contents(0);
        assert_eq!(&bytes[..4], &[0x3F, 0x80, 0x00, 0x00]);
        assert_eq!(&bytes[4..12], &[0, 0, 0, 0, 0, 0, 0xF0, 0x3F]);
        assert_eq!(&bytes[12..17], &[0xFF, 0xFE, 0x00, 0x01, 0x00]);
        assert_eq!(&bytes[17..25], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[25..], &[1, 0, 0, 0]);
    }

    #[test]
    fn padded_and_scalar_helpers() {
        let mut writer = DdmWriter::new();
        writer.write_scalar_padded_bytes(RDBNAM, b"AB", 4, 0x40);
        writer.write_scalar_1_byte(SYNERRCD, 0x0E);
        writer.write_ld_bytes(&[9, 9]);
        writer.write_extended_length(0x8000);
        writer.write_extended_length(0);
        assert_eq!(
            writer.buffer_contents(0),
            vec![
                0x00, 0x08, 0x21, 0x10, b'A', b'B', 0x40, 0x40, //
                0x00, 0x05, 0x11, 0x4A, 0x0E, //
                0x00, 0x02, 9, 9, //
                0x00, 0x00, 0x80, 0x04, //
                0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn big_decimal_written_packed() {
        let mut writer = DdmWriter::new();
        writer
            .write_big_decimal(&Decimal::from_str("-7.25").unwrap(), 5, 2)
            .unwrap();
        assert_eq!(writer.buffer_contents(0), vec![0x00, 0x72, 0x5D]);

        let err = writer
            .write_big_decimal(&Decimal::from_str("100").unwrap(), 3, 2)
            .unwrap_err();
        assert!(matches!(err, DrdaError::Decimal { sqlstate: "22003", .. }));
        assert_eq!(writer.position(), 3);
    }

    #[test]
    fn copy_and_truncate_current_dss() {
        let mut writer = DdmWriter::new();
        write_three_scalar_reply(&mut writer);
        writer.create_dss_object();
        writer.write_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(writer.dss_length(), 11);
        assert_eq!(writer.copy_dss_data_to_end(8), vec![3, 4, 5]);
        writer.truncate_dss(8);
        assert_eq!(writer.dss_length(), 8);
        assert_eq!(writer.position(), 36);
    }

    #[test]
    fn clear_ddm_discards_innermost_object() {
        let mut writer = DdmWriter::new();
        writer.start_ddm(EXCSATRD);
        writer.write_scalar_2_bytes(SVRCOD, 0);
        writer.start_ddm(MGRLVLLS);
        writer.write_code_point_4_bytes(AGENT, 7);
        writer.clear_ddm();
        writer.end_ddm();
        assert_eq!(
            writer.buffer_contents(0),
            vec![0x00, 0x0A, 0x14, 0x43, 0x00, 0x06, 0x11, 0x49, 0x00, 0x00]
        );
    }

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_flush_is_a_communications_failure() {
        let mut writer = DdmWriter::new();
        write_three_scalar_reply(&mut writer);
        let err = writer
            .finalize_chain(DSS_NOCHAIN, &mut BrokenPipe)
            .await
            .unwrap_err();
        assert!(matches!(err, DrdaError::CommunicationsFailure { context: "flush", .. }));
        assert!(err.is_fatal());
        assert_eq!(writer.position(), 0);
        assert_eq!(writer.total_byte_count(), 0);
    }

    #[derive(Default)]
    struct RecordingTrace(Mutex<Vec<(String, usize)>>);

    impl ComBufferTrace for RecordingTrace {
        fn record(&self, direction: TraceDirection, label: &str, data: &[u8]) {
            assert_eq!(direction, TraceDirection::Send);
            self.0.lock().unwrap().push((label.to_string(), data.len()));
        }
    }

    #[tokio::test]
    async fn trace_sees_every_flush() {
        let trace = Arc::new(RecordingTrace::default());
        let mut writer = DdmWriter::new();
        writer.set_trace(Some(trace.clone()));
        write_three_scalar_reply(&mut writer);
        writer.finalize_chain(DSS_NOCHAIN, &mut Vec::<u8>::new()).await.unwrap();
        assert_eq!(*trace.0.lock().unwrap(), vec![("flush".to_string(), 28)]);
    }
}
