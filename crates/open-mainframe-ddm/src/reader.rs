//! Inbound DSS framing.
//!
//! Every DRDA message is wrapped in one or more DSS segments. Each segment has
//! a 6-byte header followed by payload data (DDM objects).
//!
//! ```text
//! Offset  Len  Field
//! 0       2    Length incl. header; top bit set = continued (32767 bytes)
//! 2       1    Magic byte: 0xD0
//! 3       1    Format: chain bits high nibble, DSS type low nibble
//! 4       2    Correlation ID (big-endian)
//! ```
//!
//! A continued DSS is followed by continuation segments `[len:2] data`,
//! which [`DssReader::read_dss`] folds back into one payload.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ccsid::CcsidManager;
use crate::code_points::*;
use crate::error::{DrdaError, DrdaResult};
use crate::trace::{hex_preview, ComBufferTrace, TraceDirection};

/// A DSS with its continuation segments reassembled.
#[derive(Debug, Clone)]
pub struct DssSegment {
    /// Raw format byte: chain flags and type.
    pub format: u8,
    /// Correlation ID.
    pub correlation_id: u16,
    /// Payload bytes (DDM objects).
    pub payload: BytesMut,
}

impl DssSegment {
    /// DSS type (request=1, reply=2, object=3, communication=4).
    pub fn dss_type(&self) -> u8 {
        self.format & 0x0F
    }

    /// Whether more DSSes follow in the chain.
    pub fn chained(&self) -> bool {
        self.format & DSSCHAIN == DSSCHAIN
    }

    /// Whether the next chained DSS has the same correlation ID.
    pub fn same_correlator(&self) -> bool {
        self.format & DSSCHAIN_SAME_ID == DSSCHAIN_SAME_ID
    }

    /// Whether the chain continues after an error in this DSS.
    pub fn continue_on_error(&self) -> bool {
        self.format & DSSCHAIN_ERROR_CONTINUE != 0
    }
}

/// Which side of the conversation the reader is parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderMode {
    /// Server side: only RQSDSS and OBJDSS, full chain validation.
    Requests,
    /// Requester side: any DSS type, no chain validation.
    Replies,
}

/// Reads DSSes off a byte stream and tracks the chain state of the last one.
pub struct DssReader {
    mode: ReaderMode,
    ccsid: CcsidManager,
    chained_with_same_id: bool,
    chained_with_diff_id: bool,
    terminate_chain_on_err: bool,
    prev_correlation_id: Option<u16>,
    total_byte_count: u64,
    trace: Option<Arc<dyn ComBufferTrace>>,
}

impl std::fmt::Debug for DssReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssReader")
            .field("mode", &self.mode)
            .field("ccsid", &self.ccsid)
            .field("chain_state", &self.current_chain_state())
            .field("prev_correlation_id", &self.prev_correlation_id)
            .finish_non_exhaustive()
    }
}

impl Default for DssReader {
    fn default() -> Self {
        Self::new()
    }
}

impl DssReader {
    /// Reader for the server side of a connection.
    pub fn new() -> Self {
        Self::with_mode(ReaderMode::Requests)
    }

    /// Reader accepting reply DSSes, for requesters and for checking writer output.
    pub fn for_replies() -> Self {
        Self::with_mode(ReaderMode::Replies)
    }

    fn with_mode(mode: ReaderMode) -> Self {
        Self {
            mode,
            ccsid: CcsidManager::default(),
            chained_with_same_id: false,
            chained_with_diff_id: false,
            terminate_chain_on_err: true,
            prev_correlation_id: None,
            total_byte_count: 0,
            trace: None,
        }
    }

    pub fn set_trace(&mut self, trace: Option<Arc<dyn ComBufferTrace>>) {
        self.trace = trace;
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

    /// Bytes read over the lifetime of the reader.
    pub fn total_byte_count(&self) -> u64 {
        self.total_byte_count
    }

    pub fn is_chained_with_same_id(&self) -> bool {
        self.chained_with_same_id
    }

    pub fn is_chained_with_diff_id(&self) -> bool {
        self.chained_with_diff_id
    }

    /// Whether an error in the current DSS ends the rest of the chain.
    pub fn terminate_chain_on_err(&self) -> bool {
        self.terminate_chain_on_err
    }

    /// Chain byte describing the last DSS read, as passed to
    /// [`DdmWriter::finalize_chain`](crate::writer::DdmWriter::finalize_chain).
    pub fn current_chain_state(&self) -> u8 {
        if self.chained_with_same_id {
            DSSCHAIN_SAME_ID
        } else if self.chained_with_diff_id {
            DSSCHAIN
        } else {
            DSS_NOCHAIN
        }
    }

    /// Read one DSS, including any continuation segments.
    ///
    /// End of stream before the first header byte is
    /// [`DrdaError::ConnectionClosed`].
    pub async fn read_dss<R>(&mut self, input: &mut R) -> DrdaResult<DssSegment>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; DSS_HEADER_LEN];
        match input.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(DrdaError::ConnectionClosed);
            }
            Err(e) => return Err(DrdaError::Io(e)),
        }

        let raw_length = u16::from_be_bytes([header[0], header[1]]);
        let (length, mut continued) = split_length(raw_length);
        if length < DSS_HEADER_LEN {
            return Err(DrdaError::syntax(SYNERRCD_DSS_LESS_THAN_6));
        }
        if header[2] != DSS_ID {
            return Err(DrdaError::syntax(SYNERRCD_CBYTE_NOT_D0));
        }
        let format = header[3];
        let correlation_id = u16::from_be_bytes([header[4], header[5]]);
        self.check_format(format, correlation_id)?;

        let mut payload = BytesMut::new();
        read_into(input, &mut payload, length - DSS_HEADER_LEN).await?;
        while continued {
            let mut continuation = [0u8; 2];
            input.read_exact(&mut continuation).await?;
            let (segment_length, more) = split_length(u16::from_be_bytes(continuation));
            if segment_length <= 2 {
                return Err(DrdaError::syntax(SYNERRCD_DSS_CONT_LESS_OR_EQUAL_2));
            }
            read_into(input, &mut payload, segment_length - 2).await?;
            continued = more;
        }

        let segment = DssSegment {
            format,
            correlation_id,
            payload,
        };
        self.total_byte_count += (DSS_HEADER_LEN + segment.payload.len()) as u64;
        tracing::debug!(
            dss_type = segment.dss_type(),
            chained = segment.chained(),
            same_correlator = segment.same_correlator(),
            corr_id = correlation_id,
            payload_len = segment.payload.len(),
            payload_hex = %hex_preview(&segment.payload, 64),
            "DRDA recv DSS"
        );
        if let Some(trace) = &self.trace {
            if trace.is_enabled() {
                trace.record(TraceDirection::Receive, "read", &segment.payload);
            }
        }
        Ok(segment)
    }

    fn check_format(&mut self, format: u8, correlation_id: u16) -> DrdaResult<()> {
        let requests = self.mode == ReaderMode::Requests;
        let dss_type = format & 0x0F;
        if requests && dss_type != DSSFMT_RQSDSS && dss_type != DSSFMT_OBJDSS {
            return Err(DrdaError::syntax(SYNERRCD_FBYTE_NOT_SUPPORTED));
        }

        if format & DSSCHAIN == DSSCHAIN {
            self.chained_with_same_id = format & DSSCHAIN_SAME_ID == DSSCHAIN_SAME_ID;
            self.chained_with_diff_id = !self.chained_with_same_id;
            self.terminate_chain_on_err = format & DSSCHAIN_ERROR_CONTINUE == 0;
        } else {
            if requests && format & (DSSCHAIN_SAME_ID & !DSSCHAIN) != 0 {
                return Err(DrdaError::syntax(SYNERRCD_CHAIN_OFF_SAME_NEXT_CORRELATOR));
            }
            if requests && format & DSSCHAIN_ERROR_CONTINUE != 0 {
                return Err(DrdaError::syntax(SYNERRCD_CHAIN_OFF_ERROR_CONTINUE));
            }
            self.chained_with_same_id = false;
            self.chained_with_diff_id = false;
            self.terminate_chain_on_err = true;
        }

        if requests {
            if let Some(previous) = self.prev_correlation_id {
                if previous != correlation_id {
                    return Err(DrdaError::syntax(SYNERRCD_CORRELATOR_MISMATCH));
                }
            }
        }
        self.prev_correlation_id = self.chained_with_same_id.then_some(correlation_id);
        Ok(())
    }
}

/// Decode a DSS or continuation length field.
fn split_length(raw: u16) -> (usize, bool) {
    if raw & CONTINUATION_BIT == CONTINUATION_BIT {
        (MAX_DSS_LENGTH, true)
    } else {
        (raw as usize, false)
    }
}

async fn read_into<R>(input: &mut R, payload: &mut BytesMut, len: usize) -> DrdaResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let start = payload.len();
    payload.resize(start + len, 0);
    input.read_exact(&mut payload[start..]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DdmWriter;

    fn header(length: u16, format: u8, corr: u16) -> Vec<u8> {
        let mut bytes = length.to_be_bytes().to_vec();
        bytes.push(DSS_ID);
        bytes.push(format);
        bytes.extend_from_slice(&corr.to_be_bytes());
        bytes
    }

    async fn read_one(bytes: &[u8]) -> DrdaResult<DssSegment> {
        let mut input = bytes;
        DssReader::new().read_dss(&mut input).await
    }

    fn syntax_code(result: DrdaResult<DssSegment>) -> u8 {
        match result {
            Err(DrdaError::Syntax { code, .. }) => code,
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reads_simple_request() {
        let mut bytes = header(10, 0x01, 1);
        bytes.extend_from_slice(&[0x00, 0x04, 0x10, 0x41]);
        let dss = read_one(&bytes).await.unwrap();
        assert_eq!(dss.dss_type(), DSSFMT_RQSDSS);
        assert!(!dss.chained());
        assert_eq!(dss.correlation_id, 1);
        assert_eq!(&dss.payload[..], &[0x00, 0x04, 0x10, 0x41]);
    }

    #[tokio::test]
    async fn eof_before_header_is_connection_closed() {
        assert!(matches!(read_one(&[]).await, Err(DrdaError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn header_validation_codes() {
        assert_eq!(syntax_code(read_one(&header(5, 0x01, 1)).await), SYNERRCD_DSS_LESS_THAN_6);

        let mut bad_magic = header(6, 0x01, 1);
        bad_magic[2] = 0xD1;
        assert_eq!(syntax_code(read_one(&bad_magic).await), SYNERRCD_CBYTE_NOT_D0);

        assert_eq!(syntax_code(read_one(&header(6, 0x02, 1)).await), SYNERRCD_FBYTE_NOT_SUPPORTED);
        assert_eq!(
            syntax_code(read_one(&header(6, 0x11, 1)).await),
            SYNERRCD_CHAIN_OFF_SAME_NEXT_CORRELATOR
        );
        assert_eq!(
            syntax_code(read_one(&header(6, 0x21, 1)).await),
            SYNERRCD_CHAIN_OFF_ERROR_CONTINUE
        );
    }

    #[tokio::test]
    async fn same_id_chain_requires_matching_correlator() {
        let mut bytes = header(6, 0x51, 3);
        bytes.extend(header(6, 0x03, 4));
        let mut input = &bytes[..];
        let mut reader = DssReader::new();
        reader.read_dss(&mut input).await.unwrap();
        assert!(reader.is_chained_with_same_id());
        assert_eq!(reader.current_chain_state(), DSSCHAIN_SAME_ID);
        let err = reader.read_dss(&mut input).await.unwrap_err();
        assert!(matches!(err, DrdaError::Syntax { code: SYNERRCD_CORRELATOR_MISMATCH, .. }));
    }

    #[tokio::test]
    async fn chain_states() {
        let mut bytes = header(6, 0x41, 1);
        bytes.extend(header(6, 0x61, 2));
        bytes.extend(header(6, 0x01, 3));
        let mut input = &bytes[..];
        let mut reader = DssReader::new();

        reader.read_dss(&mut input).await.unwrap();
        assert!(reader.is_chained_with_diff_id());
        assert!(reader.terminate_chain_on_err());
        assert_eq!(reader.current_chain_state(), DSSCHAIN);

        reader.read_dss(&mut input).await.unwrap();
        assert!(!reader.terminate_chain_on_err());

        reader.read_dss(&mut input).await.unwrap();
        assert_eq!(reader.current_chain_state(), DSS_NOCHAIN);
        assert_eq!(reader.total_byte_count(), 18);
    }

    #[tokio::test]
    async fn reassembles_continued_dss_from_writer() {
        let data: Vec<u8> = (0..69_994u32).map(|i| (i % 249) as u8).collect();
        let mut writer = DdmWriter::new();
        writer.create_dss_request();
        writer.write_bytes(&data);
        writer.end_dss_with_chain(DSS_NOCHAIN);
        let bytes = writer.buffer_contents(0);

        let dss = read_one(&bytes).await.unwrap();
        assert_eq!(&dss.payload[..], &data[..]);
    }

    #[tokio::test]
    async fn short_continuation_header_rejected() {
        let mut bytes = header(0xFFFF, 0x01, 1);
        bytes.extend(vec![0u8; MAX_DSS_LENGTH - 6]);
        bytes.extend_from_slice(&[0x00, 0x02]);
        assert_eq!(syntax_code(read_one(&bytes).await), SYNERRCD_DSS_CONT_LESS_OR_EQUAL_2);
    }

    #[tokio::test]
    async fn reply_reader_accepts_replies() {
        let mut input = &header(6, 0x52, 9)[..];
        let mut reader = DssReader::for_replies();
        let dss = reader.read_dss(&mut input).await.unwrap();
        assert_eq!(dss.dss_type(), DSSFMT_RPYDSS);
        assert!(dss.same_correlator());
    }
}
