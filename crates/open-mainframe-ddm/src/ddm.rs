//! DDM (Distributed Data Management) object parsing.
//!
//! DDM objects are the fundamental data units within DRDA DSS segments.
//! They follow a TLV (Type-Length-Value) format:
//!
//! ```text
//! Offset  Len  Field
//! 0       2    Total length (big-endian, includes the 4-byte header)
//! 2       2    Code point (big-endian, identifies the object type)
//! 4       N    Payload (may contain nested DDM parameters)
//! ```
//!
//! A length with the top bit set announces an extended length: the low bits
//! minus 4 give the number of length bytes (4, 6 or 8) that follow the code
//! point. `0x8004` on EXTDTA/QRYDTA means the object runs to the end of the
//! DSS (layer B streaming).

use rust_decimal::Decimal;

use crate::buffer::ByteOrder;
use crate::ccsid::CcsidManager;
use crate::code_points::*;
use crate::decimal::{packed_length, unpack_decimal};
use crate::error::{DrdaError, DrdaResult};

/// Minimum DDM header length.
pub const DDM_HEADER_LEN: usize = 4;

/// A parsed DDM object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdmObject {
    /// Code point identifying this DDM object type.
    pub code_point: u16,
    /// Raw payload bytes (may contain nested DDM parameters).
    pub payload: Vec<u8>,
}

impl DdmObject {
    pub fn new(code_point: u16, payload: Vec<u8>) -> Self {
        Self {
            code_point,
            payload,
        }
    }

    /// Cursor over this object's payload.
    pub fn cursor(&self, ccsid: CcsidManager) -> DdmCursor<'_> {
        DdmCursor::new(&self.payload, ccsid)
    }

    /// Parse nested DDM parameters from this object's payload.
    pub fn params(&self) -> DrdaResult<Vec<DdmObject>> {
        parse_ddm_params(&self.payload)
    }

    /// Find a parameter by code point within this object's payload.
    pub fn find_param(&self, code_point: u16) -> DrdaResult<Option<DdmObject>> {
        Ok(self.params()?.into_iter().find(|p| p.code_point == code_point))
    }

    /// Get a character parameter decoded with `ccsid`, trailing pad removed.
    pub fn string_param(&self, code_point: u16, ccsid: CcsidManager) -> DrdaResult<Option<String>> {
        Ok(self.find_param(code_point)?.map(|param| {
            ccsid
                .decode(&param.payload)
                .trim_end_matches(['\0', ' '])
                .to_string()
        }))
    }

    /// Get a parameter's payload as a u16 value.
    pub fn u16_param(&self, code_point: u16) -> DrdaResult<Option<u16>> {
        match self.find_param(code_point)? {
            Some(param) if param.payload.len() == 2 => {
                Ok(Some(u16::from_be_bytes([param.payload[0], param.payload[1]])))
            }
            Some(_) => Err(DrdaError::Syntax {
                code: SYNERRCD_OBJ_LEN_NOT_ALLOWED,
                code_point: Some(code_point),
            }),
            None => Ok(None),
        }
    }
}

/// Parse all DDM objects in a DSS payload. EXTDTA and QRYDTA may use the
/// layer B marker.
pub fn parse_ddm_list(data: &[u8]) -> DrdaResult<Vec<DdmObject>> {
    parse_objects(data, true)
}

/// Parse nested DDM parameters from a payload.
pub fn parse_ddm_params(data: &[u8]) -> DrdaResult<Vec<DdmObject>> {
    parse_objects(data, false)
}

fn parse_objects(data: &[u8], layer_b_possible: bool) -> DrdaResult<Vec<DdmObject>> {
    let mut cursor = DdmCursor::new(data, CcsidManager::default());
    let mut objects = Vec::new();
    while !cursor.is_empty() {
        let header = cursor.read_length_and_code_point(layer_b_possible)?;
        let payload = cursor.read_bytes(header.data_len)?.to_vec();
        objects.push(DdmObject::new(header.code_point, payload));
    }
    Ok(objects)
}

/// Header of one DDM object inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdmHeader {
    pub code_point: u16,
    /// Bytes of object data following the header.
    pub data_len: usize,
    /// The object used the layer B streaming marker and runs to the end of
    /// its payload.
    pub streamed: bool,
}

/// Cursor over DDM objects and scalars in a DSS payload.
///
/// Collections are read by taking a sub-cursor over the collection's data
/// with [`collection`](Self::collection).
#[derive(Debug, Clone)]
pub struct DdmCursor<'a> {
    data: &'a [u8],
    pos: usize,
    ccsid: CcsidManager,
}

impl<'a> DdmCursor<'a> {
    pub fn new(data: &'a [u8], ccsid: CcsidManager) -> Self {
        Self { data, pos: 0, ccsid }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read an object's length and code point.
    ///
    /// Extended lengths of 4, 6 or 8 bytes are decoded. With
    /// `layer_b_possible`, an EXTDTA or QRYDTA carrying `0x8004` extends to
    /// the end of the payload.
    pub fn read_length_and_code_point(&mut self, layer_b_possible: bool) -> DrdaResult<DdmHeader> {
        let length = self.read_network_short()?;
        let code_point = self.read_network_short()?;
        let syntax = |code| DrdaError::Syntax {
            code,
            code_point: Some(code_point),
        };

        if length & CONTINUATION_BIT == 0 {
            if length < 4 {
                return Err(syntax(SYNERRCD_OBJ_LEN_LESS_THAN_4));
            }
            let data_len = length as usize - 4;
            if data_len > self.remaining() {
                return Err(syntax(SYNERRCD_OBJ_LEN_NOT_ALLOWED));
            }
            return Ok(DdmHeader {
                code_point,
                data_len,
                streamed: false,
            });
        }

        let extended_bytes = (length & !CONTINUATION_BIT) as usize;
        let data_len = match extended_bytes.checked_sub(4) {
            Some(count @ (4 | 6 | 8)) => {
                let bytes = self
                    .read_bytes(count)
                    .map_err(|_| syntax(SYNERRCD_INCORRECT_EXTENDED_LEN))?;
                let len = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                usize::try_from(len).map_err(|_| syntax(SYNERRCD_INCORRECT_EXTENDED_LEN))?
            }
            Some(0) if layer_b_possible && (code_point == EXTDTA || code_point == QRYDTA) => {
                return Ok(DdmHeader {
                    code_point,
                    data_len: self.remaining(),
                    streamed: true,
                });
            }
            _ => return Err(syntax(SYNERRCD_INCORRECT_EXTENDED_LEN)),
        };
        if data_len > self.remaining() {
            return Err(syntax(SYNERRCD_OBJ_LEN_NOT_ALLOWED));
        }
        Ok(DdmHeader {
            code_point,
            data_len,
            streamed: false,
        })
    }

    /// Sub-cursor over the next `len` bytes; this cursor skips past them.
    pub fn collection(&mut self, len: usize) -> DrdaResult<DdmCursor<'a>> {
        let data = self.read_bytes(len)?;
        Ok(DdmCursor::new(data, self.ccsid))
    }

    pub fn read_bytes(&mut self, len: usize) -> DrdaResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(DrdaError::InvalidDdm(format!(
                "need {len} bytes at offset {}, {} remain",
                self.pos,
                self.remaining()
            )));
        }
        let data = self.data;
        let bytes = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> DrdaResult<()> {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> DrdaResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> DrdaResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_network_short(&mut self) -> DrdaResult<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_network_int(&mut self) -> DrdaResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_network_long(&mut self) -> DrdaResult<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_network_six_byte_long(&mut self) -> DrdaResult<u64> {
        let bytes = self.read_array::<6>()?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn read_short(&mut self, order: ByteOrder) -> DrdaResult<i16> {
        let bytes = self.read_array()?;
        Ok(match order {
            ByteOrder::BigEndian => i16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => i16::from_le_bytes(bytes),
        })
    }

    pub fn read_int(&mut self, order: ByteOrder) -> DrdaResult<i32> {
        let bytes = self.read_array()?;
        Ok(match order {
            ByteOrder::BigEndian => i32::from_be_bytes(bytes),
            ByteOrder::LittleEndian => i32::from_le_bytes(bytes),
        })
    }

    pub fn read_long(&mut self, order: ByteOrder) -> DrdaResult<i64> {
        let bytes = self.read_array()?;
        Ok(match order {
            ByteOrder::BigEndian => i64::from_be_bytes(bytes),
            ByteOrder::LittleEndian => i64::from_le_bytes(bytes),
        })
    }

    pub fn read_float(&mut self, order: ByteOrder) -> DrdaResult<f32> {
        Ok(f32::from_bits(self.read_int(order)? as u32))
    }

    pub fn read_double(&mut self, order: ByteOrder) -> DrdaResult<f64> {
        Ok(f64::from_bits(self.read_long(order)? as u64))
    }

    pub fn read_big_decimal(&mut self, precision: u32, scale: u32) -> DrdaResult<Decimal> {
        let bytes = self.read_bytes(packed_length(precision))?;
        unpack_decimal(bytes, precision, scale)
    }

    /// `len` bytes decoded with the connection's CCSID.
    pub fn read_string(&mut self, len: usize) -> DrdaResult<String> {
        let ccsid = self.ccsid;
        Ok(ccsid.decode(self.read_bytes(len)?))
    }

    /// 2-byte length followed by a UTF-8 string.
    pub fn read_ld_string(&mut self) -> DrdaResult<String> {
        let len = self.read_network_short()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
