//! CCSID managers: the string encodings a connection can negotiate.
//!
//! A session starts in EBCDIC (CCSID 500). If the requester lists
//! `UNICODEMGR` at level 1208 in EXCSAT, both directions switch to UTF-8 for
//! the rest of the session.

use bytes::BufMut;

use crate::buffer::MessageBuffer;

/// EBCDIC `?`, written for characters outside the single-byte repertoire.
const EBCDIC_SUBSTITUTE: u8 = 0x6F;

/// CCSID 500 (International EBCDIC) to ISO-8859-1.
const CP500_TO_LATIN1: [u8; 256] = [
    0x00, 0x01, 0x02, 0x03, 0x9C, 0x09, 0x86, 0x7F, 0x97, 0x8D, 0x8E, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x10, 0x11, 0x12, 0x13, 0x9D, 0x85, 0x08, 0x87, 0x18, 0x19, 0x92, 0x8F, 0x1C, 0x1D, 0x1E, 0x1F,
    0x80, 0x81, 0x82, 0x83, 0x84, 0x0A, 0x17, 0x1B, 0x88, 0x89, 0x8A, 0x8B, 0x8C, 0x05, 0x06, 0x07,
    0x90, 0x91, 0x16, 0x93, 0x94, 0x95, 0x96, 0x04, 0x98, 0x99, 0x9A, 0x9B, 0x14, 0x15, 0x9E, 0x1A,
    0x20, 0xA0, 0xE2, 0xE4, 0xE0, 0xE1, 0xE3, 0xE5, 0xE7, 0xF1, 0x5B, 0x2E, 0x3C, 0x28, 0x2B, 0x21,
    0x26, 0xE9, 0xEA, 0xEB, 0xE8, 0xED, 0xEE, 0xEF, 0xEC, 0xDF, 0x5D, 0x24, 0x2A, 0x29, 0x3B, 0x5E,
    0x2D, 0x2F, 0xC2, 0xC4, 0xC0, 0xC1, 0xC3, 0xC5, 0xC7, 0xD1, 0xA6, 0x2C, 0x25, 0x5F, 0x3E, 0x3F,
    0xF8, 0xC9, 0xCA, 0xCB, 0xC8, 0xCD, 0xCE, 0xCF, 0xCC, 0x60, 0x3A, 0x23, 0x40, 0x27, 0x3D, 0x22,
    0xD8, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0xAB, 0xBB, 0xF0, 0xFD, 0xFE, 0xB1,
    0xB0, 0x6A, 0x6B, 0x6C, 0x6D, 0x6E, 0x6F, 0x70, 0x71, 0x72, 0xAA, 0xBA, 0xE6, 0xB8, 0xC6, 0xA4,
    0xB5, 0x7E, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7A, 0xA1, 0xBF, 0xD0, 0xDD, 0xDE, 0xAE,
    0xA2, 0xA3, 0xA5, 0xB7, 0xA9, 0xA7, 0xB6, 0xBC, 0xBD, 0xBE, 0xAC, 0x7C, 0xAF, 0xA8, 0xB4, 0xD7,
    0x7B, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0xAD, 0xF4, 0xF6, 0xF2, 0xF3, 0xF5,
    0x7D, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F, 0x50, 0x51, 0x52, 0xB9, 0xFB, 0xFC, 0xF9, 0xFA, 0xFF,
    0x5C, 0xF7, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, 0xB2, 0xD4, 0xD6, 0xD2, 0xD3, 0xD5,
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0xB3, 0xDB, 0xDC, 0xD9, 0xDA, 0x9F,
];

/// ISO-8859-1 to CCSID 500; the inverse of [`CP500_TO_LATIN1`].
const LATIN1_TO_CP500: [u8; 256] = invert(&CP500_TO_LATIN1);

const fn invert(table: &[u8; 256]) -> [u8; 256] {
    let mut inverse = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        inverse[table[i] as usize] = i as u8;
        i += 1;
    }
    inverse
}

/// String encoding used on the wire for character DDM scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CcsidManager {
    /// Single-byte EBCDIC, CCSID 500.
    #[default]
    Ebcdic,
    /// UTF-8, CCSID 1208.
    Utf8,
}

impl CcsidManager {
    /// CCSID number of this encoding.
    pub fn ccsid(self) -> u16 {
        match self {
            CcsidManager::Ebcdic => 500,
            CcsidManager::Utf8 => 1208,
        }
    }

    /// Pad byte for fixed-width character fields.
    pub fn space(self) -> u8 {
        match self {
            CcsidManager::Ebcdic => 0x40,
            CcsidManager::Utf8 => b' ',
        }
    }

    /// Number of bytes `s` occupies once encoded.
    pub fn byte_length(self, s: &str) -> usize {
        match self {
            CcsidManager::Ebcdic => s.chars().count(),
            CcsidManager::Utf8 => s.len(),
        }
    }

    /// Encode `s` at the buffer's cursor, advancing it by exactly
    /// [`byte_length`](Self::byte_length) bytes.
    pub fn encode_into(self, s: &str, buffer: &mut MessageBuffer) {
        let len = self.byte_length(s);
        buffer.ensure_capacity(len);
        match self {
            CcsidManager::Ebcdic => {
                for ch in s.chars() {
                    buffer.put_u8(ebcdic_byte(ch));
                }
            }
            CcsidManager::Utf8 => buffer.put_slice(s.as_bytes()),
        }
    }

    /// Encode `s` into a fresh vector.
    pub fn encode(self, s: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_length(s));
        match self {
            CcsidManager::Ebcdic => {
                for ch in s.chars() {
                    out.put_u8(ebcdic_byte(ch));
                }
            }
            CcsidManager::Utf8 => out.put_slice(s.as_bytes()),
        }
        out
    }

    /// Decode wire bytes. Invalid UTF-8 sequences are replaced.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            CcsidManager::Ebcdic => bytes
                .iter()
                .map(|&b| char::from(CP500_TO_LATIN1[b as usize]))
                .collect(),
            CcsidManager::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

fn ebcdic_byte(ch: char) -> u8 {
    u8::try_from(u32::from(ch))
        .map(|latin1| LATIN1_TO_CP500[latin1 as usize])
        .unwrap_or(EBCDIC_SUBSTITUTE)
}
