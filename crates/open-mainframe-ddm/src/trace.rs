//! Communications-buffer tracing.
//!
//! Every byte range the writer sends (and every DSS the reader receives) can
//! be handed to a [`ComBufferTrace`]. The default implementation renders a
//! hex/EBCDIC dump through `tracing` at `trace` level.

use std::fmt::Write as _;

use crate::ccsid::CcsidManager;

/// Direction of a traced buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    Send,
    Receive,
}

impl TraceDirection {
    fn as_str(self) -> &'static str {
        match self {
            TraceDirection::Send => "SEND",
            TraceDirection::Receive => "RECEIVE",
        }
    }
}

/// Sink for raw protocol buffers.
pub trait ComBufferTrace: Send + Sync {
    /// Cheap check so callers can skip building trace input.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Record one buffer. `label` names the operation (`"flush"`, `"stream"`, `"read"`).
    fn record(&self, direction: TraceDirection, label: &str, data: &[u8]);
}

/// Trace sink that logs a formatted dump through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingComBufferTrace;

impl ComBufferTrace for TracingComBufferTrace {
    fn is_enabled(&self) -> bool {
        tracing::enabled!(tracing::Level::TRACE)
    }

    fn record(&self, direction: TraceDirection, label: &str, data: &[u8]) {
        tracing::trace!(
            direction = direction.as_str(),
            label,
            len = data.len(),
            "DRDA com buffer\n{}",
            hex_dump(data)
        );
    }
}

/// Format bytes as hex for debug logging.
pub fn hex_preview(data: &[u8], max_len: usize) -> String {
    let len = data.len().min(max_len);
    let hex: Vec<String> = data[..len].iter().map(|b| format!("{:02x}", b)).collect();
    let result = hex.join(" ");
    if data.len() > max_len {
        format!("{}...(+{} bytes)", result, data.len() - max_len)
    } else {
        result
    }
}

/// Sixteen bytes per line: offset, hex, then the ASCII and EBCDIC renderings.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 5);
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04X}  ", line * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02X}");
                }
                None => out.push_str("  "),
            }
            if i % 4 == 3 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| printable(b)));
        out.push_str("| |");
        out.extend(
            CcsidManager::Ebcdic
                .decode(chunk)
                .chars()
                .map(|c| u8::try_from(c).map(printable).unwrap_or('.')),
        );
        out.push_str("|\n");
    }
    out
}

fn printable(b: u8) -> char {
    if b.is_ascii_graphic() || b == b' ' {
        char::from(b)
    } else {
        '.'
    }
}
