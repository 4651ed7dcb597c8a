//! Record-marked XDR framing for bucket files.
//!
//! Bucket files are a flat sequence of frames:
//!
//! ```text
//! [4-byte big-endian size with bit 31 set] [XDR payload]
//! ```
//!
//! The high bit of the size word is the XDR record-marking "last fragment"
//! flag (RFC 5531). It is always set; the low 31 bits carry the payload
//! length. A frame without the flag is not a bucket record.

use std::io::{self, Read, Write};

use stellar_xdr::curr::{Limits, WriteXdr};

use crate::Result;

/// Bit 31 of the size word.
pub const RECORD_MARK_BIT: u32 = 0x8000_0000;

/// Largest payload a single frame can describe.
pub const MAX_RECORD_LEN: u32 = RECORD_MARK_BIT - 1;

/// Build the 4-byte frame header for a payload of `len` bytes.
pub fn record_mark(len: usize) -> io::Result<[u8; 4]> {
    let sz = u32::try_from(len)
        .ok()
        .filter(|sz| *sz <= MAX_RECORD_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("XDR record of {} bytes exceeds frame limit", len),
            )
        })?;
    Ok((sz | RECORD_MARK_BIT).to_be_bytes())
}

/// Serialize an XDR value into a framed record (header + payload).
pub fn encode_record<T: WriteXdr>(value: &T) -> Result<Vec<u8>> {
    let payload = value.to_xdr(Limits::none())?;
    let header = record_mark(payload.len())?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Write one framed record. Returns the number of bytes written.
pub fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<usize> {
    let header = record_mark(payload.len())?;
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    Ok(4 + payload.len())
}

/// Read one framed record.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes of a new header).
/// A size word without the record mark is `InvalidData`; a stream that ends
/// inside a header or payload is `UnexpectedEof`.
pub fn read_record<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated XDR record header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let word = u32::from_be_bytes(header);
    if word & RECORD_MARK_BIT == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("XDR record size word {:#010x} lacks record mark", word),
        ));
    }

    let len = (word & MAX_RECORD_LEN) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}
