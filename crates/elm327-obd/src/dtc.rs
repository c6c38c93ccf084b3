//! Diagnostic Trouble Code Decoding
//!
//! Mode 03 / 07 replies carry up to three packed codes per frame, two bytes
//! each. A zero code pads the last frame.

use crate::error::ObdError;
use crate::parser::{compact, Reply};
use serde::{Deserialize, Serialize};

/// Codes carried by one mode 03 / 07 frame
pub const CODES_PER_FRAME: usize = 3;

/// Letter class selected by the two top bits of the first byte
const DTC_LETTERS: [char; 4] = ['P', 'C', 'B', 'U'];

/// Whether a code is stored (mode 03) or pending (mode 07)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcStatus {
    /// Stored code, reported with the MIL
    Active,
    /// Pending code from the current or last driving cycle
    Passive,
}

/// A decoded trouble code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcCode {
    /// Stored or pending
    pub status: DtcStatus,
    /// Five character code, e.g. `P0123`
    pub code: String,
}

/// Decode one packed code. Returns `None` for the `0000` filler.
pub fn decode_dtc(high: u8, low: u8) -> Option<String> {
    if high == 0 && low == 0 {
        return None;
    }

    let letter = DTC_LETTERS[(high >> 6) as usize];
    Some(format!(
        "{}{}{:X}{:X}{:X}",
        letter,
        (high >> 4) & 0x03,
        high & 0x0F,
        low >> 4,
        low & 0x0F
    ))
}

/// Number of frames to request for `stored` codes
pub fn frame_count(stored: u8) -> usize {
    (stored as usize).div_ceil(CODES_PER_FRAME)
}

/// Decode the codes of one mode 03 / 07 reply frame.
///
/// The first two hex characters echo the mode (`43`, `47`) and are skipped.
/// Decoding stops at the first zero code or when the frame runs out.
pub fn decode_frame(reply: &Reply, status: DtcStatus) -> Result<Vec<DtcCode>, ObdError> {
    let Some(line) = reply.first_data_line() else {
        return Ok(Vec::new());
    };
    let code = compact(line);
    if code.starts_with("NODATA") {
        return Ok(Vec::new());
    }
    if !code.is_ascii() || code.len() < 2 {
        return Err(ObdError::MalformedResponse(line.to_string()));
    }

    let body = &code[2..];
    let mut codes = Vec::with_capacity(CODES_PER_FRAME);
    for i in 0..CODES_PER_FRAME {
        let Some(group) = body.get(i * 4..i * 4 + 4) else {
            break;
        };
        if !group.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ObdError::MalformedResponse(format!("bad DTC {group:?} in {line:?}")));
        }
        let value = u16::from_str_radix(group, 16)
            .map_err(|e| ObdError::MalformedResponse(format!("{group:?}: {e}")))?;

        match decode_dtc((value >> 8) as u8, value as u8) {
            Some(code) => codes.push(DtcCode { status, code }),
            None => break,
        }
    }
    Ok(codes)
}
