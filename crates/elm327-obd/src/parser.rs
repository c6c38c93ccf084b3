//! Response Framing and Payload Extraction
//!
//! The ELM327 answers every command with free-form text terminated by a `>`
//! prompt. This module turns the accumulated bytes of one reply into lines,
//! pulls hex payloads out of diagnostic replies and implements the hex codec
//! used by the binary command path.

use crate::error::ObdError;

/// Prompt character that terminates every adapter reply
pub const PROMPT: u8 = b'>';

/// Length of the status header the adapter prepends to mode 01 replies (`41 0C`)
const STATUS_HEADER_LEN: usize = 4;

/// Progress line printed while the adapter searches for a bus protocol
const SEARCHING: &str = "SEARCHING...";

/// One framed adapter reply, echo removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
}

impl Reply {
    /// Frame the bytes received before the prompt.
    ///
    /// A leading line equal to `command` is the adapter echoing the request
    /// and is dropped, whatever the session's echo flag currently says.
    pub fn from_bytes(raw: &[u8], command: &str) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut lines: Vec<String> = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        let command = command.trim();
        if !command.is_empty()
            && lines
                .first()
                .is_some_and(|first| first.eq_ignore_ascii_case(command))
        {
            lines.remove(0);
        }

        Self { lines }
    }

    /// Reply lines in arrival order
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Lines joined with CR, the way the adapter separates them
    pub fn text(&self) -> String {
        self.lines.join("\r")
    }

    /// True when the adapter sent nothing but the prompt
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// True for a plain `OK` acknowledgement
    pub fn is_ok(&self) -> bool {
        self.lines.len() == 1 && self.lines[0] == "OK"
    }

    /// Substring search over the whole reply
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }

    /// First line carrying data, skipping protocol search progress
    pub fn first_data_line(&self) -> Option<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .find(|line| *line != SEARCHING)
    }
}

/// Hex payload extracted from a diagnostic reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Hex characters of one value
    Data(String),
    /// Adapter answered `NO DATA`: the vehicle does not have the sensor
    NoData,
}

/// Remove every whitespace character from a line
pub fn compact(line: &str) -> String {
    line.split_whitespace().collect()
}

/// Compact the first data line and strip the status header.
///
/// Returns `None` for a `NO DATA` reply.
fn payload_body(reply: &Reply) -> Result<Option<String>, ObdError> {
    let line = reply.first_data_line().ok_or(ObdError::NoResponse)?;
    let code = compact(line);

    if code.starts_with("NODATA") {
        return Ok(None);
    }
    if !code.is_ascii() || code.len() < STATUS_HEADER_LEN {
        return Err(ObdError::MalformedResponse(line.to_string()));
    }

    Ok(Some(code[STATUS_HEADER_LEN..].to_string()))
}

fn take_value(body: &str, start: usize, length: usize) -> Result<String, ObdError> {
    let end = start + length * 2;
    let value = body
        .get(start..end)
        .ok_or_else(|| ObdError::MalformedResponse(format!("payload {body:?} too short")))?;
    if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ObdError::MalformedResponse(format!("non-hex payload {value:?}")));
    }
    Ok(value.to_string())
}

/// Extract the payload of a single-value reply (`length` bytes)
pub fn extract_payload(reply: &Reply, length: usize) -> Result<Payload, ObdError> {
    match payload_body(reply)? {
        None => Ok(Payload::NoData),
        Some(body) => Ok(Payload::Data(take_value(&body, 0, length)?)),
    }
}

/// Extract every value of a reply that carries several frames on one line,
/// e.g. `41 00 BF 9F B9 93 41 00 98 18 80 11`.
///
/// After the first value each further value is preceded by a 4 character
/// frame header that is skipped. An empty vector means `NO DATA`.
pub fn extract_arrayed(reply: &Reply, length: usize) -> Result<Vec<String>, ObdError> {
    let Some(body) = payload_body(reply)? else {
        return Ok(Vec::new());
    };

    let step = length * 2;
    let mut values = vec![take_value(&body, 0, length)?];
    let mut offset = step;
    while offset < body.len() {
        values.push(take_value(&body, offset + STATUS_HEADER_LEN, length)?);
        offset += STATUS_HEADER_LEN + step;
    }
    Ok(values)
}

/// Encode bytes as space separated uppercase hex pairs (`01 0C`)
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode a space separated hex stream, rejecting anything malformed.
///
/// Accepts pairs of hex digits separated by exactly one space, optionally
/// followed by a single newline.
pub fn decode_hex_stream(text: &str) -> Result<Vec<u8>, ObdError> {
    let body = text
        .strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text);

    if body.is_empty() {
        return Ok(Vec::new());
    }

    body.split(' ')
        .map(|pair| {
            if pair.len() != 2 || !pair.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ObdError::MalformedResponse(format!(
                    "bad hex pair {pair:?} in {text:?}"
                )));
            }
            u8::from_str_radix(pair, 16)
                .map_err(|e| ObdError::MalformedResponse(format!("{pair:?}: {e}")))
        })
        .collect()
}
