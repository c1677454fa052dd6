//! Length-prefixed binary (de)serialization of subchannel request bodies.
//!
//! All integers are little-endian. A string is `u32 length` followed by `length` bytes whose
//! final byte must be `NUL`, or `length == 0` for a null string. A string array is `u32 count`
//! followed by `count` strings.

use crate::error::{wire, HelperError, Result};
use crate::protocol::{MAX_MESSAGE_LENGTH, MAX_STRING_ARRAY_COUNT};

fn bad_request(message: impl Into<String>) -> HelperError {
    HelperError::protocol(message, wire::INVALID_REQUEST)
}

/// A cursor over an in-memory request body, bounds-checked against [`MAX_MESSAGE_LENGTH`].
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(bad_request("request body truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("took 4 bytes");
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("took 8 bytes");
        Ok(u64::from_le_bytes(bytes))
    }

    /// Reads a length-prefixed, NUL-terminated string. `None` encodes the null string.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let len = self.read_u32()?;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_MESSAGE_LENGTH {
            return Err(HelperError::protocol("string length exceeds cap", libc::E2BIG));
        }
        let bytes = self.take(len as usize)?;
        let (&last, body) = bytes.split_last().ok_or_else(|| bad_request("empty non-null string"))?;
        if last != 0 {
            return Err(bad_request("string not NUL-terminated"));
        }
        std::str::from_utf8(body)
            .map(str::to_owned)
            .map_err(|_| bad_request("string is not valid UTF-8"))
    }

    /// Reads a string array: `u32 count` followed by `count` strings (per [`Self::read_string`],
    /// except a null entry is rejected — arrays hold argv/envp, which never contain null slots).
    pub fn read_string_array(&mut self) -> Result<Vec<String>> {
        let count = self.read_u32()?;
        if count > MAX_STRING_ARRAY_COUNT {
            return Err(HelperError::protocol("string array too long", libc::E2BIG));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let s = self
                .read_string()?
                .ok_or_else(|| bad_request("null entry in string array"))?;
            out.push(s);
        }
        Ok(out)
    }

    pub fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(bad_request("trailing bytes after request body"));
        }
        Ok(())
    }
}

/// A request header: `u32 command, u32 body_length`.
pub struct RequestHeader {
    pub command: u32,
    pub body_length: u32,
}

impl RequestHeader {
    pub const WIRE_LEN: usize = 8;

    pub fn decode(bytes: [u8; Self::WIRE_LEN]) -> Self {
        Self {
            command: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            body_length: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// An `{err, data}` subchannel response: always exactly 8 bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub err: i32,
    pub data: i32,
}

impl Response {
    pub const WIRE_LEN: usize = 8;

    pub fn ok(data: i32) -> Self {
        Self { err: 0, data }
    }

    pub fn error(err: i32) -> Self {
        Self { err, data: 0 }
    }

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..4].copy_from_slice(&self.err.to_le_bytes());
        out[4..8].copy_from_slice(&self.data.to_le_bytes());
        out
    }
}

/// A `ChildExitNotification` record sent on the main channel: `u64 token, i32 pid, i32 status`.
#[derive(Debug, Clone, Copy)]
pub struct ChildExitNotification {
    pub token: u64,
    pub pid: i32,
    pub status: i32,
}

impl ChildExitNotification {
    pub const WIRE_LEN: usize = 16;

    pub fn encode(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..8].copy_from_slice(&self.token.to_le_bytes());
        out[8..12].copy_from_slice(&self.pid.to_le_bytes());
        out[12..16].copy_from_slice(&self.status.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_string(s: Option<&str>) -> Vec<u8> {
        match s {
            None => 0u32.to_le_bytes().to_vec(),
            Some(s) => {
                let mut body = s.as_bytes().to_vec();
                body.push(0);
                let mut out = (body.len() as u32).to_le_bytes().to_vec();
                out.extend(body);
                out
            }
        }
    }

    #[test]
    fn reads_null_and_non_null_strings() {
        let mut bytes = encode_string(None);
        bytes.extend(encode_string(Some("/bin/true")));
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), None);
        assert_eq!(r.read_string().unwrap(), Some("/bin/true".to_owned()));
        r.finish().unwrap();
    }

    #[test]
    fn rejects_non_nul_terminated_string() {
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend(b"abc"); // missing NUL terminator
        let mut r = Reader::new(&bytes);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn rejects_oversized_string_array() {
        let bytes = (MAX_STRING_ARRAY_COUNT + 1).to_le_bytes();
        let mut r = Reader::new(&bytes);
        assert!(r.read_string_array().is_err());
    }

    #[test]
    fn response_roundtrip() {
        let r = Response { err: -5, data: 123 };
        let bytes = r.encode();
        assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().unwrap()), -5);
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 123);
    }
}
