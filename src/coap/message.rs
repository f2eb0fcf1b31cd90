//! The CoAP message model and codec (RFC 7252 §3).
//!
//! Messages are encoded as a fixed 4-byte header (version, type, token
//! length, code, message ID), followed by the token, delta-encoded options,
//! and an optional payload introduced by a 0xFF marker:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...        |1 1 1 1 1 1 1 1|    Payload ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding performs full structural validation and returns typed errors
//! for malformed input; it must be impossible for a hostile datagram to
//! panic the transport's event loop.

use super::block::BlockOption;
use crate::errdata;
use crate::error::Result;

/// The CoAP protocol version.
const VERSION: u8 = 1;

/// The maximum token length, per RFC 7252.
const MAX_TOKEN_LENGTH: usize = 8;

/// The Uri-Path option. Repeatable; one option per path segment.
pub const OPTION_URI_PATH: u16 = 11;

/// The Block2 option (response payload fragmentation), RFC 7959.
pub const OPTION_BLOCK2: u16 = 23;

/// The Block1 option (request payload fragmentation), RFC 7959.
pub const OPTION_BLOCK1: u16 = 27;

/// A CoAP message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// Requires an acknowledgement, retransmitted until acknowledged.
    Confirmable,
    /// Fire-and-forget, e.g. multicast discovery.
    NonConfirmable,
    /// Acknowledges a confirmable message, optionally carrying a piggybacked
    /// response.
    Acknowledgement,
    /// Rejects a message the receiver can't or won't process.
    Reset,
}

impl Type {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Type::Confirmable,
            1 => Type::NonConfirmable,
            2 => Type::Acknowledgement,
            3 => Type::Reset,
            _ => unreachable!(),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Type::Confirmable => 0,
            Type::NonConfirmable => 1,
            Type::Acknowledgement => 2,
            Type::Reset => 3,
        }
    }
}

/// A CoAP code: a 3-bit class and a 5-bit detail, conventionally written
/// class.detail (e.g. 2.05 Content).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Code(pub u8);

impl Code {
    /// 0.00, used by empty acknowledgements and resets.
    pub const EMPTY: Code = Code(0x00);
    /// 0.01 GET.
    pub const GET: Code = Code(0x01);
    /// 0.02 POST.
    pub const POST: Code = Code(0x02);
    /// 2.04 Changed.
    pub const CHANGED: Code = Code(0x44);
    /// 2.05 Content.
    pub const CONTENT: Code = Code(0x45);
    /// 2.31 Continue, acknowledging an intermediate block.
    pub const CONTINUE: Code = Code(0x5f);
    /// 4.00 Bad Request.
    pub const BAD_REQUEST: Code = Code(0x80);
    /// 4.04 Not Found.
    pub const NOT_FOUND: Code = Code(0x84);
    /// 4.08 Request Entity Incomplete, for failed block reassembly.
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code(0x88);
    /// 5.00 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: Code = Code(0xa0);
    /// 5.03 Service Unavailable, the overload backpressure signal.
    pub const SERVICE_UNAVAILABLE: Code = Code(0xa3);

    /// Returns the code class (the upper 3 bits).
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Returns the code detail (the lower 5 bits).
    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// Returns whether this is a request code (class 0, nonzero detail).
    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    /// Returns whether this is a success response code (class 2).
    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A CoAP message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_type: Type,
    pub code: Code,
    /// Matches acknowledgements to confirmable messages, and detects
    /// duplicates from retransmission.
    pub message_id: u16,
    /// Matches responses to requests across message IDs, 0-8 bytes.
    pub token: Vec<u8>,
    /// Options as (number, value) pairs. Kept sorted by number; repeatable
    /// options (e.g. Uri-Path) appear once per value, in order.
    pub options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a new message without options or payload.
    pub fn new(message_type: Type, code: Code, message_id: u16, token: Vec<u8>) -> Self {
        assert!(token.len() <= MAX_TOKEN_LENGTH, "token too long");
        Self { message_type, code, message_id, token, options: Vec::new(), payload: Vec::new() }
    }

    /// Creates an empty acknowledgement for the given message ID.
    pub fn ack(message_id: u16) -> Self {
        Self::new(Type::Acknowledgement, Code::EMPTY, message_id, Vec::new())
    }

    /// Creates a reset for the given message ID, rejecting it.
    pub fn reset(message_id: u16) -> Self {
        Self::new(Type::Reset, Code::EMPTY, message_id, Vec::new())
    }

    /// Adds an option, keeping the option list sorted by number. Repeated
    /// numbers retain insertion order (stable sort).
    pub fn with_option(mut self, number: u16, value: Vec<u8>) -> Self {
        self.options.push((number, value));
        self.options.sort_by_key(|(n, _)| *n);
        self
    }

    /// Adds a payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Adds a Uri-Path, one option per /-separated segment.
    pub fn with_uri_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self = self.with_option(OPTION_URI_PATH, segment.as_bytes().to_vec());
        }
        self
    }

    /// Returns the first value of the given option, if any.
    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options.iter().find(|(n, _)| *n == number).map(|(_, v)| v.as_slice())
    }

    /// Returns the Uri-Path as a /-joined string.
    pub fn uri_path(&self) -> String {
        self.options
            .iter()
            .filter(|(n, _)| *n == OPTION_URI_PATH)
            .map(|(_, v)| String::from_utf8_lossy(v))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Returns the decoded Block1 option, if present.
    pub fn block1(&self) -> Result<Option<BlockOption>> {
        self.option(OPTION_BLOCK1).map(BlockOption::decode).transpose()
    }

    /// Returns the decoded Block2 option, if present.
    pub fn block2(&self) -> Result<Option<BlockOption>> {
        self.option(OPTION_BLOCK2).map(BlockOption::decode).transpose()
    }

    /// Encodes the message to its wire format.
    pub fn encode(&self) -> Vec<u8> {
        assert!(self.token.len() <= MAX_TOKEN_LENGTH, "token too long");
        let mut buf = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        buf.push((VERSION << 6) | (self.message_type.bits() << 4) | self.token.len() as u8);
        buf.push(self.code.0);
        buf.extend(self.message_id.to_be_bytes());
        buf.extend(&self.token);

        let mut previous = 0u16;
        for (number, value) in &self.options {
            assert!(*number >= previous, "options must be sorted");
            let delta = number - previous;
            previous = *number;
            let (delta_nibble, delta_ext) = Self::encode_option_uint(delta);
            let (len_nibble, len_ext) = Self::encode_option_uint(value.len() as u16);
            buf.push((delta_nibble << 4) | len_nibble);
            buf.extend(delta_ext);
            buf.extend(len_ext);
            buf.extend(value);
        }

        if !self.payload.is_empty() {
            buf.push(0xff);
            buf.extend(&self.payload);
        }
        buf
    }

    /// Encodes an option delta or length as a nibble plus extended bytes.
    fn encode_option_uint(value: u16) -> (u8, Vec<u8>) {
        match value {
            0..=12 => (value as u8, vec![]),
            13..=268 => (13, vec![(value - 13) as u8]),
            _ => (14, (value - 269).to_be_bytes().to_vec()),
        }
    }

    /// Decodes a message from its wire format, validating its structure.
    /// Malformed input yields InvalidData, never a panic.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return errdata!("message shorter than header");
        }
        let version = buf[0] >> 6;
        if version != VERSION {
            return errdata!("unsupported version {version}");
        }
        let message_type = Type::from_bits(buf[0] >> 4);
        let token_length = (buf[0] & 0x0f) as usize;
        if token_length > MAX_TOKEN_LENGTH {
            return errdata!("token length {token_length} exceeds maximum");
        }
        let code = Code(buf[1]);
        if matches!(code.class(), 1 | 6 | 7) {
            return errdata!("reserved code class {}", code.class());
        }
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let mut pos = 4;
        if buf.len() < pos + token_length {
            return errdata!("message truncated in token");
        }
        let token = buf[pos..pos + token_length].to_vec();
        pos += token_length;

        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();
        while pos < buf.len() {
            if buf[pos] == 0xff {
                pos += 1;
                if pos == buf.len() {
                    return errdata!("payload marker without payload");
                }
                payload = buf[pos..].to_vec();
                break;
            }
            let delta_nibble = buf[pos] >> 4;
            let len_nibble = buf[pos] & 0x0f;
            pos += 1;
            let delta = Self::decode_option_uint(buf, &mut pos, delta_nibble)?;
            let length = Self::decode_option_uint(buf, &mut pos, len_nibble)? as usize;
            number = number
                .checked_add(delta)
                .ok_or_else(|| crate::error::Error::InvalidData("option number overflow".into()))?;
            if buf.len() < pos + length {
                return errdata!("message truncated in option {number}");
            }
            options.push((number, buf[pos..pos + length].to_vec()));
            pos += length;
        }

        if code == Code::EMPTY && !(token.is_empty() && options.is_empty() && payload.is_empty()) {
            return errdata!("empty message with token, options, or payload");
        }

        Ok(Self { message_type, code, message_id, token, options, payload })
    }

    /// Decodes an option delta or length nibble, consuming extended bytes.
    fn decode_option_uint(buf: &[u8], pos: &mut usize, nibble: u8) -> Result<u16> {
        match nibble {
            0..=12 => Ok(nibble as u16),
            13 => {
                let Some(&ext) = buf.get(*pos) else {
                    return errdata!("message truncated in option header");
                };
                *pos += 1;
                Ok(ext as u16 + 13)
            }
            14 => {
                let Some(ext) = buf.get(*pos..*pos + 2) else {
                    return errdata!("message truncated in option header");
                };
                *pos += 2;
                let value = u16::from_be_bytes([ext[0], ext[1]]);
                value.checked_add(269).ok_or_else(|| {
                    crate::error::Error::InvalidData("option value overflow".into())
                })
            }
            // 15 is the payload marker nibble; it is reserved in option
            // headers and indicates a malformed message.
            _ => errdata!("reserved option nibble 15"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip_request() -> Result<()> {
        let msg = Message::new(Type::Confirmable, Code::POST, 0x1234, vec![0xde, 0xad])
            .with_uri_path("raft/append")
            .with_option(OPTION_BLOCK1, BlockOption { number: 2, more: true, size: 256 }.encode())
            .with_payload(vec![0x01; 256]);
        let decoded = Message::decode(&msg.encode())?;
        assert_eq!(decoded, msg);
        assert_eq!(decoded.uri_path(), "raft/append");
        assert_eq!(
            decoded.block1()?,
            Some(BlockOption { number: 2, more: true, size: 256 })
        );
        Ok(())
    }

    #[test]
    fn roundtrip_response() -> Result<()> {
        let msg = Message::new(Type::Acknowledgement, Code::CONTENT, 7, vec![1])
            .with_payload(b"response".to_vec());
        assert_eq!(Message::decode(&msg.encode())?, msg);
        Ok(())
    }

    #[test]
    fn roundtrip_empty_ack_and_reset() -> Result<()> {
        assert_eq!(Message::decode(&Message::ack(42).encode())?, Message::ack(42));
        assert_eq!(Message::decode(&Message::reset(43).encode())?, Message::reset(43));
        Ok(())
    }

    #[test]
    fn roundtrip_large_option_number() -> Result<()> {
        // Option numbers above 268 need the 2-byte extended encoding.
        let msg = Message::new(Type::Confirmable, Code::GET, 1, vec![])
            .with_option(2048, vec![0xab]);
        assert_eq!(Message::decode(&msg.encode())?, msg);
        Ok(())
    }

    /// Malformed datagrams must yield errors, not panics.
    #[test]
    fn rejects_malformed() {
        // Truncated header.
        assert!(Message::decode(&[0x40, 0x01]).is_err());
        // Bad version (0).
        assert!(Message::decode(&[0x00, 0x01, 0x00, 0x01]).is_err());
        // Token length 9 exceeds the maximum of 8.
        assert!(Message::decode(&[0x49, 0x01, 0x00, 0x01]).is_err());
        // Token truncated (claims 2 bytes, has none).
        assert!(Message::decode(&[0x42, 0x01, 0x00, 0x01]).is_err());
        // Reserved code class 7.
        assert!(Message::decode(&[0x40, 0xff, 0x00, 0x01]).is_err());
        // Reserved option nibble 15 that isn't a payload marker.
        assert!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xf1, 0x00]).is_err());
        // Option header claims an extended delta byte that's missing.
        assert!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xd0]).is_err());
        // Option value truncated (length 5, one byte present).
        assert!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0x05, 0xaa]).is_err());
        // Payload marker with no payload.
        assert!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xff]).is_err());
        // Empty code with a payload.
        assert!(Message::decode(&[0x60, 0x00, 0x00, 0x01, 0xff, 0x01]).is_err());
    }

    #[test]
    fn fuzzes_without_panicking() {
        // Decoding arbitrary bytes must never panic. Not a substitute for a
        // real fuzzer, but catches gross offset bugs.
        use rand::RngCore as _;
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; 64];
        for _ in 0..1000 {
            rng.fill_bytes(&mut buf);
            let len = (rng.next_u32() as usize) % buf.len();
            let _ = Message::decode(&buf[..len]);
        }
    }
}
