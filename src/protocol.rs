//! Binary wire protocol shared by the broker and the client.
//!
//! Three message kinds travel over UDP, each identified by its first byte:
//!
//! - keep-alive: `[0x80]` (an empty datagram is an accepted alternate
//!   encoding of the same meaning)
//! - subscribe: `[0x81, count, (len, utf8-name) * count]`
//! - publish: `[0x82, type, len, utf8-name, value as 4 bytes]`
//!
//! All multi-byte numeric fields are little-endian. The layout is fixed and
//! versionless; anything that does not fit it is rejected with a
//! [`DecodeError`] and dropped by the caller.

pub const OPCODE_KEEP_ALIVE: u8 = 0x80;
pub const OPCODE_SUBSCRIBE: u8 = 0x81;
pub const OPCODE_PUBLISH: u8 = 0x82;

const TYPE_UNKNOWN: u8 = 0;
const TYPE_INT32: u8 = 1;
const TYPE_FLOAT32: u8 = 2;

/// A published value together with its wire type tag.
///
/// The unknown tag is part of the protocol: its 4 value bytes are consumed
/// positionally but the value reads as 0.0, and publishing it overwrites the
/// stored variable to unknown. Whether that is intended upstream behavior or
/// a latent quirk is undecided; it is kept as-is rather than fixed here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Unknown,
    Int32(i32),
    Float32(f32),
}

impl Value {
    /// Numeric reading used by the local shadow and client watchers.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Unknown => 0.0,
            Value::Int32(v) => f64::from(v),
            Value::Float32(v) => f64::from(v),
        }
    }

    /// Zeroes the payload while keeping the type tag.
    pub fn cleared(self) -> Self {
        match self {
            Value::Unknown => Value::Unknown,
            Value::Int32(_) => Value::Int32(0),
            Value::Float32(_) => Value::Float32(0.0),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Value::Unknown => TYPE_UNKNOWN,
            Value::Int32(_) => TYPE_INT32,
            Value::Float32(_) => TYPE_FLOAT32,
        }
    }

    fn payload(self) -> [u8; 4] {
        match self {
            Value::Unknown => [0; 4],
            Value::Int32(v) => v.to_le_bytes(),
            Value::Float32(v) => v.to_le_bytes(),
        }
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    KeepAlive,
    Subscribe { names: Vec<String> },
    Publish { name: String, value: Value },
}

/// Why a datagram could not be decoded.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Decoding would read past the end of the datagram.
    Truncated,
    /// First byte is not one of the three known opcodes.
    UnknownOpcode(u8),
    /// Publish type tag outside 0..=2.
    BadTypeTag(u8),
    /// A variable name is not valid UTF-8.
    BadName,
}

/// Encodes a packet into a datagram.
///
/// Variable names longer than 255 bytes do not fit the one-byte length
/// field; callers keep names short (wire-received names satisfy this by
/// construction).
pub fn encode(packet: &Packet) -> Vec<u8> {
    match packet {
        Packet::KeepAlive => vec![OPCODE_KEEP_ALIVE],
        Packet::Subscribe { names } => {
            debug_assert!(names.len() <= u8::MAX as usize);
            let mut out = vec![OPCODE_SUBSCRIBE, names.len() as u8];
            for name in names {
                push_name(&mut out, name);
            }
            out
        }
        Packet::Publish { name, value } => {
            let mut out = vec![OPCODE_PUBLISH, value.tag()];
            push_name(&mut out, name);
            out.extend_from_slice(&value.payload());
            out
        }
    }
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    debug_assert!(name.len() <= u8::MAX as usize);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

/// Decodes a datagram. Bytes past the end of the message are ignored.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    // An empty datagram is a pure liveness refresh.
    let Some(&opcode) = bytes.first() else {
        return Ok(Packet::KeepAlive);
    };
    let mut cursor = Cursor::new(&bytes[1..]);

    match opcode {
        OPCODE_KEEP_ALIVE => Ok(Packet::KeepAlive),
        OPCODE_SUBSCRIBE => {
            let count = cursor.take_byte()?;
            let mut names = Vec::with_capacity(count as usize);
            for _ in 0..count {
                names.push(cursor.take_name()?);
            }
            Ok(Packet::Subscribe { names })
        }
        OPCODE_PUBLISH => {
            let tag = cursor.take_byte()?;
            let name = cursor.take_name()?;
            let payload = cursor.take_value()?;
            let value = match tag {
                TYPE_UNKNOWN => Value::Unknown,
                TYPE_INT32 => Value::Int32(i32::from_le_bytes(payload)),
                TYPE_FLOAT32 => Value::Float32(f32::from_le_bytes(payload)),
                other => return Err(DecodeError::BadTypeTag(other)),
            };
            Ok(Packet::Publish { name, value })
        }
        other => Err(DecodeError::UnknownOpcode(other)),
    }
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.rest.len() < n {
            return Err(DecodeError::Truncated);
        }
        let (taken, rest) = self.rest.split_at(n);
        self.rest = rest;
        Ok(taken)
    }

    fn take_byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_name(&mut self) -> Result<String, DecodeError> {
        let len = self.take_byte()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::BadName)
    }

    fn take_value(&mut self) -> Result<[u8; 4], DecodeError> {
        let raw = self.take(4)?;
        Ok([raw[0], raw[1], raw[2], raw[3]])
    }
}
