//! Wire packet model and its encode/decode rules.
//!
//! Every packet starts with a zero byte and an opcode byte. RRQ/WRQ carry
//! `filename NUL mode NUL [option NUL value NUL]*`, DATA/ACK a big-endian
//! 16-bit block number, ERROR a 16-bit code plus a NUL-terminated message,
//! OACK the accepted option/value pairs.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TftpError};

/// Header size shared by every packet kind: opcode word plus one more word
/// (block number or error code) or the start of the first string.
pub const MIN_PACKET_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, TftpError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::MalformedPacket(format!(
                "invalid opcode: {}",
                value
            ))),
        }
    }
}

/// RFC 1350 error code points carried by ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Binary transfer without conversion.
    Octet,
    /// Textual transfer with canonical CR+LF line endings on the wire.
    Netascii,
}

impl TransferMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "octet" => Ok(TransferMode::Octet),
            "netascii" => Ok(TransferMode::Netascii),
            _ => Err(TftpError::MalformedPacket(format!(
                "invalid transfer mode: {}",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Octet => "octet",
            TransferMode::Netascii => "netascii",
        }
    }
}

/// A parsed read or write request. Immutable once decoded; the option
/// pairs keep their on-wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: TransferMode,
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<(String, String)> },
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq(_) => Opcode::Rrq,
            Packet::Wrq(_) => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    /// Serialize to raw bytes. Never exceeds 4 bytes plus the negotiated
    /// block size for DATA packets.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MIN_PACKET_SIZE + 512);
        buf.put_u16(self.opcode() as u16);

        match self {
            Packet::Rrq(req) | Packet::Wrq(req) => {
                put_string(&mut buf, &req.filename);
                put_string(&mut buf, req.mode.as_str());
                for (name, value) in &req.options {
                    put_string(&mut buf, name);
                    put_string(&mut buf, value);
                }
            }
            Packet::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(*code as u16);
                put_string(&mut buf, message);
            }
            Packet::Oack { options } => {
                for (name, value) in options {
                    put_string(&mut buf, name);
                    put_string(&mut buf, value);
                }
            }
        }

        buf.to_vec()
    }

    /// Parse a raw datagram. Never allocates beyond the input size.
    pub fn decode(data: &[u8]) -> Result<Packet> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(TftpError::MalformedPacket(format!(
                "packet too small: {} bytes",
                data.len()
            )));
        }

        let mut bytes = BytesMut::from(data);
        let opcode = Opcode::try_from(bytes.get_u16())?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = parse_string(&mut bytes)?;
                let mode = TransferMode::parse(&parse_string(&mut bytes)?)?;
                let options = parse_options(&mut bytes);
                let req = Request {
                    filename,
                    mode,
                    options,
                };
                Ok(match opcode {
                    Opcode::Rrq => Packet::Rrq(req),
                    _ => Packet::Wrq(req),
                })
            }
            Opcode::Data => {
                let block = bytes.get_u16();
                Ok(Packet::Data {
                    block,
                    payload: bytes.to_vec(),
                })
            }
            Opcode::Ack => Ok(Packet::Ack {
                block: bytes.get_u16(),
            }),
            Opcode::Error => {
                let code = ErrorCode::from_u16(bytes.get_u16());
                let message = parse_string(&mut bytes)?;
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => Ok(Packet::Oack {
                options: parse_options(&mut bytes),
            }),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Parse a NUL-terminated string from the buffer, advancing past the
/// terminator. Strings longer than 255 bytes are rejected outright so a
/// hostile request cannot make the decoder scan an arbitrary payload.
fn parse_string(bytes: &mut BytesMut) -> Result<String> {
    const MAX_STRING_LENGTH: usize = 255;

    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("no null terminator found".to_string()))?;

    if null_pos > MAX_STRING_LENGTH {
        return Err(TftpError::MalformedPacket(
            "string too long (exceeds 255 bytes)".to_string(),
        ));
    }

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1);

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| TftpError::MalformedPacket(format!("invalid UTF-8: {}", e)))
}

/// Trailing option/value pairs on RRQ/WRQ and OACK packets. A dangling
/// name with no value is dropped rather than treated as an error.
fn parse_options(bytes: &mut BytesMut) -> Vec<(String, String)> {
    let mut options = Vec::new();

    while bytes.remaining() > 0 {
        let name = match parse_string(bytes) {
            Ok(s) => s,
            Err(_) => break,
        };
        let value = match parse_string(bytes) {
            Ok(s) => s,
            Err(_) => break,
        };
        options.push((name, value));
    }

    options
}
