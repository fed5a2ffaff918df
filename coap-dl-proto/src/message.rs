//! CoAP message wire format (RFC 7252 §3)

use std::{borrow::Cow, fmt};

use bytes::BufMut;
use rand::RngCore;
use thiserror::Error;

use crate::{
    block::{BlockInfo, MAX_HEADER_SIZE, MAX_TOKEN_LEN, PAYLOAD_MARKER_SIZE},
    coding::{self, BufMutExt, Codec, UnexpectedEnd},
};

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xff;

/// Option numbers used by block-wise GET
pub mod opt {
    /// Resource identity validator
    pub const ETAG: u16 = 4;
    /// One segment of the request path
    pub const URI_PATH: u16 = 11;
    /// One argument of the request query
    pub const URI_QUERY: u16 = 15;
    /// Block-wise transfer of the response payload
    pub const BLOCK2: u16 = 23;
}

/// Message type carried in the header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MsgType {
    /// Requires an acknowledgement
    Confirmable = 0,
    /// Fire and forget
    NonConfirmable = 1,
    /// Acknowledges a confirmable message, possibly carrying a piggybacked response
    Acknowledgement = 2,
    /// Rejects a message the receiver could not process
    Reset = 3,
}

impl MsgType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// Request method or response code, `class.detail`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Code(u8);

impl Code {
    /// Build a code from its class (0-7) and detail (0-31)
    pub const fn new(class: u8, detail: u8) -> Self {
        Self((class & 0x7) << 5 | (detail & 0x1f))
    }

    /// The `c` in `c.dd`
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The `dd` in `c.dd`
    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }
}

impl From<u8> for Code {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

impl From<Code> for u8 {
    fn from(x: Code) -> u8 {
        x.0
    }
}

macro_rules! codes {
    {$($name:ident($class:expr, $detail:expr) $desc:expr;)*} => {
        impl Code {
            $(#[doc = $desc] pub const $name: Self = Self::new($class, $detail);)*

            fn description(self) -> Option<&'static str> {
                match self {
                    $(Self::$name => Some($desc),)*
                    _ => None,
                }
            }
        }
    }
}

codes! {
    EMPTY(0, 0) "Empty";
    GET(0, 1) "GET";
    CONTENT(2, 5) "Content";
    VALID(2, 3) "Valid";
    BAD_REQUEST(4, 0) "Bad Request";
    UNAUTHORIZED(4, 1) "Unauthorized";
    BAD_OPTION(4, 2) "Bad Option";
    FORBIDDEN(4, 3) "Forbidden";
    NOT_FOUND(4, 4) "Not Found";
    METHOD_NOT_ALLOWED(4, 5) "Method Not Allowed";
    NOT_ACCEPTABLE(4, 6) "Not Acceptable";
    REQUEST_ENTITY_INCOMPLETE(4, 8) "Request Entity Incomplete";
    PRECONDITION_FAILED(4, 12) "Precondition Failed";
    REQUEST_ENTITY_TOO_LARGE(4, 13) "Request Entity Too Large";
    INTERNAL_SERVER_ERROR(5, 0) "Internal Server Error";
    NOT_IMPLEMENTED(5, 1) "Not Implemented";
    SERVICE_UNAVAILABLE(5, 3) "Service Unavailable";
    GATEWAY_TIMEOUT(5, 4) "Gateway Timeout";
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({}.{:02})", self.class(), self.detail())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())?;
        if let Some(desc) = self.description() {
            write!(f, " {desc}")?;
        }
        Ok(())
    }
}

/// Request/response correlation token, up to 8 bytes
#[derive(Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token {
    len: u8,
    bytes: [u8; MAX_TOKEN_LEN],
}

impl Token {
    /// Copy a token out of `bytes`, which must be at most 8 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_TOKEN_LEN {
            return None;
        }
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_TOKEN_LEN],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        Some(res)
    }

    /// Generate a full-length random token
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut res = Self {
            len: MAX_TOKEN_LEN as u8,
            bytes: [0; MAX_TOKEN_LEN],
        };
        rng.fill_bytes(&mut res.bytes);
        res
    }

    /// The raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(")?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(")")
    }
}

/// Everything that ties a response to the request that caused it
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MsgIdentity {
    /// Message ID, matched by acknowledgements and resets
    pub msg_id: u16,
    /// Token, matched by responses
    pub token: Token,
}

/// Hands out a fresh identity for each new request
#[derive(Debug)]
pub(crate) struct IdSource {
    next_msg_id: u16,
}

impl IdSource {
    pub(crate) fn new<R: RngCore>(rng: &mut R) -> Self {
        Self {
            next_msg_id: rng.next_u32() as u16,
        }
    }

    pub(crate) fn next<R: RngCore>(&mut self, rng: &mut R) -> MsgIdentity {
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        MsgIdentity {
            msg_id,
            token: Token::random(rng),
        }
    }
}

/// A decoded view of a message held in some receive buffer
#[derive(Debug, Clone)]
pub struct Message<'a> {
    ty: MsgType,
    code: Code,
    msg_id: u16,
    token: &'a [u8],
    options: &'a [u8],
    payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// Decode and validate the structure of a datagram
    pub fn decode(mut data: &'a [u8]) -> Result<Self, DecodeError> {
        let first = u8::decode(&mut data)?;
        if first >> 6 != VERSION {
            return Err(DecodeError::UnsupportedVersion(first >> 6));
        }
        let ty = MsgType::from_bits(first >> 4);
        let token_len = (first & 0xf) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(DecodeError::InvalidTokenLength(token_len));
        }
        let code = Code(u8::decode(&mut data)?);
        let msg_id = u16::decode(&mut data)?;
        let token = coding::take(&mut data, token_len)?;

        if code == Code::EMPTY && (token_len != 0 || !data.is_empty()) {
            return Err(DecodeError::NonEmptyEmptyMessage);
        }

        let options_start = data;
        let mut number = 0;
        while let Some(&byte) = data.first() {
            if byte == PAYLOAD_MARKER {
                break;
            }
            number = read_option(&mut data, number)?.0;
        }
        let options = &options_start[..options_start.len() - data.len()];

        let payload = match data.split_first() {
            Some((_, payload)) if payload.is_empty() => return Err(DecodeError::EmptyPayload),
            Some((_, payload)) => payload,
            None => &[],
        };

        Ok(Self {
            ty,
            code,
            msg_id,
            token,
            options,
            payload,
        })
    }

    /// Message type
    pub fn ty(&self) -> MsgType {
        self.ty
    }

    /// Method or response code
    pub fn code(&self) -> Code {
        self.code
    }

    /// Message ID
    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Raw token
    pub fn token(&self) -> &'a [u8] {
        self.token
    }

    /// Whether this message carries the token of `identity`
    pub fn token_matches(&self, identity: &MsgIdentity) -> bool {
        self.token == identity.token.as_bytes()
    }

    /// Payload following the options, empty if absent
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Iterate over `(number, value)` of every option, in wire order
    pub fn options(&self) -> OptionIter<'a> {
        OptionIter {
            data: self.options,
            number: 0,
        }
    }

    /// Find the only occurrence of option `number`
    ///
    /// Returns `Ok(None)` if the option is absent and `Err` if it repeats.
    pub fn unique_option(&self, number: u16) -> Result<Option<&'a [u8]>, DuplicateOption> {
        let mut found = self
            .options()
            .skip_while(|&(n, _)| n != number)
            .take_while(|&(n, _)| n == number)
            .map(|(_, value)| value);
        let first = found.next();
        if found.next().is_some() {
            return Err(DuplicateOption(number));
        }
        Ok(first)
    }
}

/// Iterator over the options of a [`Message`]
#[derive(Debug, Clone)]
pub struct OptionIter<'a> {
    data: &'a [u8],
    number: u16,
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        // Validated by `Message::decode`
        let (number, value) = read_option(&mut self.data, self.number).ok()?;
        self.number = number;
        Some((number, value))
    }
}

fn read_option<'a>(data: &mut &'a [u8], prev: u16) -> Result<(u16, &'a [u8]), DecodeError> {
    let header = u8::decode(data)?;
    let delta = read_extended(header >> 4, data)?;
    let len = read_extended(header & 0xf, data)?;
    let number = u16::try_from(prev as u32 + delta).map_err(|_| DecodeError::InvalidOption)?;
    let value = coding::take(data, len as usize)?;
    Ok((number, value))
}

fn read_extended(nibble: u8, data: &mut &[u8]) -> Result<u32, DecodeError> {
    Ok(match nibble {
        0..=12 => nibble as u32,
        13 => u8::decode(data)? as u32 + 13,
        14 => u16::decode(data)? as u32 + 269,
        _ => return Err(DecodeError::InvalidOption),
    })
}

fn extended_len(value: u32) -> usize {
    match value {
        0..=12 => 0,
        13..=268 => 1,
        _ => 2,
    }
}

fn write_option_header<B: BufMut>(delta: u32, len: u32, buf: &mut B) {
    fn nibble(value: u32) -> u8 {
        match value {
            0..=12 => value as u8,
            13..=268 => 13,
            _ => 14,
        }
    }
    buf.write(nibble(delta) << 4 | nibble(len));
    for value in [delta, len] {
        match value {
            0..=12 => {}
            13..=268 => buf.write((value - 13) as u8),
            _ => buf.write((value - 269) as u16),
        }
    }
}

/// Assembles an outgoing message
#[derive(Debug, Clone)]
pub struct MessageBuilder<'a> {
    ty: MsgType,
    code: Code,
    identity: MsgIdentity,
    options: Vec<(u16, Cow<'a, [u8]>)>,
    payload: &'a [u8],
}

impl<'a> MessageBuilder<'a> {
    /// Start a message without options or payload
    pub fn new(ty: MsgType, code: Code, identity: MsgIdentity) -> Self {
        Self {
            ty,
            code,
            identity,
            options: Vec::new(),
            payload: &[],
        }
    }

    /// An empty message (code 0.00, no token) such as a bare acknowledgement
    pub fn empty(ty: MsgType, msg_id: u16) -> Self {
        Self::new(
            ty,
            Code::EMPTY,
            MsgIdentity {
                msg_id,
                token: Token::default(),
            },
        )
    }

    /// Add an option; options with equal numbers keep their insertion order
    pub fn option(&mut self, number: u16, value: impl Into<Cow<'a, [u8]>>) -> &mut Self {
        let pos = self.options.partition_point(|&(n, _)| n <= number);
        self.options.insert(pos, (number, value.into()));
        self
    }

    /// Add a Block2 option
    pub fn block2(&mut self, block: &BlockInfo) -> &mut Self {
        let mut value = Vec::with_capacity(block.encoded_len());
        block.encode(&mut value);
        self.option(opt::BLOCK2, value)
    }

    /// Set the payload
    pub fn payload(&mut self, payload: &'a [u8]) -> &mut Self {
        self.payload = payload;
        self
    }

    /// Exact number of bytes `encode` will write
    pub fn encoded_len(&self) -> usize {
        let mut len = MAX_HEADER_SIZE + self.identity.token.as_bytes().len();
        let mut prev = 0;
        for (number, value) in &self.options {
            let delta = (number - prev) as u32;
            len += 1 + extended_len(delta) + extended_len(value.len() as u32) + value.len();
            prev = *number;
        }
        if !self.payload.is_empty() {
            len += PAYLOAD_MARKER_SIZE + self.payload.len();
        }
        len
    }

    /// Serialize into the front of `out`, returning the number of bytes written
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        let len = self.encoded_len();
        if len > out.len() {
            return Err(EncodeError::TooLarge {
                needed: len,
                capacity: out.len(),
            });
        }
        let mut buf = &mut out[..len];
        let token = self.identity.token.as_bytes();
        buf.write(VERSION << 6 | (self.ty as u8) << 4 | token.len() as u8);
        buf.write(self.code.0);
        buf.write(self.identity.msg_id);
        buf.put_slice(token);
        let mut prev = 0;
        for (number, value) in &self.options {
            write_option_header((number - prev) as u32, value.len() as u32, &mut buf);
            buf.put_slice(value);
            prev = *number;
        }
        if !self.payload.is_empty() {
            buf.write(PAYLOAD_MARKER);
            buf.put_slice(self.payload);
        }
        debug_assert!(buf.is_empty(), "encoded_len disagrees with encode");
        Ok(len)
    }
}

/// Reasons a datagram is not a well-formed message
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// Datagram ended in the middle of a field
    #[error("truncated message")]
    UnexpectedEnd,
    /// Header names a protocol version other than 1
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    /// TKL field exceeds 8
    #[error("invalid token length {0}")]
    InvalidTokenLength(usize),
    /// Reserved nibble value or option number overflow
    #[error("malformed option")]
    InvalidOption,
    /// A payload marker with nothing after it
    #[error("payload marker followed by empty payload")]
    EmptyPayload,
    /// Code 0.00 with a token, options or payload
    #[error("empty message with content")]
    NonEmptyEmptyMessage,
}

impl From<UnexpectedEnd> for DecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// Failure to serialize a message
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum EncodeError {
    /// The output buffer cannot hold the message
    #[error("message needs {needed} bytes, buffer holds {capacity}")]
    TooLarge {
        /// Bytes the message needs
        needed: usize,
        /// Bytes the buffer holds
        capacity: usize,
    },
}

/// An option expected at most once appeared several times
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("option {0} repeated")]
pub struct DuplicateOption(pub u16);
