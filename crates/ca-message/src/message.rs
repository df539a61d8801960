//! Parsed protocol message as seen by the connectivity layer.
//!
//! The transport adapters parse raw frames into [`Message`] values before the
//! blockwise engine ever sees them; the engine only reads and writes the typed
//! fields and options exposed here. No wire format is defined in this crate
//! beyond the packed block-option value in [`crate::option`].

use crate::error::{MessageError, Result};
use crate::option::BlockOption;

/// Transport-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Requires an acknowledgement from the peer.
    Confirmable,
    /// Fire-and-forget.
    NonConfirmable,
    /// Acknowledges a confirmable message.
    Acknowledgement,
    /// Rejects a message the peer could not process.
    Reset,
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Response code, `class.detail` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// 2.01
    Created,
    /// 2.02
    Deleted,
    /// 2.03
    Valid,
    /// 2.04
    Changed,
    /// 2.05
    Content,
    /// 2.31 - intermediate block accepted, send the next one.
    Continue,
    /// 4.00
    BadRequest,
    /// 4.04
    NotFound,
    /// 4.08 - blocks arrived out of order or the declared length was wrong.
    RequestEntityIncomplete,
    /// 4.13 - a block exceeded the size the receiver accepts.
    RequestEntityTooLarge,
    /// 5.00
    InternalServerError,
}

impl ResponseCode {
    /// Whether this code reports a client or server error.
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            ResponseCode::Created
                | ResponseCode::Deleted
                | ResponseCode::Valid
                | ResponseCode::Changed
                | ResponseCode::Content
                | ResponseCode::Continue
        )
    }
}

/// Message role: request, response, or empty (ACK/RST without body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// No code at all; pure ACK or RST.
    Empty,
    Request(Method),
    Response(ResponseCode),
}

/// Tokens are limited to 8 bytes by the surrounding protocol.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Fixed header length of an encoded message.
const HEADER_LENGTH: usize = 4;

/// Worst-case encoded length of one block option (delta + length + 3 value bytes).
const BLOCK_OPTION_OVERHEAD: usize = 5;

/// Worst-case encoded length of one size-hint option.
const SIZE_OPTION_OVERHEAD: usize = 6;

/// Payload marker byte.
const PAYLOAD_MARKER: usize = 1;

/// A fully-framed protocol message.
///
/// Option get/set is deliberately primitive: the engine treats the two block
/// options and the two size-hint options as opaque typed slots supplied by the
/// codec, exactly one option per slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub code: Code,
    /// Transport message id; 0 means "not yet assigned by the lower layer".
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Port of the remote endpoint this message came from / goes to.
    pub peer_port: u16,
    /// Multicast destinations never take part in blockwise transfer.
    pub multicast: bool,
    pub payload: Vec<u8>,
    /// Request-direction block option (fragmented request body).
    pub block1: Option<BlockOption>,
    /// Response-direction block option (fragmented response body).
    pub block2: Option<BlockOption>,
    /// Total request body length, sent with the first block1.
    pub size1: Option<usize>,
    /// Total response body length, sent with the first block2.
    pub size2: Option<usize>,
}

impl Message {
    /// Creates a request message.
    pub fn request(method: Method, token: Vec<u8>, peer_port: u16) -> Result<Self> {
        Self::new(MessageKind::Confirmable, Code::Request(method), token, peer_port)
    }

    /// Creates a response message.
    pub fn response(code: ResponseCode, token: Vec<u8>, peer_port: u16) -> Result<Self> {
        Self::new(
            MessageKind::Acknowledgement,
            Code::Response(code),
            token,
            peer_port,
        )
    }

    /// Creates an empty (ACK/RST) message without token or body.
    pub fn empty(kind: MessageKind, message_id: u16, peer_port: u16) -> Self {
        Self {
            kind,
            code: Code::Empty,
            message_id,
            token: Vec::new(),
            peer_port,
            multicast: false,
            payload: Vec::new(),
            block1: None,
            block2: None,
            size1: None,
            size2: None,
        }
    }

    fn new(kind: MessageKind, code: Code, token: Vec<u8>, peer_port: u16) -> Result<Self> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(MessageError::TokenTooLong(token.len()));
        }
        Ok(Self {
            kind,
            code,
            message_id: 0,
            token,
            peer_port,
            multicast: false,
            payload: Vec::new(),
            block1: None,
            block2: None,
            size1: None,
            size2: None,
        })
    }

    /// Whether this message carries a request method.
    pub fn is_request(&self) -> bool {
        matches!(self.code, Code::Request(_))
    }

    /// Whether this message carries a response code.
    pub fn is_response(&self) -> bool {
        matches!(self.code, Code::Response(_))
    }

    /// Whether this is a pure ACK/RST without a code.
    pub fn is_empty_code(&self) -> bool {
        matches!(self.code, Code::Empty)
    }

    /// The response code, if any.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self.code {
            Code::Response(code) => Some(code),
            _ => None,
        }
    }

    /// Returns the block option for one direction slot.
    pub fn block_option(&self, request_direction: bool) -> Option<BlockOption> {
        if request_direction {
            self.block1
        } else {
            self.block2
        }
    }

    /// Sets the block option for one direction slot.
    pub fn set_block_option(&mut self, request_direction: bool, option: BlockOption) {
        if request_direction {
            self.block1 = Some(option);
        } else {
            self.block2 = Some(option);
        }
    }

    /// Returns the size hint for one direction slot.
    pub fn size_option(&self, request_direction: bool) -> Option<usize> {
        if request_direction {
            self.size1
        } else {
            self.size2
        }
    }

    /// Sets the size hint for one direction slot.
    pub fn set_size_option(&mut self, request_direction: bool, total_len: usize) {
        if request_direction {
            self.size1 = Some(total_len);
        } else {
            self.size2 = Some(total_len);
        }
    }

    /// Whether any block option is present.
    pub fn has_block_option(&self) -> bool {
        self.block1.is_some() || self.block2.is_some()
    }

    /// Conservative estimate of the encoded size of everything but the payload.
    ///
    /// Used when deciding whether a block of a given size still fits the
    /// transport's maximum frame.
    pub fn encoded_overhead(&self) -> usize {
        let mut overhead = HEADER_LENGTH + self.token.len();
        if self.block1.is_some() {
            overhead += BLOCK_OPTION_OVERHEAD;
        }
        if self.block2.is_some() {
            overhead += BLOCK_OPTION_OVERHEAD;
        }
        if self.size1.is_some() {
            overhead += SIZE_OPTION_OVERHEAD;
        }
        if self.size2.is_some() {
            overhead += SIZE_OPTION_OVERHEAD;
        }
        overhead + PAYLOAD_MARKER
    }
}
