//! Exchange identity and block direction.

use std::fmt;

use ca_message::Message;

use crate::error::{BlockwiseError, Result};

/// Which of the two block options a transfer direction uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Request-direction option: the request body is fragmented.
    Block1,
    /// Response-direction option: the response body is fragmented.
    Block2,
}

impl BlockKind {
    /// Whether this kind occupies the request-direction option slot.
    pub fn is_request_direction(&self) -> bool {
        matches!(self, BlockKind::Block1)
    }
}

/// Key identifying one blockwise exchange: token bytes followed by the peer
/// port in big-endian.
///
/// Equality is byte-wise; the id is immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    bytes: Vec<u8>,
}

impl BlockId {
    /// Builds an id from a token and the remote port.
    pub fn new(token: &[u8], peer_port: u16) -> Self {
        let mut bytes = Vec::with_capacity(token.len() + 2);
        bytes.extend_from_slice(token);
        bytes.extend_from_slice(&peer_port.to_be_bytes());
        Self { bytes }
    }

    /// Builds an id from a message's token and peer port.
    ///
    /// Fails for messages with neither request nor response role, since those
    /// never belong to an exchange this engine tracks.
    pub fn from_message(message: &Message) -> Result<Self> {
        if message.is_empty_code() {
            return Err(BlockwiseError::MissingRole);
        }
        Ok(Self::new(&message.token, message.peer_port))
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.bytes))
    }
}
