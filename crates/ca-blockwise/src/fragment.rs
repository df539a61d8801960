//! Outbound fragmentation.
//!
//! Turns one oversized outgoing message into a sequence of block-sized
//! messages, one per call, each gated by the protocol's normal ACK / next
//! request flow. The full application message stays in the record; every
//! block is rebuilt from it so headers and options are preserved across the
//! whole transfer.

use ca_message::{block_size, BlockOption, Code, Message, MessageKind, Method, ResponseCode};
use tracing::{debug, trace};

use crate::block::{BlockId, BlockKind};
use crate::error::Result;
use crate::store::{BlockRecord, BlockStore};

/// What the engine should do with an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutboundDecision {
    /// First block of a blockwise transfer; hand it to the fragment sink.
    Block(Message),
    /// Fits a single block; the caller sends the message unmodified.
    SendWhole,
    /// Reset or multicast message; blockwise transfer does not apply.
    Unsupported,
}

/// Decides whether an outgoing message needs fragmentation and, if so,
/// creates the record and builds block 0.
pub(crate) fn prepare_outbound(
    store: &BlockStore,
    default_size_exp: u8,
    message: &Message,
) -> Result<OutboundDecision> {
    if message.kind == MessageKind::Reset {
        debug!("reset message can't be sent blockwise");
        return Ok(OutboundDecision::Unsupported);
    }
    if message.multicast {
        debug!("multicast message can't be sent blockwise");
        return Ok(OutboundDecision::Unsupported);
    }

    let id = BlockId::from_message(message)?;

    // a response for an exchange we already track replaces the stored
    // original, so continuation blocks are sliced from the real response
    if message.is_response() && store.contains(&id) {
        store.with_record(&id, |record| record.set_original(message.clone()));
    }

    if message.payload.len() <= block_size(default_size_exp) {
        // single-block requests still get a record so a blockwise response
        // can be matched to this exchange later
        if message.is_request() {
            store.create_or_get(&id, message, default_size_exp);
        }
        return Ok(OutboundDecision::SendWhole);
    }

    store.create_or_get(&id, message, default_size_exp);
    let kind = if message.is_request() {
        BlockKind::Block1
    } else {
        BlockKind::Block2
    };

    let block_message = store
        .with_record(&id, |record| {
            record.set_direction_once(kind);
            build_block(record, kind)
        })
        .ok_or_else(|| crate::error::BlockwiseError::UnknownExchange(id.to_string()))?;

    store.reset_ttl(&id);
    trace!("prepared first block for {id}");
    Ok(OutboundDecision::Block(block_message))
}

/// Builds the block message for the record's current counter in `kind`,
/// updating the stored more-bit to match.
///
/// Block 0 additionally carries the size-hint option with the total body
/// length.
pub(crate) fn build_block(record: &mut BlockRecord, kind: BlockKind) -> Message {
    let original = record.original();
    let total = original.payload.len();
    let mut option = record.block(kind);

    let start = option.offset().min(total);
    let end = (start + option.size()).min(total);
    option.more = end < total;

    let mut message = original.clone();
    message.payload = original.payload[start..end].to_vec();
    message.set_block_option(kind.is_request_direction(), option);
    if option.num == 0 {
        message.set_size_option(kind.is_request_direction(), total);
    }

    record.set_block(kind, option);
    message
}

/// Message kind to use when continuing an exchange after `incoming`.
///
/// A confirmable message is answered with an acknowledgement, an
/// acknowledgement is followed by a new confirmable message, anything else
/// continues non-confirmably.
pub(crate) fn reply_kind(incoming: MessageKind) -> MessageKind {
    match incoming {
        MessageKind::Confirmable => MessageKind::Acknowledgement,
        MessageKind::Acknowledgement => MessageKind::Confirmable,
        _ => MessageKind::NonConfirmable,
    }
}

/// Builds the 2.31 Continue reply that acknowledges one request block and
/// asks for the next.
pub(crate) fn continue_reply(incoming: &Message, option: BlockOption) -> Message {
    Message {
        kind: reply_kind(incoming.kind),
        code: Code::Response(ResponseCode::Continue),
        message_id: incoming.message_id,
        token: incoming.token.clone(),
        peer_port: incoming.peer_port,
        multicast: false,
        payload: Vec::new(),
        block1: Some(option),
        block2: None,
        size1: None,
        size2: None,
    }
}

/// Builds the GET that pulls the next response block.
pub(crate) fn next_block_request(incoming: &Message, option: BlockOption) -> Message {
    Message {
        kind: reply_kind(incoming.kind),
        code: Code::Request(Method::Get),
        // fresh exchange leg; the lower layer assigns the real id
        message_id: 0,
        token: incoming.token.clone(),
        peer_port: incoming.peer_port,
        multicast: false,
        payload: Vec::new(),
        block1: None,
        block2: Some(BlockOption::new(option.num, false, option.size_exp)),
        size1: None,
        size2: None,
    }
}
