//! Inbound block handling and payload reassembly.
//!
//! Every handler here processes exactly one incoming message and produces a
//! [`StepResult`]: the outcome to report, at most one message to put on the
//! wire, and at most one fully reassembled message to hand to the upper
//! layer. The handlers never touch a sink themselves; the engine applies the
//! step so all sends go through one gate.
//!
//! Request bodies arrive through the request-direction option and are
//! acknowledged block by block with 2.31 Continue; response bodies are pulled
//! by the receiver with one GET per block. Sequence errors and oversized
//! blocks reset the affected direction and surface as
//! [`ReassemblyOutcome::Incomplete`] / [`ReassemblyOutcome::TooLarge`]
//! carrying the stored original message; composing the 4.08/4.13 reply is the
//! caller's job. Duplicates are re-acknowledged without touching the
//! accumulation buffer.

use ca_message::{BlockOption, Message, ResponseCode};
use tracing::{debug, trace, warn};

use crate::block::{BlockId, BlockKind};
use crate::classify::{classify, BlockCheck};
use crate::error::{BlockwiseError, Result};
use crate::fragment::{build_block, continue_reply, next_block_request, reply_kind};
use crate::negotiate::negotiate;
use crate::store::BlockStore;

/// What one inbound message amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// Empty ACK for a transfer that still has blocks in flight.
    TransferPulse,
    /// Empty or reset message for an exchange with nothing left in flight;
    /// the record is gone.
    RequestTimeout,
    /// An intermediate request block was stored and acknowledged.
    RequestBlock,
    /// The final request block arrived; the reassembled request went up.
    RequestLastBlock,
    /// A peer opened a pull for our response before we stored one; the
    /// request went up so the application can produce it.
    FirstBlock,
    /// A peer pulled one block of our stored response.
    Request,
    /// The peer acknowledged a block of ours, or delivered an intermediate
    /// response block; the next message is on the wire.
    Response,
    /// The final response block arrived; the reassembled response went up.
    LastBlock,
    /// A 4.08 condition: the transfer restarted from block zero.
    Incomplete { original: Message },
    /// A 4.13 condition: the transfer restarted at a smaller block size.
    TooLarge { original: Message },
    /// The message takes no part in blockwise transfer.
    NotBlockwise,
}

/// One handler step: outcome plus at most one wire message and one delivery.
#[derive(Debug, Clone)]
pub(crate) struct StepResult {
    pub outcome: ReassemblyOutcome,
    pub send: Option<Message>,
    pub deliver: Option<Message>,
}

impl StepResult {
    fn none(outcome: ReassemblyOutcome) -> Self {
        Self {
            outcome,
            send: None,
            deliver: None,
        }
    }

    fn send(outcome: ReassemblyOutcome, message: Message) -> Self {
        Self {
            outcome,
            send: Some(message),
            deliver: None,
        }
    }

    fn deliver(outcome: ReassemblyOutcome, message: Message) -> Self {
        Self {
            outcome,
            send: None,
            deliver: Some(message),
        }
    }
}

/// Handles one request block: classify, accumulate, acknowledge.
pub(crate) fn receive_request_block1(
    store: &BlockStore,
    default_size_exp: u8,
    max_frame_size: usize,
    message: &Message,
    option: BlockOption,
) -> Result<StepResult> {
    let id = BlockId::from_message(message)?;
    store.create_or_get(&id, message, default_size_exp);
    let overhead = message.encoded_overhead();

    let step = store
        .with_record(&id, |record| -> Result<StepResult> {
            record.set_direction_once(BlockKind::Block1);
            if let Some(total) = message.size1 {
                record.set_declared_total(total);
            }

            let check = classify(
                record,
                &option,
                message.payload.len(),
                BlockKind::Block1,
                overhead,
                max_frame_size,
                default_size_exp,
            );
            match check {
                BlockCheck::Ok => {
                    record.append_payload(&message.payload)?;
                    let mut agreed = option;
                    negotiate(
                        record.block(BlockKind::Block1),
                        &mut agreed,
                        BlockKind::Block1,
                        true,
                    );
                    record.set_block(BlockKind::Block1, agreed);

                    if agreed.more {
                        trace!("request block {} stored for {id}", agreed.num);
                        Ok(StepResult::send(
                            ReassemblyOutcome::RequestBlock,
                            continue_reply(message, agreed),
                        ))
                    } else {
                        debug!(
                            "request reassembled for {id}: {} bytes",
                            record.accumulated_len()
                        );
                        let mut complete = message.clone();
                        complete.payload = record.accumulated().to_vec();
                        complete.block1 = None;
                        complete.size1 = None;
                        Ok(StepResult::deliver(
                            ReassemblyOutcome::RequestLastBlock,
                            complete,
                        ))
                    }
                }
                BlockCheck::AlreadyReceived => {
                    // retransmit: re-acknowledge without touching the buffer
                    let mut echo = option;
                    echo.size_exp = record.block(BlockKind::Block1).size_exp;
                    Ok(StepResult::send(
                        ReassemblyOutcome::RequestBlock,
                        continue_reply(message, echo),
                    ))
                }
                BlockCheck::Incomplete => {
                    // caller composes the 4.08 reply from the original
                    record.reset_direction(BlockKind::Block1);
                    Ok(StepResult::none(ReassemblyOutcome::Incomplete {
                        original: record.original().clone(),
                    }))
                }
                BlockCheck::TooLarge => {
                    // the classifier already shrank the record's block size;
                    // caller composes the 4.13 reply
                    record.reset_direction(BlockKind::Block1);
                    Ok(StepResult::none(ReassemblyOutcome::TooLarge {
                        original: record.original().clone(),
                    }))
                }
            }
        })
        .ok_or_else(|| BlockwiseError::UnknownExchange(id.to_string()))??;

    store.reset_ttl(&id);
    Ok(step)
}

/// Handles the acknowledgement of one of our request blocks.
///
/// Returns `None` when the request body is fully acknowledged and the same
/// message opens the response body, so the caller continues with the
/// response-direction handler.
pub(crate) fn receive_response_block1(
    store: &BlockStore,
    message: &Message,
    option: BlockOption,
) -> Result<Option<StepResult>> {
    let id = BlockId::from_message(message)?;

    if !option.more {
        if message.block2.is_some() {
            // request body done; the response body starts in this message.
            // Only the request-direction counter goes back to zero, the
            // response-direction state is untouched.
            store.with_record(&id, |record| {
                let mut opt = record.block(BlockKind::Block1);
                opt.num = 0;
                record.set_block(BlockKind::Block1, opt);
            });
            return Ok(None);
        }
        debug!("request body acknowledged in full for {id}");
        let mut complete = message.clone();
        complete.block1 = None;
        complete.size1 = None;
        store.remove(&id);
        return Ok(Some(StepResult::deliver(
            ReassemblyOutcome::LastBlock,
            complete,
        )));
    }

    let step = store
        .with_record(&id, |record| {
            let stored = record.block(BlockKind::Block1);
            let mut acked = option;
            negotiate(stored, &mut acked, BlockKind::Block1, false);
            if acked.num < stored.num {
                trace!("stale acknowledgement for block {} on {id}", acked.num);
                return StepResult::none(ReassemblyOutcome::TransferPulse);
            }

            record.set_block(
                BlockKind::Block1,
                BlockOption::new(acked.num + 1, false, acked.size_exp),
            );
            let mut next = build_block(record, BlockKind::Block1);
            next.kind = reply_kind(message.kind);
            next.message_id = 0;
            StepResult::send(ReassemblyOutcome::Response, next)
        })
        .ok_or_else(|| BlockwiseError::UnknownExchange(id.to_string()))?;

    store.reset_ttl(&id);
    Ok(Some(step))
}

/// Handles a peer pulling one block of our response.
pub(crate) fn receive_request_block2(
    store: &BlockStore,
    default_size_exp: u8,
    message: &Message,
    option: BlockOption,
) -> Result<StepResult> {
    let id = BlockId::from_message(message)?;

    let serving = store
        .with_record(&id, |record| record.original().is_response())
        .unwrap_or(false);

    if serving {
        let (step, done) = store
            .with_record(&id, |record| {
                record.set_direction_once(BlockKind::Block2);
                let mut wanted = option;
                negotiate(
                    record.block(BlockKind::Block2),
                    &mut wanted,
                    BlockKind::Block2,
                    true,
                );
                record.set_block(
                    BlockKind::Block2,
                    BlockOption::new(wanted.num, false, wanted.size_exp),
                );

                let mut block = build_block(record, BlockKind::Block2);
                block.kind = reply_kind(message.kind);
                block.message_id = message.message_id;
                let done = !record.block(BlockKind::Block2).more;
                (StepResult::send(ReassemblyOutcome::Request, block), done)
            })
            .ok_or_else(|| BlockwiseError::UnknownExchange(id.to_string()))?;

        if done {
            debug!("response fully served for {id}");
            store.remove(&id);
        } else {
            store.reset_ttl(&id);
        }
        return Ok(step);
    }

    // nothing stored to serve yet: remember the negotiated size and pass the
    // request up so the application produces the response
    remember_response_block_size(store, default_size_exp, message, option)?;
    store.reset_ttl(&id);
    Ok(StepResult::deliver(
        ReassemblyOutcome::FirstBlock,
        message.clone(),
    ))
}

/// Records the response block size a request asks for, so the response
/// starts fragmenting at the negotiated size. Also covers a size preference
/// riding on a request block.
pub(crate) fn remember_response_block_size(
    store: &BlockStore,
    default_size_exp: u8,
    message: &Message,
    option: BlockOption,
) -> Result<()> {
    let id = BlockId::from_message(message)?;
    store.create_or_get(&id, message, default_size_exp);
    store.with_record(&id, |record| {
        record.set_direction_once(BlockKind::Block2);
        let mut wanted = option;
        negotiate(
            record.block(BlockKind::Block2),
            &mut wanted,
            BlockKind::Block2,
            true,
        );
        record.set_block(BlockKind::Block2, BlockOption::new(0, false, wanted.size_exp));
    });
    Ok(())
}

/// Handles one block of a response body we are pulling from the peer.
pub(crate) fn receive_response_block2(
    store: &BlockStore,
    default_size_exp: u8,
    max_frame_size: usize,
    message: &Message,
    option: BlockOption,
) -> Result<StepResult> {
    let id = BlockId::from_message(message)?;
    store.create_or_get(&id, message, default_size_exp);
    let overhead = message.encoded_overhead();

    let (step, done) = store
        .with_record(&id, |record| -> Result<(StepResult, bool)> {
            record.set_direction_once(BlockKind::Block2);
            if let Some(total) = message.size2 {
                record.set_declared_total(total);
            }

            let stored = record.block(BlockKind::Block2);
            let mut incoming = option;
            negotiate(stored, &mut incoming, BlockKind::Block2, false);

            let check = classify(
                record,
                &incoming,
                message.payload.len(),
                BlockKind::Block2,
                overhead,
                max_frame_size,
                default_size_exp,
            );
            match check {
                BlockCheck::Ok => {
                    record.append_payload(&message.payload)?;
                    if incoming.more {
                        let next =
                            BlockOption::new(incoming.num + 1, false, incoming.size_exp);
                        record.set_block(BlockKind::Block2, next);
                        trace!("pulling response block {} for {id}", next.num);
                        Ok((
                            StepResult::send(
                                ReassemblyOutcome::Response,
                                next_block_request(message, next),
                            ),
                            false,
                        ))
                    } else {
                        debug!(
                            "response reassembled for {id}: {} bytes",
                            record.accumulated_len()
                        );
                        let mut complete = message.clone();
                        complete.payload = record.accumulated().to_vec();
                        complete.block2 = None;
                        complete.size2 = None;
                        Ok((
                            StepResult::deliver(ReassemblyOutcome::LastBlock, complete),
                            true,
                        ))
                    }
                }
                BlockCheck::AlreadyReceived => {
                    // ask again for the block we actually expect
                    let expected = record.block(BlockKind::Block2);
                    Ok((
                        StepResult::send(
                            ReassemblyOutcome::Response,
                            next_block_request(message, expected),
                        ),
                        false,
                    ))
                }
                BlockCheck::Incomplete => {
                    // caller reports 4.08; the cleared direction lets the
                    // pull restart from block zero
                    record.reset_direction(BlockKind::Block2);
                    Ok((
                        StepResult::none(ReassemblyOutcome::Incomplete {
                            original: record.original().clone(),
                        }),
                        false,
                    ))
                }
                BlockCheck::TooLarge => {
                    // next attempt resumes at the size the classifier shrank
                    // the record to
                    record.reset_direction(BlockKind::Block2);
                    Ok((
                        StepResult::none(ReassemblyOutcome::TooLarge {
                            original: record.original().clone(),
                        }),
                        false,
                    ))
                }
            }
        })
        .ok_or_else(|| BlockwiseError::UnknownExchange(id.to_string()))??;

    if done {
        store.remove(&id);
    } else {
        store.reset_ttl(&id);
    }
    Ok(step)
}

/// Handles a 4.08/4.13 response to a transfer we are driving: the affected
/// direction restarts from block zero, at a smaller size for 4.13.
pub(crate) fn handle_error_response(
    store: &BlockStore,
    message: &Message,
    code: ResponseCode,
) -> Result<StepResult> {
    let id = BlockId::from_message(message)?;

    let step = store
        .with_record(&id, |record| -> Result<StepResult> {
            let kind = record
                .direction()
                .ok_or_else(|| BlockwiseError::NoDirection(id.to_string()))?;

            if code == ResponseCode::RequestEntityTooLarge {
                if let Some(hint) = message.block_option(kind.is_request_direction()) {
                    if hint.size_exp < record.block(kind).size_exp {
                        record.shrink_block_size(hint.size_exp);
                    }
                }
            }
            warn!("peer reported {code:?} for {id}, restarting from block 0");
            record.reset_direction(kind);

            let mut retry = build_block(record, kind);
            retry.kind = reply_kind(message.kind);
            retry.message_id = 0;

            let original = record.original().clone();
            let outcome = if code == ResponseCode::RequestEntityTooLarge {
                ReassemblyOutcome::TooLarge { original }
            } else {
                ReassemblyOutcome::Incomplete { original }
            };
            Ok(StepResult {
                outcome,
                send: Some(retry),
                deliver: None,
            })
        })
        .ok_or_else(|| BlockwiseError::UnknownExchange(id.to_string()))??;

    store.reset_ttl(&id);
    Ok(step)
}
