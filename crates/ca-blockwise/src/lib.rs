//! # ca-blockwise
//!
//! Blockwise transfer engine for the connectivity layer.
//!
//! Transports in this stack carry at most one frame's worth of data per
//! message, so larger application payloads travel as a sequence of blocks:
//! the request body in the request-direction block option, the response body
//! in the response-direction one. This crate fragments oversized outgoing
//! messages, accumulates incoming blocks per exchange, negotiates the block
//! size down to what both sides accept, and hands fully reassembled messages
//! to the upper layer.
//!
//! ```text
//!  sender                                   receiver
//!    | PUT  block1 0/1/64, size1 200          |
//!    |---------------------------------------->
//!    |            2.31 Continue block1 0/1/64 |
//!    <----------------------------------------|
//!    | PUT  block1 1/1/64                     |
//!    |---------------------------------------->
//!    |                  ...                   |
//!    | PUT  block1 3/0/64                     |
//!    |---------------------------------------->
//!    |                      2.04 Changed      |
//!    <----------------------------------------|
//! ```
//!
//! The entry points live on [`BlockwiseEngine`]: [`BlockwiseEngine::on_outbound`]
//! for messages about to leave, [`BlockwiseEngine::on_inbound`] for messages
//! just parsed, and [`BlockwiseEngine::sweep_expired`] to reap exchanges idle
//! past their TTL. Outgoing blocks reach the wire through the caller's
//! [`FragmentSink`]; reassembled messages surface through its [`DeliverySink`].
//!
//! Each in-flight exchange is keyed by the message token plus the peer port
//! and tracked in a mutex-guarded store; duplicates are ignored, sequence
//! gaps answer with 4.08 and restart the transfer, and blocks too large for
//! the transport frame answer with 4.13 and shrink the negotiated size.

mod block;
mod classify;
mod engine;
mod error;
mod fragment;
mod negotiate;
mod reassemble;
mod store;

pub use block::{BlockId, BlockKind};
pub use classify::BlockCheck;
pub use engine::{
    BlockwiseConfig, BlockwiseEngine, DeliverySink, FragmentOutcome, FragmentSink,
    DEFAULT_BLOCK_SIZE_EXP, DEFAULT_MAX_FRAME_SIZE,
};
pub use error::{BlockwiseError, Result};
pub use reassemble::ReassemblyOutcome;
pub use store::{BlockRecord, BlockStore, DEFAULT_RECORD_TTL};
