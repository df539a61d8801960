//! # ca-message
//!
//! Message abstraction for the connectivity layer.
//!
//! Transport adapters parse raw frames into [`Message`] values; upper layers
//! and the blockwise transfer engine operate only on these typed messages.
//! The crate defines:
//!
//! - [`Message`] with its role ([`Code`]), transport kind ([`MessageKind`]),
//!   token, peer port, and payload;
//! - typed option slots for the two block options and the two size-hint
//!   options;
//! - the packed [`BlockOption`] value codec (`num << 4 | m << 3 | szx`).
//!
//! No byte-level frame parsing lives here; that is the transport adapter's
//! job.

mod error;
pub mod message;
pub mod option;

pub use error::{MessageError, Result};

pub use message::{Code, Message, MessageKind, Method, ResponseCode, MAX_TOKEN_LENGTH};

pub use option::{block_size, BlockOption, MAX_SIZE_EXP};
