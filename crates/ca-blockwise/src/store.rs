//! In-flight block transfer records and their store.
//!
//! The store is the only owner of [`BlockRecord`]s. Callers reach a record
//! through closure-scoped access under the table lock and copy out whatever
//! they need; no reference to a stored record ever escapes the lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ca_message::{BlockOption, Message};
use tracing::{debug, trace};

use crate::block::{BlockId, BlockKind};
use crate::error::{BlockwiseError, Result};

/// Inactivity window after which an exchange is reaped.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(60);

/// State of one blockwise exchange.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    id: BlockId,
    /// Active option kind for this exchange; set lazily on first use and
    /// immutable afterwards.
    direction: Option<BlockKind>,
    block1: BlockOption,
    block2: BlockOption,
    /// Payload accumulated so far for the receiving direction.
    payload: Vec<u8>,
    /// Total body length learned from a size-hint option; 0 until known.
    declared_total: usize,
    /// The application message that started the exchange; headers and options
    /// are resent from it on every subsequent block.
    original: Message,
    expires_at: Instant,
}

impl BlockRecord {
    fn new(id: BlockId, original: Message, default_size_exp: u8, expires_at: Instant) -> Self {
        Self {
            id,
            direction: None,
            block1: BlockOption::new(0, false, default_size_exp),
            block2: BlockOption::new(0, false, default_size_exp),
            payload: Vec::new(),
            declared_total: 0,
            original,
            expires_at,
        }
    }

    /// The exchange id.
    pub fn id(&self) -> &BlockId {
        &self.id
    }

    /// Active direction, if established.
    pub fn direction(&self) -> Option<BlockKind> {
        self.direction
    }

    /// Establishes the active direction on first use; later calls keep the
    /// original value.
    pub fn set_direction_once(&mut self, kind: BlockKind) {
        if self.direction.is_none() {
            self.direction = Some(kind);
        }
    }

    /// Block option tracked for one direction.
    pub fn block(&self, kind: BlockKind) -> BlockOption {
        match kind {
            BlockKind::Block1 => self.block1,
            BlockKind::Block2 => self.block2,
        }
    }

    /// Stores the block option for one direction.
    pub fn set_block(&mut self, kind: BlockKind, option: BlockOption) {
        match kind {
            BlockKind::Block1 => self.block1 = option,
            BlockKind::Block2 => self.block2 = option,
        }
    }

    /// Caps both directions to the given size exponent.
    pub fn shrink_block_size(&mut self, size_exp: u8) {
        self.block1.size_exp = size_exp;
        self.block2.size_exp = size_exp;
    }

    /// Bytes accumulated so far.
    pub fn accumulated_len(&self) -> usize {
        self.payload.len()
    }

    /// Accumulated payload bytes.
    pub fn accumulated(&self) -> &[u8] {
        &self.payload
    }

    /// Declared total body length; 0 until learned.
    pub fn declared_total(&self) -> usize {
        self.declared_total
    }

    /// Records the total body length from a size-hint option.
    pub fn set_declared_total(&mut self, total: usize) {
        self.declared_total = total;
    }

    /// Appends one block's payload to the accumulation buffer.
    ///
    /// Reservation failure leaves the buffer untouched.
    pub fn append_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.payload
            .try_reserve(bytes.len())
            .map_err(|_| BlockwiseError::Alloc {
                requested: bytes.len(),
            })?;
        self.payload.extend_from_slice(bytes);
        Ok(())
    }

    /// Clears the accumulation and block counter for one direction so the
    /// exchange can restart cleanly after a 4.08/4.13 condition.
    pub fn reset_direction(&mut self, kind: BlockKind) {
        self.payload.clear();
        match kind {
            BlockKind::Block1 => self.block1.num = 0,
            BlockKind::Block2 => self.block2.num = 0,
        }
    }

    /// The message that started the exchange.
    pub fn original(&self) -> &Message {
        &self.original
    }

    /// Replaces the stored original, e.g. when the application supplies the
    /// response for a blockwise request on the same exchange.
    pub fn set_original(&mut self, message: Message) {
        self.original = message;
    }

    /// Updates the stored message id so empty ACKs can be matched later.
    pub fn set_original_message_id(&mut self, message_id: u16) {
        self.original.message_id = message_id;
    }

    fn touch(&mut self, expires_at: Instant) {
        self.expires_at = expires_at;
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }
}

/// Mutex-guarded table of in-flight exchanges keyed by [`BlockId`].
#[derive(Debug)]
pub struct BlockStore {
    ttl: Duration,
    records: Mutex<HashMap<BlockId, BlockRecord>>,
}

impl BlockStore {
    /// Creates a store with the given inactivity window.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<BlockId, BlockRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Ensures a record exists for `id`; idempotent, a second create for an
    /// existing id keeps the stored record.
    pub fn create_or_get(&self, id: &BlockId, original: &Message, default_size_exp: u8) {
        let mut table = self.table();
        if !table.contains_key(id) {
            debug!("creating block record for {id}");
            let expires_at = Instant::now() + self.ttl;
            table.insert(
                id.clone(),
                BlockRecord::new(id.clone(), original.clone(), default_size_exp, expires_at),
            );
        }
    }

    /// Runs `f` against the record for `id` under the table lock.
    ///
    /// Returns `None` if no record exists. The closure must copy out any data
    /// it needs; the record itself never leaves the lock scope.
    pub fn with_record<R>(
        &self,
        id: &BlockId,
        f: impl FnOnce(&mut BlockRecord) -> R,
    ) -> Option<R> {
        self.table().get_mut(id).map(f)
    }

    /// Whether a record exists for `id`.
    pub fn contains(&self, id: &BlockId) -> bool {
        self.table().contains_key(id)
    }

    /// Drops the record and all owned buffers; removing an absent id is a
    /// no-op.
    pub fn remove(&self, id: &BlockId) {
        if self.table().remove(id).is_some() {
            debug!("removed block record for {id}");
        }
    }

    /// Drops every record; used on shutdown.
    pub fn remove_all(&self) {
        self.table().clear();
    }

    /// Pushes the inactivity deadline of `id` forward by one TTL window.
    pub fn reset_ttl(&self, id: &BlockId) {
        let expires_at = Instant::now() + self.ttl;
        if let Some(record) = self.table().get_mut(id) {
            record.touch(expires_at);
        }
    }

    /// Removes every record whose deadline passed. Reaped exchanges are
    /// dropped silently, like an abandoned exchange on the wire.
    pub fn sweep(&self, now: Instant) {
        self.table().retain(|id, record| {
            if record.expired(now) {
                debug!("reaping timed-out block record for {id}");
                false
            } else {
                true
            }
        });
    }

    /// Finds the token of the exchange whose stored request carries the given
    /// message id. Used to identify empty ACK/RST messages that arrive without
    /// a token; linear scan of the table.
    pub fn token_for_message_id(&self, message_id: u16, peer_port: u16) -> Option<Vec<u8>> {
        let table = self.table();
        for record in table.values() {
            let original = record.original();
            if original.is_request()
                && original.message_id == message_id
                && original.peer_port == peer_port
            {
                trace!("matched empty message {message_id} to {}", record.id());
                return Some(original.token.clone());
            }
        }
        None
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}
