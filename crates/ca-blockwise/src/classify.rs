//! Error classification for incoming blocks.
//!
//! Every inbound block is checked against the stored record before its
//! payload is merged: sequence gaps and declared-length mismatches map to the
//! 4.08 "incomplete" condition, blocks that cannot fit the transport frame
//! map to 4.13 "too large", and retransmits are flagged so they are ignored
//! without touching the accumulation buffer.

use ca_message::{block_size, BlockOption};
use tracing::{debug, warn};

use crate::block::BlockKind;
use crate::store::BlockRecord;

/// Verdict of the per-block error check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCheck {
    /// Block is in sequence and sized as declared.
    Ok,
    /// Duplicate/retransmitted block; continue silently, do not append.
    AlreadyReceived,
    /// Sequence gap, short payload, or final length mismatch (4.08 class).
    Incomplete,
    /// Block exceeds what the transport frame can carry (4.13 class); the
    /// record has been shrunk to a size that fits.
    TooLarge,
}

/// Classifies one incoming block against the stored record.
///
/// On [`BlockCheck::TooLarge`] the record's size exponent (both directions)
/// is replaced with the largest one that still fits the transport frame, so
/// the next attempt uses it.
pub(crate) fn classify(
    record: &mut BlockRecord,
    incoming: &BlockOption,
    payload_len: usize,
    kind: BlockKind,
    option_overhead: usize,
    max_frame_size: usize,
    default_size_exp: u8,
) -> BlockCheck {
    // sequence check
    match kind {
        BlockKind::Block1 => {
            // request blocks are validated by byte offset
            let expected_offset = incoming.size() * incoming.num as usize;
            if record.accumulated_len() != expected_offset {
                if incoming.num > record.block(kind).num + 1 {
                    warn!("block1 gap: got {}, had {}", incoming.num, record.block(kind).num);
                    return BlockCheck::Incomplete;
                }
                return BlockCheck::AlreadyReceived;
            }
        }
        BlockKind::Block2 => {
            let expected = record.block(kind).num;
            if incoming.num != expected {
                if incoming.num > expected {
                    warn!("block2 gap: got {}, expected {}", incoming.num, expected);
                    return BlockCheck::Incomplete;
                }
                debug!("block {} already received", incoming.num);
                return BlockCheck::AlreadyReceived;
            }
        }
    }

    // intermediate blocks must carry exactly the advertised size
    if incoming.more && payload_len != incoming.size() {
        if max_frame_size < incoming.size() + option_overhead {
            for size_exp in (0..=default_size_exp).rev() {
                if block_size(size_exp) + option_overhead <= max_frame_size {
                    warn!("block too large for frame, shrinking size_exp to {size_exp}");
                    record.shrink_block_size(size_exp);
                    break;
                }
            }
            return BlockCheck::TooLarge;
        }
        warn!(
            "short block payload: {} bytes, block size {}",
            payload_len,
            incoming.size()
        );
        return BlockCheck::Incomplete;
    }

    // last block: accumulated length must match the declared total
    if !incoming.more && record.declared_total() != 0 {
        let received = record.accumulated_len() + payload_len;
        if received != record.declared_total() {
            warn!(
                "total length mismatch: received {received}, declared {}",
                record.declared_total()
            );
            return BlockCheck::Incomplete;
        }
    }

    BlockCheck::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::store::{BlockStore, DEFAULT_RECORD_TTL};
    use ca_message::{BlockOption, Message, Method};

    const MAX_FRAME: usize = 1400;
    const OVERHEAD: usize = 16;

    fn with_record<R>(f: impl FnOnce(&mut BlockRecord) -> R) -> R {
        let store = BlockStore::new(DEFAULT_RECORD_TTL);
        let id = BlockId::new(&[1], 5683);
        let msg = Message::request(Method::Put, vec![1], 5683).unwrap();
        store.create_or_get(&id, &msg, 6);
        store.with_record(&id, f).unwrap()
    }

    #[test]
    fn test_in_sequence_block_is_ok() {
        let check = with_record(|record| {
            classify(
                record,
                &BlockOption::new(0, true, 2),
                64,
                BlockKind::Block1,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(check, BlockCheck::Ok);
    }

    #[test]
    fn test_duplicate_block_detected() {
        let check = with_record(|record| {
            record.append_payload(&[0u8; 64]).unwrap();
            record.set_block(BlockKind::Block1, BlockOption::new(0, true, 2));
            // block 0 again while 64 bytes are already accumulated
            classify(
                record,
                &BlockOption::new(0, true, 2),
                64,
                BlockKind::Block1,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(check, BlockCheck::AlreadyReceived);
    }

    #[test]
    fn test_gap_is_incomplete() {
        let check = with_record(|record| {
            record.append_payload(&[0u8; 64]).unwrap();
            record.set_block(BlockKind::Block1, BlockOption::new(0, true, 2));
            // block 2 skips block 1
            classify(
                record,
                &BlockOption::new(2, true, 2),
                64,
                BlockKind::Block1,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(check, BlockCheck::Incomplete);
    }

    #[test]
    fn test_block2_duplicate_and_gap() {
        let dup = with_record(|record| {
            record.set_block(BlockKind::Block2, BlockOption::new(3, true, 2));
            classify(
                record,
                &BlockOption::new(2, true, 2),
                64,
                BlockKind::Block2,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(dup, BlockCheck::AlreadyReceived);

        let gap = with_record(|record| {
            record.set_block(BlockKind::Block2, BlockOption::new(1, true, 2));
            classify(
                record,
                &BlockOption::new(3, true, 2),
                64,
                BlockKind::Block2,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(gap, BlockCheck::Incomplete);
    }

    #[test]
    fn test_short_payload_is_incomplete() {
        let check = with_record(|record| {
            classify(
                record,
                &BlockOption::new(0, true, 2),
                40, // 64 advertised
                BlockKind::Block1,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(check, BlockCheck::Incomplete);
    }

    #[test]
    fn test_too_large_shrinks_record_size() {
        let (check, new_exp) = with_record(|record| {
            // advertised 1024-byte blocks on a 200-byte frame
            let check = classify(
                record,
                &BlockOption::new(0, true, 6),
                90,
                BlockKind::Block2,
                OVERHEAD,
                200,
                6,
            );
            (check, record.block(BlockKind::Block2).size_exp)
        });
        assert_eq!(check, BlockCheck::TooLarge);
        assert!(new_exp < 6);
        assert!(block_size(new_exp) + OVERHEAD <= 200);
    }

    #[test]
    fn test_final_total_mismatch() {
        let check = with_record(|record| {
            record.set_declared_total(200);
            record.append_payload(&[0u8; 128]).unwrap();
            record.set_block(BlockKind::Block1, BlockOption::new(1, true, 2));
            // last block carries 8 bytes; 128 + 8 != 200
            classify(
                record,
                &BlockOption::new(2, false, 2),
                8,
                BlockKind::Block1,
                OVERHEAD,
                MAX_FRAME,
                6,
            )
        });
        assert_eq!(check, BlockCheck::Incomplete);
    }
}
