//! Block size negotiation between peers.
//!
//! Both sides advertise a size exponent in every block option; the smaller of
//! the two always wins. When the winning size is smaller than what a side had
//! been counting blocks in, the *receiving* side rescales its block number so
//! numbering stays consistent with the byte offsets already transferred. The
//! side generating blocks never rescales its own counter; it only caps its
//! outgoing size to the negotiated minimum.

use ca_message::{block_size, BlockOption};
use tracing::debug;

use crate::block::BlockKind;

/// Reconciles an incoming block option with the stored one for its direction.
///
/// `from_request` says whether the message carrying `incoming` is a request.
/// `stored` is the option tracked in the record for `kind`; `incoming` is
/// adjusted in place.
pub(crate) fn negotiate(
    stored: BlockOption,
    incoming: &mut BlockOption,
    kind: BlockKind,
    from_request: bool,
) {
    match kind {
        BlockKind::Block2 => {
            if !from_request {
                // we are receiving response blocks: rescale our counter to the
                // smaller stored size
                if incoming.size_exp > stored.size_exp {
                    let ratio = block_size(incoming.size_exp) / block_size(stored.size_exp);
                    incoming.num += (ratio - 1) as u32;
                    incoming.size_exp = stored.size_exp;
                    debug!("block2 renegotiated: num {}, size_exp {}", incoming.num, incoming.size_exp);
                }
            } else if incoming.size_exp > stored.size_exp {
                // peer asks for more than we agreed to send; cap only
                incoming.size_exp = stored.size_exp;
            }
        }
        BlockKind::Block1 => {
            if !from_request {
                // peer acknowledged our request block at a smaller size
                if incoming.size_exp < stored.size_exp {
                    let ratio = block_size(stored.size_exp) / block_size(incoming.size_exp);
                    incoming.num += (ratio - 1) as u32;
                    debug!("block1 renegotiated: num {}", incoming.num);
                }
            } else if incoming.size_exp > stored.size_exp {
                incoming.size_exp = stored.size_exp;
            }
        }
    }
}
