//! One-shot path size discovery.
//!
//! Tries a fixed ladder of common MTU sizes from the largest down and
//! takes the first one the path accepts.  If the whole ladder fails, a
//! bounded binary search over the same range looks for anything that
//! gets through.

use log::debug;

use crate::transport::ProbeTransport;
use crate::types::Node;

pub const CANDIDATE_SIZES: [usize; 9] = [1500, 1472, 1460, 1400, 1300, 1200, 1000, 800, 576];

const SEARCH_MIN: usize = 576;
const SEARCH_MAX: usize = 1500;
const MAX_SEARCH_STEPS: u32 = 16;

/// Largest payload size that reached `target`, if any did.
pub async fn discover(transport: &dyn ProbeTransport, target: &Node) -> Option<usize> {
    for size in CANDIDATE_SIZES {
        match transport.send_payload(target, size).await {
            Ok(()) => return Some(size),
            Err(e) => debug!("Path size {} to {} rejected: {}", size, target.id, e),
        }
    }
    search(transport, target, SEARCH_MIN, SEARCH_MAX).await
}

async fn search(
    transport: &dyn ProbeTransport,
    target: &Node,
    mut low: usize,
    mut high: usize,
) -> Option<usize> {
    let mut best = None;
    for _ in 0..MAX_SEARCH_STEPS {
        if low > high {
            break;
        }
        let mid = low + (high - low) / 2;
        if transport.send_payload(target, mid).await.is_ok() {
            best = Some(mid);
            low = mid + 1;
        } else if mid == 0 {
            break;
        } else {
            high = mid - 1;
        }
    }
    best
}
