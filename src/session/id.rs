//! Sortable session identifiers.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use uuid::Uuid;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a session id of the form `YYYYMMDDThhmmss_NNNN_xxxxxxxx`.
///
/// The timestamp makes ids sortable by creation time, the counter keeps
/// them monotone within one second of the same process, and the hex suffix
/// mixes process id with randomness so collisions across processes stay
/// statistical.
pub fn generate_session_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S");
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!("{}_{:04}_{}", timestamp, counter, short_hash())
}

fn short_hash() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) ^ std::process::id();
    format!("{:08x}", word)
}
