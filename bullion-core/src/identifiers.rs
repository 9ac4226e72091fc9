//! Process-wide generators for human-facing identifiers.
//!
//! Order numbers and ledger entry ids are prefixed counters seeded from the
//! clock, so restarts cannot collide with earlier runs. Global uniqueness is
//! still enforced by the store's unique indexes; these generators only have
//! to be collision-free within a process.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use once_cell::sync::Lazy;

use crate::EntryKind;

static SEQUENCE: Lazy<AtomicU64> = Lazy::new(|| {
    let millis = Utc::now().timestamp_millis().unsigned_abs();
    AtomicU64::new(millis)
});

fn next_raw() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Next client order number (`ORD-` prefixed).
#[must_use]
pub fn next_order_no() -> String {
    format!("ORD-{}", next_raw())
}

/// Next ledger entry id for the given entry family.
#[must_use]
pub fn next_entry_id(kind: EntryKind) -> String {
    let prefix = match kind {
        EntryKind::Order => "ORD",
        EntryKind::LpPosition => "LP",
        EntryKind::Transaction => "TRX",
    };
    format!("{prefix}-{}", next_raw())
}

/// Next deposit/withdrawal transaction id.
#[must_use]
pub fn next_transaction_id() -> String {
    format!("TRX-{}", next_raw())
}

/// Next five-digit account reference. The store rejects duplicates, so the
/// caller retries on conflict.
#[must_use]
pub fn next_ref_mid() -> String {
    format!("{:05}", 10_000 + next_raw() % 90_000)
}
