//! Counters for conditions the protocol absorbs rather than surfaces
//! (spec §7: ParseFail is "counted in diagnostics, never surfaced as
//! an error to the caller").

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Diagnostics {
    parse_failures: AtomicU64,
    send_failures: AtomicU64,
}

impl Diagnostics {
    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub parse_failures: u64,
    pub send_failures: u64,
}
