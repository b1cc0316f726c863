//! Deterministic single-master election over the live server set (C5).
//!
//! No quorum, no voting: every server computes this independently over
//! its own `ServerTable`, relying on gossip for convergence (spec §4.4).

use std::time::Duration;

use crate::{
    clock::Timestamp,
    membership::{endpoint_bytes, Endpoint, ServerTable},
};

/// Returns `true` iff, after sweeping expired entries, `self_endpoint`
/// is the live server with the smallest `(registration_time_utc,
/// endpoint_bytes)`.
///
/// A server that sees no peers at all (after sweeping) is still its
/// own minimum, so an isolated or singleton server always declares
/// itself master (spec §4.4 "Isolation").
pub fn is_master(
    self_endpoint: Endpoint,
    server_table: &mut ServerTable,
    now: Timestamp,
    server_ttl: Duration,
) -> bool {
    server_table.sweep_expired(now, server_ttl);
    master_of(server_table) == Some(self_endpoint)
}

/// The current master's endpoint, or `None` if the table has no live
/// entries at all (a server always keeps its own entry present and
/// refreshed, so in practice this is only `None` before `start()`).
pub fn master_of(server_table: &ServerTable) -> Option<Endpoint> {
    server_table
        .snapshot()
        .into_iter()
        .min_by_key(|entry| (entry.registration_time_utc, endpoint_bytes(&entry.endpoint)))
        .map(|entry| entry.endpoint)
}
