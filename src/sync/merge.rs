//! Merge Engine - reconciles the server list with local dirty records
//!
//! Rules, applied per account key:
//! - Local record absent on the server: kept unless it is a tombstone
//! - Present on both: the local record wins only if it changed after the
//!   server snapshot time; a winning tombstone removes the key
//! - Server record with no local dirty counterpart: passed through unchanged
//! - Live local record with a blank secret: never wins
//!
//! Records are resolved whole. Two devices editing different fields of the
//! same account do not combine; the later writer wins.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::db::{Account, AccountKey, SyncAccount};

/// Outcome for a key present on both sides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local record changed after the snapshot
    KeepLocal,
    /// Server copy is at least as recent
    AcceptRemote,
}

/// Resolve a key held by both sides
pub fn resolve(local: &Account, snapshot_time: DateTime<Utc>) -> Resolution {
    if local.last_change_time > snapshot_time {
        Resolution::KeepLocal
    } else {
        Resolution::AcceptRemote
    }
}

/// Produce the list that should replace both the server and local state.
///
/// Local keys come first in the order they appear in `local_dirty`, then the
/// untouched server entries in server order. Pure and deterministic.
pub fn merge(
    server: &[SyncAccount],
    snapshot_time: DateTime<Utc>,
    local_dirty: &[Account],
) -> Vec<SyncAccount> {
    let mut server_index: HashMap<AccountKey, usize> = HashMap::with_capacity(server.len());
    for (idx, account) in server.iter().enumerate() {
        server_index.entry(account.key()).or_insert(idx);
    }

    let (order, locals) = representatives(local_dirty);
    let mut consumed: HashSet<usize> = HashSet::new();
    let mut merged = Vec::with_capacity(server.len() + order.len());

    for key in &order {
        let local = match locals.get(key) {
            Some(local) => *local,
            None => continue,
        };

        if !local.is_deleted && local.secret.trim().is_empty() {
            // A blank secret is never pushed; the server copy stands if there is one
            log::warn!("Merge: {} has no secret locally, keeping the server copy", key);
            if let Some(&idx) = server_index.get(key) {
                consumed.insert(idx);
                merged.push(server[idx].clone());
            }
            continue;
        }

        match server_index.get(key) {
            None => {
                if !local.is_deleted {
                    merged.push(local.to_sync_account());
                }
            }
            Some(&idx) => {
                consumed.insert(idx);
                match resolve(local, snapshot_time) {
                    Resolution::KeepLocal => {
                        if !local.is_deleted {
                            merged.push(local.to_sync_account());
                        }
                    }
                    Resolution::AcceptRemote => merged.push(server[idx].clone()),
                }
            }
        }
    }

    let mut emitted: HashSet<AccountKey> = order.into_iter().collect();
    for (idx, account) in server.iter().enumerate() {
        if consumed.contains(&idx) {
            continue;
        }
        // Repeated server keys collapse onto the first occurrence
        if !emitted.insert(account.key()) {
            log::debug!("Merge: dropping repeated server entry {}", account.key());
            continue;
        }
        merged.push(account.clone());
    }

    log::debug!(
        "Merge: {} server, {} local dirty -> {} merged",
        server.len(), local_dirty.len(), merged.len()
    );
    merged
}

/// One local record per key: latest change wins, ties prefer the live record
fn representatives(local_dirty: &[Account]) -> (Vec<AccountKey>, HashMap<AccountKey, &Account>) {
    let mut order = Vec::new();
    let mut locals: HashMap<AccountKey, &Account> = HashMap::new();

    for account in local_dirty {
        let key = account.key();
        match locals.get(&key) {
            None => {
                order.push(key.clone());
                locals.insert(key, account);
            }
            Some(current) => {
                let newer = account.last_change_time > current.last_change_time;
                let tie_live = account.last_change_time == current.last_change_time
                    && current.is_deleted
                    && !account.is_deleted;
                if newer || tie_live {
                    locals.insert(key, account);
                }
            }
        }
    }

    (order, locals)
}
