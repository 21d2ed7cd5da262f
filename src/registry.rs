//! # Name Registry
//!
//! Tracks ownership of well-known names within a single bus: each name maps
//! to at most one current owner and an ordered queue of connections waiting
//! to take it over. Acquisition is governed by the caller's chosen
//! [`AcquireMode`]; release always promotes the head waiter, if any.

use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};

/// How a connection wants to handle an already-owned name on acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Fail with `AlreadyExists` if another connection already owns it.
    FailIfTaken,
    /// Take over ownership immediately, evicting the current owner.
    ReplaceExisting,
    /// Join the waiter queue; acquire once the current owner releases or
    /// disconnects.
    Queue,
}

/// A single name's current owner and FIFO waiter queue.
#[derive(Debug, Default)]
struct NameEntry {
    owner: Option<u64>,
    waiters: VecDeque<u64>,
}

/// The outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller is now the name's owner.
    Acquired,
    /// The caller was enqueued behind the current owner.
    Queued,
    /// The caller replaced a previous owner, who is returned for the
    /// caller to notify.
    Replaced(u64),
}

/// Well-known name ownership for a single bus. Not internally
/// synchronized: callers hold the owning bus's lock while mutating this.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, NameEntry>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire `name` for `conn_id` under `mode`.
    pub fn acquire(
        &mut self,
        name: &str,
        conn_id: u64,
        mode: AcquireMode,
    ) -> Result<AcquireOutcome> {
        let entry = self.names.entry(name.to_string()).or_default();

        match entry.owner {
            None => {
                entry.owner = Some(conn_id);
                Ok(AcquireOutcome::Acquired)
            }
            Some(owner) if owner == conn_id => Ok(AcquireOutcome::Acquired),
            Some(owner) => match mode {
                AcquireMode::FailIfTaken => Err(Error::AlreadyExists),
                AcquireMode::ReplaceExisting => {
                    entry.owner = Some(conn_id);
                    entry.waiters.retain(|&w| w != conn_id);
                    Ok(AcquireOutcome::Replaced(owner))
                }
                AcquireMode::Queue => {
                    if !entry.waiters.contains(&conn_id) {
                        entry.waiters.push_back(conn_id);
                    }
                    Ok(AcquireOutcome::Queued)
                }
            },
        }
    }

    /// Release `name` from `conn_id`'s ownership, promoting the head
    /// waiter if one is queued. Returns the newly promoted owner, if any.
    pub fn release(&mut self, name: &str, conn_id: u64) -> Result<Option<u64>> {
        let Some(entry) = self.names.get_mut(name) else {
            return Err(Error::InvalidArgument(format!("name {name} is not registered")));
        };
        if entry.owner != Some(conn_id) {
            return Err(Error::InvalidArgument(format!(
                "connection {conn_id} does not own name {name}"
            )));
        }
        entry.owner = entry.waiters.pop_front();
        if entry.owner.is_none() && entry.waiters.is_empty() {
            self.names.remove(name);
        }
        Ok(entry.owner)
    }

    /// Remove `conn_id` from every name it owns or is queued for.
    /// Returns `(name, new_owner)` for every name whose ownership changed
    /// as a result, so the caller can notify newly promoted owners.
    pub fn remove_connection(&mut self, conn_id: u64) -> Vec<(String, Option<u64>)> {
        let mut changed = Vec::new();
        self.names.retain(|name, entry| {
            let mut touched = false;
            if entry.owner == Some(conn_id) {
                entry.owner = entry.waiters.pop_front();
                touched = true;
            } else if entry.waiters.contains(&conn_id) {
                entry.waiters.retain(|&w| w != conn_id);
                touched = false;
            }
            if touched {
                changed.push((name.clone(), entry.owner));
            }
            entry.owner.is_some() || !entry.waiters.is_empty()
        });
        changed
    }

    pub fn owner(&self, name: &str) -> Option<u64> {
        self.names.get(name).and_then(|e| e.owner)
    }

    pub fn waiter_count(&self, name: &str) -> usize {
        self.names.get(name).map(|e| e.waiters.len()).unwrap_or(0)
    }

    /// Snapshot every registered name with its owner and waiter count,
    /// sorted by name.
    pub fn list(&self) -> Vec<(String, Option<u64>, usize)> {
        let mut out: Vec<_> = self
            .names
            .iter()
            .map(|(name, entry)| (name.clone(), entry.owner, entry.waiters.len()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
